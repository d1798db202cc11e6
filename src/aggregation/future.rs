use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

/// The result of one aggregation step.
#[derive(Debug)]
pub struct Aggregation<P> {
    /// The aggregation round that was aggregated.
    pub round: u64,
    /// The communication round that was aggregated.
    pub communication_round: usize,
    /// Whether this was the last communication round of `round`.
    pub completes_round: bool,
    pub payload: Arc<P>,
}

impl<P> Aggregation<P> {
    /// The `(round, communication round)` position the aggregator moved to after this step.
    pub fn next_position(&self) -> (u64, usize) {
        if self.completes_round {
            (self.round + 1, 0)
        } else {
            (self.round, self.communication_round + 1)
        }
    }
}

impl<P> Clone for Aggregation<P> {
    fn clone(&self) -> Self {
        Self {
            round: self.round,
            communication_round: self.communication_round,
            completes_round: self.completes_round,
            payload: Arc::clone(&self.payload),
        }
    }
}

/// Resolves with the first aggregation produced after it was created.
///
/// Resolves with `None` if the aggregator is dropped first. Dropping the future releases it's
/// subscription.
#[derive(Debug)]
pub struct AggregationFuture<P> {
    rx: oneshot::Receiver<Aggregation<P>>,
}

impl<P> AggregationFuture<P> {
    pub(super) fn new(rx: oneshot::Receiver<Aggregation<P>>) -> Self {
        Self { rx }
    }
}

impl<P> Future for AggregationFuture<P> {
    type Output = Option<Aggregation<P>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(Result::ok)
    }
}
