use std::{collections::BTreeMap, sync::Arc};

use comms::NodeId;
use log::{debug, info};
use tokio::sync::oneshot;

use super::{
    Aggregation, AggregationErr, AggregationFuture, ContributionStore, Result, Roster, Strategy,
    Threshold,
};

/// Buffers contributions for the current round and combines them once the round is full.
///
/// The aggregator is the single owner of the round counters, the roster and the contributions.
/// Every mutation is synchronous, so whoever shares it behind a lock gets subscription and
/// aggregation as one atomic step.
pub struct Aggregator<P, S> {
    strategy: S,
    threshold: Threshold,
    round_cutoff: u64,
    round: u64,
    communication_round: usize,
    roster: Roster,
    store: ContributionStore<P>,
    waiters: Vec<oneshot::Sender<Aggregation<P>>>,
}

impl<P, S> Aggregator<P, S>
where
    P: Clone,
    S: Strategy<P>,
{
    /// Creates a new `Aggregator`.
    ///
    /// # Arguments
    /// * `strategy` - How contributions are combined.
    /// * `threshold` - When a round is full.
    /// * `round_cutoff` - How many rounds behind a contribution may be and still be accepted.
    ///
    /// # Returns
    /// A new `Aggregator` at round 0 with an empty roster.
    pub fn new(strategy: S, threshold: Threshold, round_cutoff: u64) -> Self {
        Self {
            strategy,
            threshold,
            round_cutoff,
            round: 0,
            communication_round: 0,
            roster: Roster::new(),
            store: ContributionStore::new(),
            waiters: Vec::new(),
        }
    }

    /// The current aggregation round.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The current communication round within the aggregation round.
    pub fn communication_round(&self) -> usize {
        self.communication_round
    }

    /// The amount of communication rounds each aggregation round is made of.
    pub fn communication_rounds(&self) -> usize {
        self.strategy.communication_rounds().max(1)
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn contributions(&self) -> &ContributionStore<P> {
        &self.store
    }

    /// Whether a contribution from `node` for `round` may be added.
    ///
    /// It must come from a roster node and be at most `round_cutoff` rounds old. Contributions for
    /// rounds ahead of the current one are accepted.
    pub fn is_valid_contribution(&self, node: &NodeId, round: u64) -> bool {
        if !self.roster.contains(node) {
            debug!("contribution rejected, node {} is not registered", node.short());
            return false;
        }

        if self.round.saturating_sub(round) > self.round_cutoff {
            debug!(
                round = round, current = self.round;
                "contribution from node {} rejected, round is past the cutoff",
                node.short()
            );
            return false;
        }

        true
    }

    /// Adds `node`'s contribution and aggregates if this fills the round.
    ///
    /// # Arguments
    /// * `node` - The contributing node.
    /// * `payload` - It's contribution.
    /// * `round` - The aggregation round it was made for.
    /// * `communication_round` - The communication round it was made for, the current one if
    ///   `None`.
    ///
    /// # Returns
    /// The aggregation this contribution triggered, if any.
    ///
    /// # Errors
    /// `AggregationErr::InvalidContribution` if `is_valid_contribution` rejects it, callers
    /// must screen contributions beforehand and decide how to answer a rejected node.
    pub fn add(
        &mut self,
        node: NodeId,
        payload: P,
        round: u64,
        communication_round: Option<usize>,
    ) -> Result<Option<Aggregation<P>>> {
        if !self.is_valid_contribution(&node, round) {
            return Err(AggregationErr::InvalidContribution {
                node,
                round,
                current: self.round,
            });
        }

        let communication_round = communication_round.unwrap_or(self.communication_round);
        let short = node.short().to_string();
        let replaced = self.store.insert(node, communication_round, round, payload);

        let step = if replaced { "updating" } else { "adding" };
        debug!(
            round = self.round, communication_round = communication_round;
            "{step} contribution from node {short}"
        );

        Ok(self.try_aggregate())
    }

    /// Subscribes to the next aggregation.
    ///
    /// Must be called before the contribution that may trigger the aggregation is added, else
    /// the result is missed.
    pub fn subscribe(&mut self) -> AggregationFuture<P> {
        self.waiters.retain(|tx| !tx.is_closed());

        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        AggregationFuture::new(rx)
    }

    /// Adds `node` to the roster.
    ///
    /// # Returns
    /// `true` if the node is new.
    pub fn register_node(&mut self, node: NodeId) -> bool {
        self.roster.register(node)
    }

    /// Removes `node` from the roster.
    ///
    /// A smaller roster may fill the current round without any new contribution.
    ///
    /// # Returns
    /// The aggregation the removal triggered, if any.
    pub fn remove_node(&mut self, node: &NodeId) -> Option<Aggregation<P>> {
        if !self.roster.remove(node) {
            return None;
        }

        self.try_aggregate()
    }

    /// Overwrites the roster with `nodes`.
    ///
    /// # Returns
    /// The aggregation the new roster triggered, if any.
    pub fn set_nodes<I>(&mut self, nodes: I) -> Option<Aggregation<P>>
    where
        I: IntoIterator<Item = NodeId>,
    {
        self.roster.replace(nodes);
        self.try_aggregate()
    }

    /// Empties the roster, used between training rounds when peers change every round.
    pub fn reset_nodes(&mut self) {
        self.roster = Roster::new();
    }

    /// Moves the aggregator forward to `round`, starting at it's first communication round.
    ///
    /// Contributions buffered for the abandoned round are dropped.
    ///
    /// # Returns
    /// `false` if `round` isn't ahead of the current round, which is left unchanged.
    pub fn set_round(&mut self, round: u64) -> bool {
        if round <= self.round {
            return false;
        }

        debug!(from = self.round, to = round; "catching up to a newer round");
        self.round = round;
        self.communication_round = 0;
        self.store.clear();
        true
    }

    /// Builds the payloads to send to each roster node out of `base` for the current
    /// communication round.
    pub fn make_payloads(&mut self, base: &P) -> BTreeMap<NodeId, P> {
        self.strategy.make_payloads(self.communication_round, base, &self.roster)
    }

    /// Combines the current communication round if it's full, then advances the counters and
    /// notifies every subscriber.
    fn try_aggregate(&mut self) -> Option<Aggregation<P>> {
        let communication_round = self.communication_round;
        let count = self.store.count(communication_round);

        if !self.threshold.is_full(count, self.roster.len()) {
            return None;
        }

        info!(
            round = self.round, communication_round = communication_round, contributions = count;
            "round is full, aggregating"
        );

        let contributions: Vec<&P> = self.store.payloads(communication_round).collect();
        let payload = self.strategy.combine(communication_round, &contributions);

        let completes_round = communication_round + 1 >= self.communication_rounds();
        let aggregation = Aggregation {
            round: self.round,
            communication_round,
            completes_round,
            payload: Arc::new(payload),
        };

        if completes_round {
            self.communication_round = 0;
            self.round += 1;
            self.store.clear();
        } else {
            self.communication_round += 1;
        }

        for tx in self.waiters.drain(..) {
            let _ = tx.send(aggregation.clone());
        }

        Some(aggregation)
    }
}
