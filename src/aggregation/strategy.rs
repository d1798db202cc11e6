use std::collections::BTreeMap;

use comms::NodeId;

use super::Roster;
use crate::weights::Weights;

/// How the contributions of a round are combined into its result.
///
/// `combine` must be order independent (commutative and associative), the `Aggregator`
/// feeds it contributions sorted by node id so floating point results don't depend on
/// arrival order either.
pub trait Strategy<P: Clone> {
    /// Combines the contributions of a communication round into a single payload.
    ///
    /// # Arguments
    /// * `communication_round` - The communication round being aggregated.
    /// * `contributions` - Every retained contribution, never empty.
    ///
    /// # Returns
    /// The result of the communication round.
    fn combine(&self, communication_round: usize, contributions: &[&P]) -> P;

    /// The amount of communication rounds each aggregation round is made of.
    fn communication_rounds(&self) -> usize {
        1
    }

    /// Builds what to send to each node of `roster` as it's contribution to
    /// `communication_round`.
    ///
    /// Every node gets `base` unless the scheme needs per node payloads.
    fn make_payloads(
        &mut self,
        _communication_round: usize,
        base: &P,
        roster: &Roster,
    ) -> BTreeMap<NodeId, P> {
        roster
            .iter()
            .map(|node| (node.clone(), base.clone()))
            .collect()
    }
}

/// Averages the contributed weights, federated averaging.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

impl Strategy<Weights> for Mean {
    fn combine(&self, _communication_round: usize, contributions: &[&Weights]) -> Weights {
        Weights::mean(contributions.iter().copied()).unwrap_or_default()
    }
}

/// Adds the contributed weights together.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Strategy<Weights> for Sum {
    fn combine(&self, _communication_round: usize, contributions: &[&Weights]) -> Weights {
        Weights::sum(contributions.iter().copied()).unwrap_or_default()
    }
}
