use std::collections::BTreeMap;

use comms::NodeId;

/// A single node's payload together with the aggregation round it was submitted for.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution<P> {
    pub round: u64,
    pub payload: P,
}

/// Buffers contributions per communication round and node.
///
/// Holds at most one contribution for each `(communication round, node)` pair, a later
/// submission overwrites the former. Contributions are kept sorted by node id so that every
/// read yields them in the same order no matter how they arrived.
#[derive(Debug, Clone)]
pub struct ContributionStore<P> {
    rounds: BTreeMap<usize, BTreeMap<NodeId, Contribution<P>>>,
}

impl<P> Default for ContributionStore<P> {
    fn default() -> Self {
        Self {
            rounds: BTreeMap::new(),
        }
    }
}

impl<P> ContributionStore<P> {
    /// Creates a new empty `ContributionStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `payload` as `node`'s contribution for `communication_round`.
    ///
    /// # Arguments
    /// * `node` - The contributing node.
    /// * `communication_round` - The communication round it contributes to.
    /// * `round` - The aggregation round the node submitted for.
    /// * `payload` - The contributed payload.
    ///
    /// # Returns
    /// `true` if a previous contribution was overwritten.
    pub fn insert(
        &mut self,
        node: NodeId,
        communication_round: usize,
        round: u64,
        payload: P,
    ) -> bool {
        self.rounds
            .entry(communication_round)
            .or_default()
            .insert(node, Contribution { round, payload })
            .is_some()
    }

    /// The amount of distinct nodes that contributed to `communication_round`.
    pub fn count(&self, communication_round: usize) -> usize {
        self.rounds
            .get(&communication_round)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }

    /// Returns `node`'s contribution to `communication_round`, if any.
    pub fn get(&self, communication_round: usize, node: &NodeId) -> Option<&Contribution<P>> {
        self.rounds.get(&communication_round)?.get(node)
    }

    /// Iterates over the payloads of `communication_round` in ascending node id order.
    pub fn payloads(&self, communication_round: usize) -> impl Iterator<Item = &P> {
        self.rounds
            .get(&communication_round)
            .into_iter()
            .flat_map(|contributions| contributions.values())
            .map(|contribution| &contribution.payload)
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.values().all(BTreeMap::is_empty)
    }

    /// Drops every buffered contribution.
    pub fn clear(&mut self) {
        self.rounds.clear();
    }
}
