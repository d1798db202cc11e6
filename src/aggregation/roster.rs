use std::collections::BTreeSet;

use comms::NodeId;

/// The set of nodes a round is computed against.
///
/// It doesn't validate anything beyond uniqueness, the `Aggregator` reconciles it against
/// the contributions it receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    nodes: BTreeSet<NodeId>,
}

impl Roster {
    /// Creates a new empty `Roster`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `node` to the roster.
    ///
    /// # Returns
    /// `true` if the node wasn't already present.
    pub fn register(&mut self, node: NodeId) -> bool {
        self.nodes.insert(node)
    }

    /// Removes `node` from the roster.
    ///
    /// # Returns
    /// `true` if the node was present.
    pub fn remove(&mut self, node: &NodeId) -> bool {
        self.nodes.remove(node)
    }

    /// Replaces every node of the roster with `nodes`.
    pub fn replace<I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        self.nodes = nodes.into_iter().collect();
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over the nodes in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }
}

impl FromIterator<NodeId> for Roster {
    fn from_iter<T: IntoIterator<Item = NodeId>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}
