use std::{
    collections::{BTreeMap, BTreeSet},
    io, mem,
    sync::Arc,
};

use comms::{Codec, NodeId, msg::Msg};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregation::{Aggregation, AggregationFuture, Aggregator, Strategy},
    weights::Weights,
};

/// Generates candidate node ids, the session retries until one is unused.
pub type IdGenerator = Box<dyn FnMut() -> NodeId + Send>;

/// Generates random 16 hex digit node ids.
pub fn random_id() -> NodeId {
    NodeId::new(format!("{:016x}", rand::rng().random::<u64>()))
}

/// A connected node.
struct Peer {
    outbox: UnboundedSender<Msg>,
    cancel: CancellationToken,
}

/// Everything the connection tasks share, always accessed under a single lock.
pub(super) struct SessionState<S, C> {
    aggregator: Aggregator<Weights, S>,
    codec: C,
    peers: BTreeMap<NodeId, Peer>,
    global: Arc<Weights>,
    encoded: Vec<u8>,
    position: (u64, usize),
    min_participants: usize,
    waiting: bool,
    /// Nodes that asked to start the next peer round.
    ready: BTreeSet<NodeId>,
    peer_round: u64,
    next_id: IdGenerator,
}

impl<S, C> SessionState<S, C>
where
    S: Strategy<Weights>,
    C: Codec<Weights>,
{
    /// Creates a new `SessionState`.
    ///
    /// # Arguments
    /// * `aggregator` - The aggregator every contribution goes through.
    /// * `global` - The global weights served until the first aggregation.
    /// * `codec` - The payload codec.
    /// * `min_participants` - The amount of nodes needed for training to proceed.
    pub(super) fn new(
        aggregator: Aggregator<Weights, S>,
        global: Weights,
        codec: C,
        min_participants: usize,
    ) -> Self {
        let encoded = codec.encode(&global);
        let position = (aggregator.round(), aggregator.communication_round());
        let waiting = aggregator.roster().len() < min_participants;

        Self {
            aggregator,
            codec,
            peers: BTreeMap::new(),
            global: Arc::new(global),
            encoded,
            position,
            min_participants,
            waiting,
            ready: BTreeSet::new(),
            peer_round: 0,
            next_id: Box::new(random_id),
        }
    }

    pub(super) fn set_id_generator(&mut self, next_id: IdGenerator) {
        self.next_id = next_id;
    }

    pub(super) fn round(&self) -> u64 {
        self.aggregator.round()
    }

    pub(super) fn participants(&self) -> usize {
        self.aggregator.roster().len()
    }

    pub(super) fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub(super) fn global(&self) -> Arc<Weights> {
        Arc::clone(&self.global)
    }

    /// Admits a new node, registering it and answering with it's `NodeInfo`.
    ///
    /// # Arguments
    /// * `outbox` - Where messages for the node are queued.
    /// * `cancel` - Cancels every task working on behalf of the node.
    ///
    /// # Returns
    /// The id assigned to the node.
    pub(super) fn admit(
        &mut self,
        outbox: UnboundedSender<Msg>,
        cancel: CancellationToken,
    ) -> NodeId {
        let id = self.fresh_id();
        self.aggregator.register_node(id.clone());

        let participants = self.participants();
        info!(participants = participants; "node {} joined", id.short());

        let info = Msg::NodeInfo {
            id: id.clone(),
            wait_for_more_participants: participants < self.min_participants,
            round: self.position.0,
            participants,
            min_participants: self.min_participants,
            payload: self.encoded.clone(),
        };
        let _ = outbox.send(info);

        self.peers.insert(id.clone(), Peer { outbox, cancel });

        if self.waiting && participants >= self.min_participants {
            info!("enough participants, resuming training");
            self.waiting = false;
            self.broadcast(Some(&id), Msg::EnoughParticipants);
        }

        id
    }

    /// Handles a contribution from `node`.
    ///
    /// Undecodable, wrongly shaped and invalid contributions are answered right away with the
    /// latest global payload. Otherwise a subscription to the next aggregation is taken before
    /// the contribution is added, so the node can't miss the result it triggers.
    ///
    /// # Returns
    /// The subscription if the contribution was accepted.
    pub(super) fn contribute(
        &mut self,
        node: &NodeId,
        round: u64,
        communication_round: usize,
        payload: &[u8],
    ) -> io::Result<Option<AggregationFuture<Weights>>> {
        let weights = match self.codec.decode(payload) {
            Ok(weights) if weights.len() == self.global.len() => weights,
            Ok(weights) => {
                warn!(
                    got = weights.len(), expected = self.global.len();
                    "node {} sent weights of the wrong shape", node.short()
                );
                self.send_global(node);
                return Ok(None);
            }
            Err(e) => {
                warn!("node {} sent an undecodable payload: {e}", node.short());
                self.send_global(node);
                return Ok(None);
            }
        };

        if !self.aggregator.is_valid_contribution(node, round) {
            debug!(
                round = round, current = self.aggregator.round();
                "replying to stale node {} with the latest global weights", node.short()
            );
            self.send_global(node);
            return Ok(None);
        }

        let result = self.aggregator.subscribe();
        let aggregation = self.aggregator.add(
            node.clone(),
            weights,
            round,
            Some(communication_round),
        )?;

        if let Some(aggregation) = aggregation {
            self.publish(&aggregation);
        }

        Ok(Some(result))
    }

    /// Removes `node` from the session, cancelling every task waiting on it's behalf.
    pub(super) fn leave(&mut self, node: &NodeId) {
        let Some(peer) = self.peers.remove(node) else {
            return;
        };

        peer.cancel.cancel();
        self.ready.remove(node);

        if let Some(aggregation) = self.aggregator.remove_node(node) {
            self.publish(&aggregation);
        }

        let participants = self.participants();
        info!(participants = participants; "node {} left", node.short());

        if !self.waiting && participants < self.min_participants {
            info!("not enough participants, pausing training");
            self.waiting = true;
            self.broadcast(None, Msg::WaitingForMoreParticipants);
        }

        self.release_peers();
    }

    /// Marks `node` as ready for the next peer round.
    pub(super) fn peer_ready(&mut self, node: &NodeId) {
        if !self.peers.contains_key(node) {
            return;
        }

        if self.ready.insert(node.clone()) {
            debug!(
                ready = self.ready.len(), participants = self.peers.len();
                "node {} is ready for peer round {}", node.short(), self.peer_round
            );
        }

        self.release_peers();
    }

    /// Starts a peer round once every connected node is ready and there are enough of them.
    ///
    /// Each ready node gets the list of the others, the round number is the same for all of them.
    fn release_peers(&mut self) {
        if self.waiting || self.ready.is_empty() || self.ready.len() < self.peers.len() {
            return;
        }

        let round = self.peer_round;
        let ready = mem::take(&mut self.ready);
        info!(round = round, peers = ready.len(); "starting a peer round");

        for node in &ready {
            let peers = ready.iter().filter(|id| *id != node).cloned().collect();
            self.send_to(node, Msg::PeersForRound { round, peers });
        }

        self.peer_round += 1;
    }

    /// Builds the message delivering `aggregation` to a node that waited for it.
    pub(super) fn result_msg(&self, aggregation: &Aggregation<Weights>) -> Msg {
        let (round, communication_round) = aggregation.next_position();

        let payload = if Arc::ptr_eq(&self.global, &aggregation.payload) {
            self.encoded.clone()
        } else {
            self.codec.encode(&aggregation.payload)
        };

        Msg::ReceiveGlobalPayload {
            round,
            communication_round,
            participants: self.participants(),
            payload,
        }
    }

    /// Caches `aggregation` as the latest global payload.
    fn publish(&mut self, aggregation: &Aggregation<Weights>) {
        self.global = Arc::clone(&aggregation.payload);
        self.encoded = self.codec.encode(&self.global);
        self.position = aggregation.next_position();
    }

    /// Replies to `node` with the cached global payload and the position it's the start of.
    fn send_global(&self, node: &NodeId) {
        let (round, communication_round) = self.position;
        let msg = Msg::ReceiveGlobalPayload {
            round,
            communication_round,
            participants: self.participants(),
            payload: self.encoded.clone(),
        };

        self.send_to(node, msg);
    }

    fn send_to(&self, node: &NodeId, msg: Msg) {
        if let Some(peer) = self.peers.get(node) {
            let _ = peer.outbox.send(msg);
        }
    }

    /// Queues `msg` for every node except `skip`.
    fn broadcast(&self, skip: Option<&NodeId>, msg: Msg) {
        self.peers
            .iter()
            .filter(|(id, _)| Some(*id) != skip)
            .for_each(|(_, peer)| {
                let _ = peer.outbox.send(msg.clone());
            });
    }

    /// Draws ids until one is neither connected nor in the roster.
    fn fresh_id(&mut self) -> NodeId {
        loop {
            let id = (self.next_id)();
            if !self.peers.contains_key(&id) && !self.aggregator.roster().contains(&id) {
                return id;
            }

            debug!("node id {id} is taken, drawing another one");
        }
    }
}
