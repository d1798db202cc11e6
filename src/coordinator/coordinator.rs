use std::{mem, sync::Arc, time::Duration};

use comms::{Codec, F32Codec, MsgReceiver, MsgSender, NodeId, msg::Msg};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use super::{CoordinatorErr, LocalTrainer, Result, Status, StatusBoard};
use crate::{
    aggregation::{Aggregator, Mean, Strategy, Threshold},
    config::ClientConfig,
    weights::Weights,
};

/// The node the session's results are attributed to in the local aggregator.
const SESSION_NODE: &str = "session";

/// What a round ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// The session's aggregated weights and the round they are the starting point of.
    Global { weights: Weights, round: u64 },
    /// No result arrived in time, training goes on from the local weights.
    Local(Weights),
}

impl RoundOutcome {
    pub fn weights(&self) -> &Weights {
        match self {
            RoundOutcome::Global { weights, .. } => weights,
            RoundOutcome::Local(weights) => weights,
        }
    }

    pub fn into_weights(self) -> Weights {
        match self {
            RoundOutcome::Global { weights, .. } => weights,
            RoundOutcome::Local(weights) => weights,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, RoundOutcome::Global { .. })
    }
}

/// The answer to `ClientConnected`.
#[derive(Debug)]
struct Handshake {
    id: NodeId,
    round: u64,
    participants: usize,
    payload: Vec<u8>,
}

/// The nodes a peer round is run with, as handed out by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerList {
    pub round: u64,
    pub peers: Vec<NodeId>,
}

/// A global payload sent by the session.
#[derive(Debug)]
struct GlobalUpdate {
    round: u64,
    communication_round: usize,
    participants: usize,
    payload: Vec<u8>,
}

/// Drives a client through the rounds of a federated session.
///
/// Each round goes through `begin_round`, local training and `end_round`. Incoming messages are
/// handled by a background listener, so participant notices are processed while a round is
/// awaiting it's result.
///
/// The client keeps it's own `Aggregator` with the session as it's only node: the session's
/// results are contributions to it and it's round only moves when the session confirms one.
pub struct Coordinator<W, S = Mean, C = F32Codec>
where
    W: AsyncWrite + Unpin,
{
    pub(super) id: NodeId,
    tx: MsgSender<W>,
    pub(super) codec: C,
    aggregator: Aggregator<Weights, S>,
    session: NodeId,
    pub(super) result_timeout: Duration,
    participants: usize,
    global: Weights,
    ready: watch::Receiver<bool>,
    results: mpsc::UnboundedReceiver<GlobalUpdate>,
    peer_lists: mpsc::UnboundedReceiver<PeerList>,
    pub(super) status: Arc<StatusBoard>,
    pub(super) cancel: CancellationToken,
    listener: JoinHandle<()>,
}

impl<W> Coordinator<W>
where
    W: AsyncWrite + Unpin,
{
    /// Joins a session averaging weights exchanged as raw `f32` buffers.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    /// * `config` - The client configuration.
    ///
    /// # Returns
    /// A coordinator connected to the session or an error if the handshake failed.
    pub async fn connect<R>(
        rx: MsgReceiver<R>,
        tx: MsgSender<W>,
        config: &ClientConfig,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::connect_with(rx, tx, config, Mean, F32Codec).await
    }
}

impl<W, S, C> Coordinator<W, S, C>
where
    W: AsyncWrite + Unpin,
    S: Strategy<Weights>,
    C: Codec<Weights>,
{
    /// Joins a session with a custom strategy and payload codec.
    ///
    /// The strategy must run as many communication rounds per round as the session's does.
    pub async fn connect_with<R>(
        rx: MsgReceiver<R>,
        mut tx: MsgSender<W>,
        config: &ClientConfig,
        strategy: S,
        codec: C,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let status = Arc::new(StatusBoard::new());
        let cancel = CancellationToken::new();
        let (ready_tx, ready) = watch::channel(false);
        let (results_tx, results) = mpsc::unbounded_channel();
        let (peer_lists_tx, peer_lists) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = oneshot::channel();

        tx.send(&Msg::ClientConnected).await?;

        let listener = Listener {
            ready: ready_tx,
            results: results_tx,
            peer_lists: peer_lists_tx,
            status: Arc::clone(&status),
            handshake: Some(handshake_tx),
            pending: Vec::new(),
            min_participants: 0,
        };
        let listener = tokio::spawn(listener.listen(rx, cancel.clone()));

        let handshake = match handshake_rx.await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                cancel.cancel();
                return Err(e);
            }
            Err(_) => return Err(CoordinatorErr::HandshakeClosed),
        };

        let global = match codec.decode(&handshake.payload) {
            Ok(global) => global,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        info!(
            round = handshake.round, participants = handshake.participants;
            "joined the session as node {}", handshake.id.short()
        );

        let session = NodeId::from(SESSION_NODE);
        let mut aggregator = Aggregator::new(strategy, Threshold::everyone(), 0);
        aggregator.register_node(session.clone());
        aggregator.set_round(handshake.round);

        Ok(Self {
            id: handshake.id,
            tx,
            codec,
            aggregator,
            session,
            result_timeout: config.result_timeout(),
            participants: handshake.participants,
            global,
            ready,
            results,
            peer_lists,
            status,
            cancel,
            listener,
        })
    }

    /// The id the session assigned to this node.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The latest aggregation round the session confirmed.
    pub fn round(&self) -> u64 {
        self.aggregator.round()
    }

    /// The amount of participants last reported by the session.
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// The global weights received when joining.
    pub fn initial_weights(&self) -> &Weights {
        &self.global
    }

    pub fn status(&self) -> Option<Status> {
        self.status.current()
    }

    /// Subscribes to every status transition from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<Status> {
        self.status.subscribe()
    }

    /// A token that disconnects this coordinator from another task when cancelled.
    ///
    /// Cancelling it makes any in flight `begin_round` or `end_round` return
    /// `CoordinatorErr::Disconnected` right away.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts a round, suspending while the session waits for more participants.
    ///
    /// # Errors
    /// `CoordinatorErr::Disconnected` if the connection is lost or cancelled while waiting.
    pub async fn begin_round(&mut self) -> Result<()> {
        self.wait_for_participants().await?;
        self.status.publish(Status::Training);
        Ok(())
    }

    /// Suspends until the session has enough participants.
    ///
    /// Resumes on `EnoughParticipants` or on any later result reporting enough participants.
    pub(super) async fn wait_for_participants(&mut self) -> Result<()> {
        if *self.ready.borrow() {
            return Ok(());
        }

        self.status.publish(Status::WaitingForParticipants);
        info!(round = self.round(); "waiting for more participants");

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoordinatorErr::Disconnected),
            res = self.ready.wait_for(|ready| *ready) => {
                res.map(|_| ()).map_err(|_| CoordinatorErr::Disconnected)
            }
        }
    }

    /// Tells the session this node is ready for a peer round and waits for the other peers.
    ///
    /// # Returns
    /// The peer list or `None` if it didn't arrive within the result timeout.
    pub(super) async fn request_peers(&mut self) -> Result<Option<PeerList>> {
        while let Ok(outdated) = self.peer_lists.try_recv() {
            debug!(round = outdated.round; "dropping an outdated peer list");
        }

        self.tx.send(&Msg::PeerIsReady).await?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoordinatorErr::Disconnected),
            res = time::timeout(self.result_timeout, self.peer_lists.recv()) => match res {
                Ok(Some(list)) => Ok(Some(list)),
                Ok(None) => Err(CoordinatorErr::Disconnected),
                Err(_) => Ok(None),
            },
        }
    }

    /// Sends the locally trained `weights` and awaits the session's result.
    ///
    /// Repeats the exchange once per communication round, each payload is built by the strategy
    /// out of the previous result. If any result doesn't arrive within the configured timeout
    /// the round is closed locally and training goes on from the local weights. The round isn't
    /// advanced then, the next contribution is still made for the last round the session
    /// confirmed.
    ///
    /// # Arguments
    /// * `weights` - The locally trained weights.
    ///
    /// # Returns
    /// The outcome of the round.
    pub async fn end_round(&mut self, weights: Weights) -> Result<RoundOutcome> {
        self.status.publish(Status::UpdatingModel);

        let mut current = weights.clone();
        loop {
            let sent = (
                self.aggregator.round(),
                self.aggregator.communication_round(),
            );

            let payload = self
                .aggregator
                .make_payloads(&current)
                .remove(&self.session)
                .unwrap_or_else(|| current.clone());
            let msg = Msg::SendPayload {
                round: sent.0,
                communication_round: sent.1,
                payload: self.codec.encode(&payload),
            };

            if self.cancel.is_cancelled() {
                return Err(CoordinatorErr::Disconnected);
            }
            self.tx.send(&msg).await?;

            let Some(update) = self.await_result(sent).await? else {
                warn!(
                    round = sent.0, communication_round = sent.1;
                    "no result within {:?}, continuing with the local weights",
                    self.result_timeout
                );
                return Ok(RoundOutcome::Local(weights));
            };

            let result = self.codec.decode(&update.payload)?;
            self.participants = update.participants;

            let aggregation =
                self.aggregator
                    .add(self.session.clone(), result, sent.0, Some(sent.1))?;
            let completed = match aggregation {
                Some(aggregation) => {
                    current = (*aggregation.payload).clone();
                    aggregation.completes_round
                }
                None => false,
            };

            self.aggregator.set_round(update.round);
            if completed || update.round > sent.0 {
                break;
            }
        }

        debug!(round = self.round(); "global weights received");
        Ok(RoundOutcome::Global {
            weights: current,
            round: self.round(),
        })
    }

    /// Trains for `rounds` rounds starting from the weights received when joining.
    ///
    /// # Returns
    /// The weights after the last round.
    pub async fn run<T>(&mut self, trainer: &mut T, rounds: usize) -> Result<Weights>
    where
        T: LocalTrainer,
    {
        let mut weights = self.global.clone();

        for _ in 0..rounds {
            self.begin_round().await?;
            let trained = trainer.train(weights, self.round());
            weights = self.end_round(trained).await?.into_weights();
        }

        Ok(weights)
    }

    /// Leaves the session, releasing every pending wait.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.status.publish(Status::Disconnected);

        self.tx.send(&Msg::Disconnect).await?;
        self.tx.shutdown().await?;
        info!("node {} left the session", self.id.short());
        Ok(())
    }

    /// Waits for the first result that moved the session past `sent`, the position of the
    /// contribution just made.
    ///
    /// # Returns
    /// The result or `None` on timeout.
    async fn await_result(&mut self, sent: (u64, usize)) -> Result<Option<GlobalUpdate>> {
        let results = &mut self.results;
        let wait = async move {
            while let Some(update) = results.recv().await {
                if (update.round, update.communication_round) > sent {
                    return Ok(update);
                }

                debug!(
                    round = update.round, communication_round = update.communication_round;
                    "ignoring an outdated result"
                );
            }

            Err(CoordinatorErr::Disconnected)
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoordinatorErr::Disconnected),
            res = time::timeout(self.result_timeout, wait) => match res {
                Ok(update) => update.map(Some),
                Err(_) => Ok(None),
            },
        }
    }
}

impl<W, S, C> Drop for Coordinator<W, S, C>
where
    W: AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        self.cancel.cancel();
        self.listener.abort();
    }
}

/// Handles every message the session sends.
struct Listener {
    ready: watch::Sender<bool>,
    results: mpsc::UnboundedSender<GlobalUpdate>,
    peer_lists: mpsc::UnboundedSender<PeerList>,
    status: Arc<StatusBoard>,
    handshake: Option<oneshot::Sender<Result<Handshake>>>,
    /// Participant notices that arrived before the handshake.
    pending: Vec<Msg>,
    min_participants: usize,
}

impl Listener {
    async fn listen<R>(mut self, mut rx: MsgReceiver<R>, cancel: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv::<Msg>() => msg,
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        warn!("connection failed: {e}");
                    }
                    break;
                }
            };

            if !self.dispatch(msg) {
                break;
            }
        }

        self.status.publish(Status::Disconnected);
    }

    /// Handles a single message.
    ///
    /// # Returns
    /// `false` if the connection must be closed.
    fn dispatch(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::NodeInfo {
                id,
                wait_for_more_participants,
                round,
                participants,
                min_participants,
                payload,
            } => {
                let Some(reply) = self.handshake.take() else {
                    warn!("ignoring a repeated node_info");
                    return true;
                };

                self.min_participants = min_participants;
                self.set_ready(!wait_for_more_participants);
                for notice in mem::take(&mut self.pending) {
                    self.dispatch(notice);
                }

                let handshake = Handshake {
                    id,
                    round,
                    participants,
                    payload,
                };
                let _ = reply.send(Ok(handshake));
            }
            Msg::EnoughParticipants | Msg::WaitingForMoreParticipants
                if self.handshake.is_some() =>
            {
                debug!("buffering {} until the handshake completes", msg.kind());
                self.pending.push(msg);
            }
            Msg::EnoughParticipants => self.set_ready(true),
            Msg::WaitingForMoreParticipants => self.set_ready(false),
            Msg::Disconnect => {
                info!("the session was closed by the server");
                return false;
            }
            msg if self.handshake.is_some() => {
                if let Msg::Err(detail) = &msg {
                    warn!("server rejected the handshake: {detail}");
                }

                let got = msg.kind();
                if let Some(reply) = self.handshake.take() {
                    let _ = reply.send(Err(CoordinatorErr::UnexpectedMessage { got }));
                }
                return false;
            }
            Msg::ReceiveGlobalPayload {
                round,
                communication_round,
                participants,
                payload,
            } => {
                self.follow_participants(participants);

                let update = GlobalUpdate {
                    round,
                    communication_round,
                    participants,
                    payload,
                };
                let _ = self.results.send(update);
            }
            Msg::PeersForRound { round, peers } => {
                let _ = self.peer_lists.send(PeerList { round, peers });
            }
            Msg::Err(detail) => warn!("server error: {detail}"),
            msg => warn!("ignoring an unexpected {}", msg.kind()),
        }

        true
    }

    /// Keeps readiness in line with the participant count a result reports, a lost participant
    /// notice is made up for by the next result.
    fn follow_participants(&self, participants: usize) {
        let ready = participants >= self.min_participants;

        if ready != *self.ready.borrow() {
            debug!(
                participants = participants, min = self.min_participants;
                "participant count changed without a notice"
            );
            self.set_ready(ready);
        }
    }

    fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);

        if !ready {
            self.status.publish(Status::WaitingForParticipants);
        }
    }
}
