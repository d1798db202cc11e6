use std::{io, sync::Arc, time::Duration};

use comms::{Codec, F32Codec, MsgReceiver, MsgSender, NodeId, msg::Msg};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinSet},
    time,
};
use tokio_util::sync::CancellationToken;

use super::state::{IdGenerator, SessionState};
use crate::{
    aggregation::{AggregationFuture, Aggregator, Strategy},
    weights::Weights,
};

const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The server side of a federated session.
///
/// Multiplexes every connected node onto a single `Aggregator`. Each connection gets a reader
/// task, a writer task fed through an unbounded outbox, and a short lived task forwarding the
/// aggregation it's latest accepted contribution waits for. Nodes running peer rounds are handed
/// the list of their peers once all of them are ready.
pub struct SessionController<S, C = F32Codec> {
    state: Arc<Mutex<SessionState<S, C>>>,
    tasks: JoinSet<io::Result<()>>,
    shutdown: CancellationToken,
    result_timeout: Duration,
}

impl<S> SessionController<S>
where
    S: Strategy<Weights> + Send + 'static,
{
    /// Creates a new `SessionController` exchanging weights as raw `f32` buffers.
    ///
    /// # Arguments
    /// * `aggregator` - The aggregator every contribution goes through.
    /// * `global` - The global weights served until the first aggregation.
    /// * `min_participants` - The amount of nodes needed for training to proceed.
    ///
    /// # Returns
    /// A new `SessionController` instance.
    pub fn new(
        aggregator: Aggregator<Weights, S>,
        global: Weights,
        min_participants: usize,
    ) -> Self {
        Self::with_codec(aggregator, global, min_participants, F32Codec)
    }
}

impl<S, C> SessionController<S, C>
where
    S: Strategy<Weights> + Send + 'static,
    C: Codec<Weights> + Send + 'static,
{
    /// Creates a new `SessionController` with a custom payload codec.
    pub fn with_codec(
        aggregator: Aggregator<Weights, S>,
        global: Weights,
        min_participants: usize,
        codec: C,
    ) -> Self {
        let state = SessionState::new(aggregator, global, codec, min_participants);

        Self {
            state: Arc::new(Mutex::new(state)),
            tasks: JoinSet::new(),
            shutdown: CancellationToken::new(),
            result_timeout: DEFAULT_RESULT_TIMEOUT,
        }
    }

    /// Sets how long a contribution waits for it's aggregation before giving up.
    pub fn with_result_timeout(mut self, result_timeout: Duration) -> Self {
        self.result_timeout = result_timeout;
        self
    }

    /// Replaces the random node id generator.
    pub fn with_id_generator<F>(self, next_id: F) -> Self
    where
        F: FnMut() -> NodeId + Send + 'static,
    {
        self.state.lock().set_id_generator(Box::new(next_id) as IdGenerator);
        self
    }

    /// The current aggregation round.
    pub fn round(&self) -> u64 {
        self.state.lock().round()
    }

    /// The amount of connected nodes.
    pub fn participants(&self) -> usize {
        self.state.lock().participants()
    }

    /// Whether training is paused until more nodes join.
    pub fn is_waiting(&self) -> bool {
        self.state.lock().is_waiting()
    }

    /// The latest global weights.
    pub fn global(&self) -> Arc<Weights> {
        self.state.lock().global()
    }

    /// Binds a new node connection to this session and spawns it's tasks.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: MsgReceiver<R>, tx: MsgSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(res) = self.tasks.try_join_next() {
            Self::report(res);
        }

        let (outbox, inbox) = mpsc::unbounded_channel();
        let connection = Connection {
            state: Arc::clone(&self.state),
            outbox,
            cancel: self.shutdown.child_token(),
            result_timeout: self.result_timeout,
            forward: None,
        };

        self.tasks.spawn(write_loop(tx, inbox));
        self.tasks.spawn(connection.serve(rx));
    }

    /// Waits for every connection to finish.
    ///
    /// A failing connection is logged, it never brings the session down.
    pub async fn run(&mut self) -> io::Result<()> {
        while let Some(res) = self.tasks.join_next().await {
            Self::report(res);
        }

        Ok(())
    }

    /// Disconnects every node, `run` returns once they are gone.
    pub fn shutdown(&self) {
        info!("shutting the session down");
        self.shutdown.cancel();
    }

    fn report(res: Result<io::Result<()>, JoinError>) {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("connection failed: {e}"),
            Err(e) => warn!("connection task panicked: {e}"),
        }
    }
}

/// Drains the node's outbox into the wire until every sender is gone or `Disconnect` is sent.
async fn write_loop<W>(mut tx: MsgSender<W>, mut inbox: UnboundedReceiver<Msg>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = inbox.recv().await {
        tx.send(&msg).await?;

        if let Msg::Disconnect = msg {
            break;
        }
    }

    tx.shutdown().await
}

/// A single node connection as seen by the reader task.
struct Connection<S, C> {
    state: Arc<Mutex<SessionState<S, C>>>,
    outbox: UnboundedSender<Msg>,
    cancel: CancellationToken,
    result_timeout: Duration,
    /// Cancels the forward of the previous contribution, a node waits for one result at a time.
    forward: Option<CancellationToken>,
}

impl<S, C> Connection<S, C>
where
    S: Strategy<Weights> + Send + 'static,
    C: Codec<Weights> + Send + 'static,
{
    /// Runs the handshake and then serves the node until it leaves.
    async fn serve<R>(mut self, mut rx: MsgReceiver<R>) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let msg = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            msg = rx.recv::<Msg>() => msg?,
        };

        let Msg::ClientConnected = msg else {
            let _ = self.outbox.send(Msg::Err("expected client_connected".into()));
            return Self::unexpected_message_kind(msg);
        };

        let id = self
            .state
            .lock()
            .admit(self.outbox.clone(), self.cancel.clone());

        let res = self.read_loop(&mut rx, &id).await;
        self.state.lock().leave(&id);
        res
    }

    async fn read_loop<R>(&mut self, rx: &mut MsgReceiver<R>, id: &NodeId) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.outbox.send(Msg::Disconnect);
                    return Ok(());
                }
                msg = rx.recv::<Msg>() => msg,
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("node {} closed the connection", id.short());
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match msg {
                Msg::SendPayload {
                    round,
                    communication_round,
                    payload,
                } => {
                    let result =
                        self.state
                            .lock()
                            .contribute(id, round, communication_round, &payload)?;

                    if let Some(result) = result {
                        self.forward_result(id, result);
                    }
                }
                Msg::PeerIsReady => self.state.lock().peer_ready(id),
                Msg::Disconnect => {
                    debug!("node {} disconnected", id.short());
                    return Ok(());
                }
                msg => {
                    warn!("node {} sent an unexpected {}", id.short(), msg.kind());
                    let detail = format!("unexpected {} message", msg.kind());
                    let _ = self.outbox.send(Msg::Err(detail));
                }
            }
        }
    }

    /// Waits for the aggregation `result` resolves to and queues it for the node.
    ///
    /// Replaces the forward of the node's previous contribution, a resubmission within a round
    /// still yields a single result. The wait is abandoned when the node leaves or
    /// `result_timeout` elapses, releasing the subscription.
    fn forward_result(&mut self, id: &NodeId, result: AggregationFuture<Weights>) {
        let cancel = self.cancel.child_token();
        if let Some(previous) = self.forward.replace(cancel.clone()) {
            previous.cancel();
        }

        let state = Arc::clone(&self.state);
        let outbox = self.outbox.clone();
        let timeout = self.result_timeout;
        let id = id.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                res = time::timeout(timeout, result) => match res {
                    Ok(Some(aggregation)) => {
                        // Queued under the lock so that no participant notice overtakes it.
                        let state = state.lock();
                        let _ = outbox.send(state.result_msg(&aggregation));
                    }
                    Ok(None) => {}
                    Err(_) => warn!("timed out waiting the aggregation for node {}", id.short()),
                },
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Creates an error for when an unexpected message kind is received.
    fn unexpected_message_kind<U>(msg: Msg) -> io::Result<U> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an unexpected message kind, got: {}", msg.kind()),
        ))
    }
}
