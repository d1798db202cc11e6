use std::{collections::BTreeMap, io};

use comms::{Codec, F32Codec, MsgReceiver, MsgSender, NodeId, msg::Msg};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;

use super::{Coordinator, CoordinatorErr, LocalTrainer, Result, RoundOutcome, Status};
use crate::{
    aggregation::{Aggregation, AggregationFuture, Aggregator, Mean, Strategy, Threshold},
    weights::Weights,
};

/// Drives a client through peer rounds, where contributions go straight to the other nodes
/// instead of through the session.
///
/// The session only decides who takes part in each round. Every node sends each peer the
/// payload the strategy made for it and aggregates what the peers send back on it's own, so
/// with `SecureStrategy` no node ever sees another node's weights. The aggregator's roster is
/// the round's peers plus this node, and is emptied once the round ends. It's rounds are the
/// ones the session numbers the peer lists with.
pub struct PeerCoordinator<W, P, S, C = F32Codec>
where
    W: AsyncWrite + Unpin,
    P: AsyncWrite + Unpin,
{
    session: Coordinator<W, Mean, C>,
    aggregator: Aggregator<Weights, S>,
    links: BTreeMap<NodeId, MsgSender<P>>,
    inbound_tx: UnboundedSender<(NodeId, Msg)>,
    inbound: UnboundedReceiver<(NodeId, Msg)>,
    readers: JoinSet<()>,
}

impl<W, P, S, C> PeerCoordinator<W, P, S, C>
where
    W: AsyncWrite + Unpin,
    P: AsyncWrite + Unpin,
    S: Strategy<Weights>,
    C: Codec<Weights>,
{
    /// Takes over a coordinator already connected to the session.
    ///
    /// # Arguments
    /// * `session` - The connection to the session.
    /// * `strategy` - How the peers' contributions are aggregated, the same on every peer.
    pub fn new(session: Coordinator<W, Mean, C>, strategy: S) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        Self {
            session,
            aggregator: Aggregator::new(strategy, Threshold::everyone(), 0),
            links: BTreeMap::new(),
            inbound_tx,
            inbound,
            readers: JoinSet::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        self.session.id()
    }

    /// The peer round this node is at.
    pub fn round(&self) -> u64 {
        self.aggregator.round()
    }

    /// The connection to the session.
    pub fn session(&self) -> &Coordinator<W, Mean, C> {
        &self.session
    }

    /// Adds a connection to `peer`.
    ///
    /// Messages coming from it are handled whenever a round awaits it's aggregation.
    ///
    /// # Arguments
    /// * `peer` - The node at the other end.
    /// * `rx` - The receiving end of the connection.
    /// * `tx` - The sending end of the connection.
    pub fn link<R>(&mut self, peer: NodeId, rx: MsgReceiver<R>, tx: MsgSender<P>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        debug!("linked to peer {}", peer.short());

        let inbound = self.inbound_tx.clone();
        let cancel = self.session.cancel.clone();
        self.readers.spawn(read_peer(peer.clone(), rx, inbound, cancel));
        self.links.insert(peer, tx);
    }

    /// Starts a peer round.
    ///
    /// Suspends while the session waits for more participants, then announces this node is
    /// ready and takes the peers the session answers with as the round's roster. Without an
    /// answer within the result timeout the round is run alone.
    ///
    /// # Errors
    /// `CoordinatorErr::Disconnected` if the connection is lost or cancelled while waiting.
    pub async fn begin_round(&mut self) -> Result<()> {
        self.session.wait_for_participants().await?;
        self.session.status.publish(Status::RetrievingPeers);

        let own = self.session.id.clone();
        let peers = match self.session.request_peers().await? {
            Some(list) if list.peers.contains(&own) => {
                warn!("the peer list contains this node, running the round alone");
                Vec::new()
            }
            Some(list) => {
                self.aggregator.set_round(list.round);
                list.peers
            }
            None => {
                warn!(
                    "no peer list within {:?}, running the round alone",
                    self.session.result_timeout
                );
                Vec::new()
            }
        };

        for peer in peers.iter().filter(|peer| !self.links.contains_key(*peer)) {
            warn!("no link to peer {}, it's contributions will be missing", peer.short());
        }

        info!(round = self.round(), peers = peers.len(); "peer round begins");
        self.aggregator.set_nodes(peers.into_iter().chain([own]));
        self.session.status.publish(Status::Training);
        Ok(())
    }

    /// Exchanges the locally trained `weights` with the round's peers and aggregates theirs.
    ///
    /// Each communication round sends every peer it's payload, adds this node's own one and
    /// waits for the aggregation while handling what the peers send. If an aggregation doesn't
    /// happen within the result timeout the round is closed with the local weights.
    ///
    /// # Arguments
    /// * `weights` - The locally trained weights.
    ///
    /// # Returns
    /// The outcome of the round.
    pub async fn end_round(&mut self, weights: Weights) -> Result<RoundOutcome> {
        self.session.status.publish(Status::UpdatingModel);

        let own = self.session.id.clone();
        let round = self.aggregator.round();
        let communication_rounds = self.aggregator.communication_rounds();

        let mut current = weights.clone();
        for communication_round in 0..communication_rounds {
            let result = self.aggregator.subscribe();
            let payloads = self.aggregator.make_payloads(&current);

            for (peer, payload) in payloads {
                if peer == own {
                    self.aggregator.add(
                        own.clone(),
                        payload,
                        round,
                        Some(communication_round),
                    )?;
                } else {
                    self.send_share(&peer, round, communication_round, &payload)
                        .await;
                }
            }

            let Some(aggregation) = self.await_aggregation(result, weights.len()).await? else {
                warn!(
                    round = round, communication_round = communication_round;
                    "peers didn't contribute within {:?}, continuing with the local weights",
                    self.session.result_timeout
                );

                self.aggregator.reset_nodes();
                return Ok(RoundOutcome::Local(weights));
            };

            current = (*aggregation.payload).clone();
        }

        self.aggregator.reset_nodes();
        debug!(round = self.round(); "peer round aggregated");

        Ok(RoundOutcome::Global {
            weights: current,
            round: self.round(),
        })
    }

    /// Trains for `rounds` peer rounds starting from the weights received when joining.
    ///
    /// # Returns
    /// The weights after the last round.
    pub async fn run<T>(&mut self, trainer: &mut T, rounds: usize) -> Result<Weights>
    where
        T: LocalTrainer,
    {
        let mut weights = self.session.initial_weights().clone();

        for _ in 0..rounds {
            self.begin_round().await?;
            let trained = trainer.train(weights, self.round());
            weights = self.end_round(trained).await?.into_weights();
        }

        Ok(weights)
    }

    /// Closes every peer link and leaves the session.
    pub async fn disconnect(&mut self) -> Result<()> {
        for (peer, link) in &mut self.links {
            if let Err(e) = link.send(&Msg::Disconnect).await {
                debug!("couldn't say goodbye to peer {}: {e}", peer.short());
            }
            let _ = link.shutdown().await;
        }

        self.links.clear();
        self.readers.abort_all();
        self.session.disconnect().await
    }

    async fn send_share(
        &mut self,
        peer: &NodeId,
        round: u64,
        communication_round: usize,
        payload: &Weights,
    ) {
        let Some(link) = self.links.get_mut(peer) else {
            warn!("no link to peer {}, it won't get this node's share", peer.short());
            return;
        };

        let msg = Msg::SendPayload {
            round,
            communication_round,
            payload: self.session.codec.encode(payload),
        };

        if let Err(e) = link.send(&msg).await {
            warn!("sending to peer {} failed, dropping the link: {e}", peer.short());
            self.links.remove(peer);
        }
    }

    /// Handles peer messages until `result` resolves.
    ///
    /// # Returns
    /// The aggregation or `None` on timeout.
    async fn await_aggregation(
        &mut self,
        mut result: AggregationFuture<Weights>,
        len: usize,
    ) -> Result<Option<Aggregation<Weights>>> {
        let deadline = time::sleep(self.session.result_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                aggregation = &mut result => return Ok(aggregation),
                _ = self.session.cancel.cancelled() => return Err(CoordinatorErr::Disconnected),
                Some((peer, msg)) = self.inbound.recv() => self.receive(peer, msg, len),
                _ = &mut deadline => return Ok(None),
            }
        }
    }

    /// Adds a peer's contribution to the local aggregator, screening it first.
    fn receive(&mut self, peer: NodeId, msg: Msg, len: usize) {
        match msg {
            Msg::SendPayload {
                round,
                communication_round,
                payload,
            } => {
                let weights = match self.session.codec.decode(&payload) {
                    Ok(weights) if weights.len() == len => weights,
                    Ok(weights) => {
                        warn!(
                            got = weights.len(), expected = len;
                            "peer {} sent weights of the wrong shape", peer.short()
                        );
                        return;
                    }
                    Err(e) => {
                        warn!("peer {} sent an undecodable payload: {e}", peer.short());
                        return;
                    }
                };

                if !self.aggregator.is_valid_contribution(&peer, round) {
                    debug!(
                        round = round, current = self.round();
                        "dropping a contribution from peer {}", peer.short()
                    );
                    return;
                }

                let res = self.aggregator.add(
                    peer,
                    weights,
                    round,
                    Some(communication_round),
                );
                if let Err(e) = res {
                    warn!("{e}");
                }
            }
            Msg::Disconnect => {
                info!("peer {} left", peer.short());
                self.links.remove(&peer);
                self.aggregator.remove_node(&peer);
            }
            msg => warn!("peer {} sent an unexpected {}", peer.short(), msg.kind()),
        }
    }
}

/// Forwards everything `peer` sends into `inbound`, a closed connection is reported as a
/// `Disconnect`.
async fn read_peer<R>(
    peer: NodeId,
    mut rx: MsgReceiver<R>,
    inbound: UnboundedSender<(NodeId, Msg)>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = rx.recv::<Msg>() => msg,
        };

        match msg {
            Ok(msg) => {
                let closing = matches!(msg, Msg::Disconnect);
                if inbound.send((peer.clone(), msg)).is_err() || closing {
                    return;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("link to peer {} failed: {e}", peer.short());
                }

                let _ = inbound.send((peer, Msg::Disconnect));
                return;
            }
        }
    }
}
