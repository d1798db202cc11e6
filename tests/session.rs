use std::time::Duration;

use comms::{Codec, F32Codec, MsgReceiver, MsgSender, NodeId, msg::Msg};
use federation::{
    aggregation::{Aggregator, Mean, Threshold},
    session::{SessionController, random_id},
    weights::Weights,
};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    time,
};

type Rx = MsgReceiver<ReadHalf<DuplexStream>>;
type Tx = MsgSender<WriteHalf<DuplexStream>>;

fn channel_pair() -> ((Rx, Tx), (Rx, Tx)) {
    let (stream1, stream2) = io::duplex(4096);
    let (rx1, tx1) = io::split(stream1);
    let (rx2, tx2) = io::split(stream2);
    let chan1 = comms::channel(rx1, tx1);
    let chan2 = comms::channel(rx2, tx2);
    (chan1, chan2)
}

fn encode(values: &[f32]) -> Vec<u8> {
    Codec::<Vec<f32>>::encode(&F32Codec, &values.to_vec())
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    Codec::<Vec<f32>>::decode(&F32Codec, bytes).unwrap()
}

fn controller(threshold: Threshold, min_participants: usize) -> SessionController<Mean> {
    let aggregator = Aggregator::new(Mean, threshold, 0);
    SessionController::new(aggregator, Weights::filled(0.0, 2), min_participants)
}

/// Opens a connection to `controller` returning the client's end.
fn open(controller: &mut SessionController<Mean>) -> (Rx, Tx) {
    let ((server_rx, server_tx), client) = channel_pair();
    controller.spawn(server_rx, server_tx);
    client
}

struct Joined {
    id: NodeId,
    wait: bool,
    round: u64,
    participants: usize,
    weights: Vec<f32>,
}

async fn join(rx: &mut Rx, tx: &mut Tx) -> io::Result<Joined> {
    tx.send(&Msg::ClientConnected).await?;

    match rx.recv().await? {
        Msg::NodeInfo {
            id,
            wait_for_more_participants,
            round,
            participants,
            payload,
            ..
        } => Ok(Joined {
            id,
            wait: wait_for_more_participants,
            round,
            participants,
            weights: decode(&payload),
        }),
        msg => panic!("expected node_info, got {msg:?}"),
    }
}

async fn contribute(tx: &mut Tx, round: u64, values: &[f32]) -> io::Result<()> {
    let msg = Msg::SendPayload {
        round,
        communication_round: 0,
        payload: encode(values),
    };
    tx.send(&msg).await
}

/// Receives a global payload returning it's round, participants and weights.
async fn global(rx: &mut Rx) -> io::Result<(u64, usize, Vec<f32>)> {
    match rx.recv().await? {
        Msg::ReceiveGlobalPayload {
            round,
            communication_round: 0,
            participants,
            payload,
        } => Ok((round, participants, decode(&payload))),
        msg => panic!("expected receive_global_payload, got {msg:?}"),
    }
}

#[tokio::test]
async fn two_clients_receive_the_mean() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 2);
    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);

    let a = join(&mut a_rx, &mut a_tx).await?;
    assert!(a.wait);
    assert_eq!((a.round, a.participants), (0, 1));
    assert_eq!(a.weights, vec![0.0, 0.0]);

    let b = join(&mut b_rx, &mut b_tx).await?;
    assert!(!b.wait);
    assert_eq!(b.participants, 2);
    assert_ne!(a.id, b.id);
    assert_eq!(a_rx.recv::<Msg>().await?, Msg::EnoughParticipants);

    contribute(&mut a_tx, 0, &[1.0, 2.0]).await?;
    contribute(&mut b_tx, 0, &[3.0, 4.0]).await?;

    let expected = (1, 2, vec![2.0, 3.0]);
    assert_eq!(global(&mut a_rx).await?, expected);
    assert_eq!(global(&mut b_rx).await?, expected);
    assert_eq!(controller.round(), 1);
    assert_eq!(&**controller.global(), &[2.0, 3.0]);

    Ok(())
}

#[tokio::test]
async fn stale_contribution_gets_the_latest_global() -> io::Result<()> {
    let mut controller = controller(Threshold::absolute(1).unwrap(), 1);
    let (mut rx, mut tx) = open(&mut controller);

    let joined = join(&mut rx, &mut tx).await?;
    assert!(!joined.wait);

    contribute(&mut tx, 0, &[2.0, 2.0]).await?;
    assert_eq!(global(&mut rx).await?, (1, 1, vec![2.0, 2.0]));

    contribute(&mut tx, 0, &[9.0, 9.0]).await?;
    assert_eq!(global(&mut rx).await?, (1, 1, vec![2.0, 2.0]));
    assert_eq!(controller.round(), 1);

    Ok(())
}

#[tokio::test]
async fn malformed_contributions_get_the_latest_global() -> io::Result<()> {
    let mut controller = controller(Threshold::absolute(1).unwrap(), 1);
    let (mut rx, mut tx) = open(&mut controller);
    join(&mut rx, &mut tx).await?;

    contribute(&mut tx, 0, &[1.0, 2.0, 3.0]).await?;
    assert_eq!(global(&mut rx).await?, (0, 1, vec![0.0, 0.0]));

    let msg = Msg::SendPayload {
        round: 0,
        communication_round: 0,
        payload: vec![1, 2, 3],
    };
    tx.send(&msg).await?;
    assert_eq!(global(&mut rx).await?, (0, 1, vec![0.0, 0.0]));
    assert_eq!(controller.round(), 0);

    Ok(())
}

#[tokio::test]
async fn falling_below_the_minimum_broadcasts_waiting_once() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 2);
    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);
    let (mut c_rx, mut c_tx) = open(&mut controller);

    join(&mut a_rx, &mut a_tx).await?;
    join(&mut b_rx, &mut b_tx).await?;
    assert_eq!(a_rx.recv::<Msg>().await?, Msg::EnoughParticipants);

    let c = join(&mut c_rx, &mut c_tx).await?;
    assert!(!c.wait);

    c_tx.send(&Msg::Disconnect).await?;
    b_tx.send(&Msg::Disconnect).await?;
    assert_eq!(a_rx.recv::<Msg>().await?, Msg::WaitingForMoreParticipants);

    // A malformed contribution is answered right away, nothing may be queued before it.
    contribute(&mut a_tx, 0, &[1.0]).await?;
    assert_eq!(global(&mut a_rx).await?, (0, 1, vec![0.0, 0.0]));
    assert!(controller.is_waiting());

    Ok(())
}

#[tokio::test]
async fn departure_completes_the_round() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 1);
    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);
    let (mut c_rx, mut c_tx) = open(&mut controller);

    join(&mut a_rx, &mut a_tx).await?;
    join(&mut b_rx, &mut b_tx).await?;
    join(&mut c_rx, &mut c_tx).await?;

    contribute(&mut a_tx, 0, &[1.0, 1.0]).await?;
    contribute(&mut b_tx, 0, &[3.0, 5.0]).await?;
    c_tx.send(&Msg::Disconnect).await?;

    assert_eq!(global(&mut a_rx).await?, (1, 2, vec![2.0, 3.0]));
    assert_eq!(global(&mut b_rx).await?, (1, 2, vec![2.0, 3.0]));
    assert_eq!(controller.participants(), 2);

    Ok(())
}

#[tokio::test]
async fn taken_ids_are_drawn_again() -> io::Result<()> {
    let mut ids = ["dup", "dup", "fresh"].into_iter().map(NodeId::from);
    let mut controller = controller(Threshold::everyone(), 1)
        .with_id_generator(move || ids.next().unwrap_or_else(random_id));

    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);

    let a = join(&mut a_rx, &mut a_tx).await?;
    let b = join(&mut b_rx, &mut b_tx).await?;

    assert_eq!(a.id, NodeId::from("dup"));
    assert_eq!(b.id, NodeId::from("fresh"));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn expired_waiters_are_released() -> io::Result<()> {
    let mut controller =
        controller(Threshold::everyone(), 1).with_result_timeout(Duration::from_secs(5));
    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);

    join(&mut a_rx, &mut a_tx).await?;
    join(&mut b_rx, &mut b_tx).await?;

    contribute(&mut a_tx, 0, &[1.0, 1.0]).await?;
    time::sleep(Duration::from_secs(6)).await;

    contribute(&mut b_tx, 0, &[3.0, 3.0]).await?;
    assert_eq!(global(&mut b_rx).await?, (1, 2, vec![2.0, 2.0]));

    let late = time::timeout(Duration::from_secs(1), a_rx.recv::<Msg>()).await;
    assert!(late.is_err(), "a timed out waiter still delivered {late:?}");

    Ok(())
}

#[tokio::test]
async fn handshake_must_come_first() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 1);
    let (mut rx, mut tx) = open(&mut controller);

    contribute(&mut tx, 0, &[1.0, 1.0]).await?;

    assert!(matches!(rx.recv::<Msg>().await?, Msg::Err(_)));
    assert_eq!(controller.participants(), 0);

    Ok(())
}

#[tokio::test]
async fn shutdown_disconnects_every_client() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 2);
    let (mut rx, mut tx) = open(&mut controller);
    join(&mut rx, &mut tx).await?;

    controller.shutdown();
    assert_eq!(rx.recv::<Msg>().await?, Msg::Disconnect);

    controller.run().await?;
    assert_eq!(controller.participants(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resubmission_is_answered_once() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 1);
    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);

    join(&mut a_rx, &mut a_tx).await?;
    join(&mut b_rx, &mut b_tx).await?;

    contribute(&mut a_tx, 0, &[9.0, 9.0]).await?;
    contribute(&mut a_tx, 0, &[5.0, 5.0]).await?;
    time::sleep(Duration::from_millis(10)).await;

    contribute(&mut b_tx, 0, &[3.0, 3.0]).await?;
    assert_eq!(global(&mut a_rx).await?, (1, 2, vec![4.0, 4.0]));
    assert_eq!(global(&mut b_rx).await?, (1, 2, vec![4.0, 4.0]));

    let repeated = time::timeout(Duration::from_secs(1), a_rx.recv::<Msg>()).await;
    assert!(repeated.is_err(), "the replaced contribution got {repeated:?}");

    Ok(())
}

/// Receives a peer list returning it's round and peers.
async fn peer_list(rx: &mut Rx) -> io::Result<(u64, Vec<NodeId>)> {
    match rx.recv().await? {
        Msg::PeersForRound { round, peers } => Ok((round, peers)),
        msg => panic!("expected peers_for_round, got {msg:?}"),
    }
}

fn sorted<const N: usize>(ids: [&NodeId; N]) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = ids.into_iter().cloned().collect();
    ids.sort();
    ids
}

#[tokio::test(start_paused = true)]
async fn peer_round_starts_once_everyone_is_ready() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 1);
    let (mut a_rx, mut a_tx) = open(&mut controller);
    let (mut b_rx, mut b_tx) = open(&mut controller);
    let (mut c_rx, mut c_tx) = open(&mut controller);

    let a = join(&mut a_rx, &mut a_tx).await?;
    let b = join(&mut b_rx, &mut b_tx).await?;
    let c = join(&mut c_rx, &mut c_tx).await?;

    a_tx.send(&Msg::PeerIsReady).await?;
    b_tx.send(&Msg::PeerIsReady).await?;
    let early = time::timeout(Duration::from_secs(1), a_rx.recv::<Msg>()).await;
    assert!(early.is_err(), "released before everyone was ready: {early:?}");

    c_tx.send(&Msg::PeerIsReady).await?;
    assert_eq!(peer_list(&mut a_rx).await?, (0, sorted([&b.id, &c.id])));
    assert_eq!(peer_list(&mut b_rx).await?, (0, sorted([&a.id, &c.id])));
    assert_eq!(peer_list(&mut c_rx).await?, (0, sorted([&a.id, &b.id])));

    // A node leaving completes the next round's readiness.
    a_tx.send(&Msg::PeerIsReady).await?;
    b_tx.send(&Msg::PeerIsReady).await?;
    c_tx.send(&Msg::Disconnect).await?;
    assert_eq!(peer_list(&mut a_rx).await?, (1, vec![b.id.clone()]));
    assert_eq!(peer_list(&mut b_rx).await?, (1, vec![a.id.clone()]));
    assert_eq!(controller.participants(), 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn peer_round_waits_for_the_minimum() -> io::Result<()> {
    let mut controller = controller(Threshold::everyone(), 2);
    let (mut a_rx, mut a_tx) = open(&mut controller);
    join(&mut a_rx, &mut a_tx).await?;

    a_tx.send(&Msg::PeerIsReady).await?;
    let early = time::timeout(Duration::from_secs(1), a_rx.recv::<Msg>()).await;
    assert!(early.is_err(), "released while waiting: {early:?}");

    Ok(())
}
