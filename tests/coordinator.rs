use std::time::Duration;

use comms::{Codec, F32Codec, MsgReceiver, MsgSender, NodeId, msg::Msg};
use federation::{
    aggregation::{Aggregator, Mean, SecureStrategy, Strategy, Threshold},
    config::ClientConfig,
    coordinator::{Coordinator, CoordinatorErr, DriftTrainer, RoundOutcome, Status},
    session::SessionController,
    weights::Weights,
};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    sync::broadcast::error::TryRecvError,
    time::{self, Instant},
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

fn weights(values: &[f32]) -> Weights {
    Weights::from(values.to_vec())
}

fn global(round: u64, values: &[f32]) -> Msg {
    Msg::ReceiveGlobalPayload {
        round,
        communication_round: 0,
        participants: 1,
        payload: encode(values),
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        result_timeout_secs: 30,
        ..Default::default()
    }
}

fn controller(min_participants: usize) -> SessionController<Mean> {
    controller_with(Mean, min_participants)
}

fn controller_with<S>(strategy: S, min_participants: usize) -> SessionController<S>
where
    S: Strategy<Weights> + Send + 'static,
{
    let aggregator = Aggregator::new(strategy, Threshold::everyone(), 0);
    SessionController::new(aggregator, Weights::filled(0.0, 2), min_participants)
}

/// Connects a coordinator to `controller`.
async fn join<S>(
    controller: &mut SessionController<S>,
) -> Result<Coordinator<WriteHalf<DuplexStream>>, CoordinatorErr>
where
    S: Strategy<Weights> + Send + 'static,
{
    join_with(controller, &config()).await
}

async fn join_with<S>(
    controller: &mut SessionController<S>,
    config: &ClientConfig,
) -> Result<Coordinator<WriteHalf<DuplexStream>>, CoordinatorErr>
where
    S: Strategy<Weights> + Send + 'static,
{
    let ((server_rx, server_tx), (rx, tx)) = channel_pair();
    controller.spawn(server_rx, server_tx);
    Coordinator::connect(rx, tx, config).await
}

/// Connects a coordinator that secret shares it's contributions.
async fn join_secure(
    controller: &mut SessionController<SecureStrategy>,
    seed: u64,
) -> Result<Coordinator<WriteHalf<DuplexStream>, SecureStrategy>, CoordinatorErr> {
    let ((server_rx, server_tx), (rx, tx)) = channel_pair();
    controller.spawn(server_rx, server_tx);

    let strategy = SecureStrategy::with_seed(10.0, seed);
    Coordinator::connect_with(rx, tx, &config(), strategy, F32Codec).await
}

/// Plays the server side of a handshake.
async fn accept(rx: &mut Rx, tx: &mut Tx, wait: bool) -> io::Result<()> {
    assert_eq!(rx.recv::<Msg>().await?, Msg::ClientConnected);

    let info = Msg::NodeInfo {
        id: NodeId::from("node-a"),
        wait_for_more_participants: wait,
        round: 0,
        participants: 1,
        min_participants: 1,
        payload: encode(&[1.0, 1.0]),
    };
    tx.send(&info).await
}

#[tokio::test]
async fn clients_end_the_round_with_the_mean() -> Result<(), CoordinatorErr> {
    let mut controller = controller(2);
    let mut a = join(&mut controller).await?;
    let mut b = join(&mut controller).await?;

    let round_a = async {
        a.begin_round().await?;
        a.end_round(weights(&[1.0, 2.0])).await
    };
    let round_b = async {
        b.begin_round().await?;
        b.end_round(weights(&[3.0, 6.0])).await
    };

    let (outcome_a, outcome_b) = tokio::try_join!(round_a, round_b)?;

    let expected = RoundOutcome::Global {
        weights: weights(&[2.0, 4.0]),
        round: 1,
    };
    assert_eq!(outcome_a, expected);
    assert_eq!(outcome_b, expected);
    assert_eq!((a.round(), a.participants()), (1, 2));

    Ok(())
}

#[tokio::test]
async fn run_trains_through_every_round() -> Result<(), CoordinatorErr> {
    let mut controller = controller(2);
    let mut a = join(&mut controller).await?;
    let mut b = join(&mut controller).await?;

    let mut up = DriftTrainer::new(1.0, 1.0);
    let mut down = DriftTrainer::new(-1.0, 1.0);

    let (final_a, final_b) = tokio::try_join!(a.run(&mut up, 3), b.run(&mut down, 3))?;

    assert_eq!(final_a, weights(&[0.0, 0.0]));
    assert_eq!(final_b, weights(&[0.0, 0.0]));
    assert_eq!(a.round(), 3);
    assert_eq!(controller.round(), 3);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_result_falls_back_to_local_weights() -> Result<(), CoordinatorErr> {
    let ((mut server_rx, mut server_tx), (rx, tx)) = channel_pair();

    let server = tokio::spawn(async move {
        accept(&mut server_rx, &mut server_tx, false).await?;

        // Never answers the first contribution.
        let msg: Msg = server_rx.recv().await?;
        assert!(matches!(msg, Msg::SendPayload { round: 0, .. }));

        // The round wasn't confirmed, the next contribution is made for it again.
        let msg: Msg = server_rx.recv().await?;
        assert!(matches!(msg, Msg::SendPayload { round: 0, .. }));
        server_tx.send(&global(1, &[4.0, 4.0])).await?;

        // A late duplicate of the previous result, then the real one.
        let msg: Msg = server_rx.recv().await?;
        assert!(matches!(msg, Msg::SendPayload { round: 1, .. }));
        server_tx.send(&global(1, &[7.0, 7.0])).await?;
        server_tx.send(&global(2, &[6.0, 6.0])).await?;

        server_rx.recv::<Msg>().await
    });

    let mut coordinator = Coordinator::connect(rx, tx, &config()).await?;
    assert_eq!(coordinator.initial_weights(), &weights(&[1.0, 1.0]));

    let start = Instant::now();
    coordinator.begin_round().await?;
    let outcome = coordinator.end_round(weights(&[3.0, 3.0])).await?;

    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(outcome, RoundOutcome::Local(weights(&[3.0, 3.0])));
    assert_eq!(coordinator.round(), 0);

    let outcome = coordinator.end_round(weights(&[5.0, 5.0])).await?;
    let expected = RoundOutcome::Global {
        weights: weights(&[4.0, 4.0]),
        round: 1,
    };
    assert_eq!(outcome, expected);

    let outcome = coordinator.end_round(weights(&[5.0, 5.0])).await?;
    let expected = RoundOutcome::Global {
        weights: weights(&[6.0, 6.0]),
        round: 2,
    };
    assert_eq!(outcome, expected);
    assert_eq!(coordinator.round(), 2);

    coordinator.disconnect().await?;
    assert_eq!(server.await.unwrap()?, Msg::Disconnect);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timed_out_client_keeps_receiving_results() -> Result<(), CoordinatorErr> {
    let mut controller = controller(2);
    let impatient = ClientConfig {
        result_timeout_secs: 5,
        ..Default::default()
    };
    let mut a = join_with(&mut controller, &impatient).await?;
    let mut b = join(&mut controller).await?;

    a.begin_round().await?;
    let outcome = a.end_round(weights(&[1.0, 1.0])).await?;
    assert_eq!(outcome, RoundOutcome::Local(weights(&[1.0, 1.0])));
    assert_eq!(a.round(), 0);

    let round_a = async {
        a.begin_round().await?;
        a.end_round(weights(&[1.0, 1.0])).await
    };
    let round_b = async {
        b.begin_round().await?;
        b.end_round(weights(&[5.0, 5.0])).await
    };
    let (outcome_a, outcome_b) = tokio::try_join!(round_a, round_b)?;

    let expected = RoundOutcome::Global {
        weights: weights(&[3.0, 3.0]),
        round: 1,
    };
    assert_eq!(outcome_a, expected);
    assert_eq!(outcome_b, expected);

    let (outcome_a, outcome_b) = tokio::try_join!(
        a.end_round(weights(&[2.0, 2.0])),
        b.end_round(weights(&[4.0, 4.0])),
    )?;
    assert!(outcome_a.is_global() && outcome_b.is_global());
    assert_eq!(outcome_a.weights(), &weights(&[3.0, 3.0]));
    assert_eq!(a.round(), 2);
    assert_eq!(a.round(), controller.round());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn result_with_enough_participants_resumes_a_waiting_client() -> Result<(), CoordinatorErr> {
    let ((mut server_rx, mut server_tx), (rx, tx)) = channel_pair();

    let server = tokio::spawn(async move {
        assert_eq!(server_rx.recv::<Msg>().await?, Msg::ClientConnected);

        let info = Msg::NodeInfo {
            id: NodeId::from("node-c"),
            wait_for_more_participants: true,
            round: 0,
            participants: 1,
            min_participants: 2,
            payload: encode(&[0.0, 0.0]),
        };
        server_tx.send(&info).await?;

        // The enough_participants notice never makes it, only a result does.
        time::sleep(Duration::from_secs(10)).await;
        let result = Msg::ReceiveGlobalPayload {
            round: 0,
            communication_round: 0,
            participants: 2,
            payload: encode(&[0.0, 0.0]),
        };
        server_tx.send(&result).await?;

        server_rx.recv::<Msg>().await
    });

    let mut coordinator = Coordinator::connect(rx, tx, &config()).await?;

    let begun = time::timeout(Duration::from_secs(5), coordinator.begin_round()).await;
    assert!(begun.is_err());
    assert_eq!(coordinator.status(), Some(Status::WaitingForParticipants));

    let begun = time::timeout(Duration::from_secs(10), coordinator.begin_round()).await;
    assert!(matches!(begun, Ok(Ok(()))));
    assert_eq!(coordinator.status(), Some(Status::Training));

    coordinator.disconnect().await?;
    assert_eq!(server.await.unwrap()?, Msg::Disconnect);

    Ok(())
}

#[tokio::test]
async fn secret_shared_rounds_go_through_the_session() -> Result<(), CoordinatorErr> {
    let mut controller = controller_with(SecureStrategy::with_seed(1.0, 3), 2);

    let mut a = join_secure(&mut controller, 1).await?;
    let mut b = join_secure(&mut controller, 2).await?;

    let round_a = async {
        a.begin_round().await?;
        a.end_round(weights(&[1.0, 2.0])).await
    };
    let round_b = async {
        b.begin_round().await?;
        b.end_round(weights(&[3.0, 4.0])).await
    };
    let (outcome_a, outcome_b) = tokio::try_join!(round_a, round_b)?;

    let expected = RoundOutcome::Global {
        weights: weights(&[4.0, 6.0]),
        round: 1,
    };
    assert_eq!(outcome_a, expected);
    assert_eq!(outcome_b, expected);
    assert_eq!(controller.round(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancel_handle_aborts_the_wait() -> Result<(), CoordinatorErr> {
    let ((mut server_rx, mut server_tx), (rx, tx)) = channel_pair();

    let server = tokio::spawn(async move {
        accept(&mut server_rx, &mut server_tx, false).await?;
        server_rx.recv::<Msg>().await?;
        server_rx.recv::<Msg>().await
    });

    let mut coordinator = Coordinator::connect(rx, tx, &config()).await?;
    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let res = coordinator.end_round(weights(&[1.0, 1.0])).await;

    assert!(matches!(res, Err(CoordinatorErr::Disconnected)));
    assert!(start.elapsed() < Duration::from_secs(30));

    coordinator.disconnect().await?;
    assert_eq!(coordinator.status(), Some(Status::Disconnected));
    assert_eq!(server.await.unwrap()?, Msg::Disconnect);

    Ok(())
}

#[tokio::test]
async fn notices_before_the_handshake_are_replayed() -> Result<(), CoordinatorErr> {
    let ((mut server_rx, mut server_tx), (rx, tx)) = channel_pair();

    let server = tokio::spawn(async move {
        assert_eq!(server_rx.recv::<Msg>().await?, Msg::ClientConnected);

        server_tx.send(&Msg::EnoughParticipants).await?;
        let info = Msg::NodeInfo {
            id: NodeId::from("node-b"),
            wait_for_more_participants: true,
            round: 4,
            participants: 2,
            min_participants: 2,
            payload: encode(&[0.0]),
        };
        server_tx.send(&info).await?;

        server_rx.recv::<Msg>().await
    });

    let mut coordinator = Coordinator::connect(rx, tx, &config()).await?;
    assert_eq!(coordinator.id(), &NodeId::from("node-b"));
    assert_eq!(coordinator.round(), 4);

    let begun = time::timeout(Duration::from_secs(5), coordinator.begin_round()).await;
    assert!(matches!(begun, Ok(Ok(()))));
    assert_eq!(coordinator.status(), Some(Status::Training));

    coordinator.disconnect().await?;
    assert_eq!(server.await.unwrap()?, Msg::Disconnect);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remaining_client_waits_exactly_once() -> Result<(), CoordinatorErr> {
    let mut controller = controller(2);
    let mut a = join(&mut controller).await?;
    let mut b = join(&mut controller).await?;

    b.begin_round().await?;
    let mut statuses = b.subscribe_status();

    a.disconnect().await?;
    assert_eq!(statuses.recv().await.ok(), Some(Status::WaitingForParticipants));

    let begun = time::timeout(Duration::from_secs(1), b.begin_round()).await;
    assert!(begun.is_err());
    assert_eq!(statuses.try_recv(), Err(TryRecvError::Empty));

    Ok(())
}

#[tokio::test]
async fn rejected_handshake_is_reported() -> io::Result<()> {
    let ((mut server_rx, mut server_tx), (rx, tx)) = channel_pair();

    let server = tokio::spawn(async move {
        server_rx.recv::<Msg>().await?;
        server_tx.send(&Msg::Err("session is full".into())).await
    });

    let res = Coordinator::connect(rx, tx, &config()).await;
    assert!(matches!(
        res,
        Err(CoordinatorErr::UnexpectedMessage { got: "err" })
    ));
    server.await.unwrap()?;

    let ((mut server_rx, server_tx), (rx, tx)) = channel_pair();
    let server = tokio::spawn(async move {
        let msg = server_rx.recv::<Msg>().await;
        drop(server_tx);
        msg
    });

    let res = Coordinator::connect(rx, tx, &config()).await;
    assert!(matches!(res, Err(CoordinatorErr::HandshakeClosed)));
    server.await.unwrap()?;

    Ok(())
}
