use std::{env, process};

use anyhow::Context;
use federation::{
    aggregation::{Mean, Strategy, Sum},
    config::{ClientConfig, ServerConfig, StrategySpec},
    coordinator::{Coordinator, DriftTrainer},
    weights::Weights,
};
use log::info;
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    signal,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8765";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(mode) = args.get(1) else {
        eprintln!("Usage: {} <server|client> [address]", args[0]);
        process::exit(1);
    };

    let addr = match args.get(2) {
        Some(addr) => addr.clone(),
        None => format!(
            "{}:{}",
            env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string()),
        ),
    };

    match mode.as_str() {
        "server" => {
            let config = match env::var("FEDERATION_CONFIG") {
                Ok(path) => ServerConfig::load(&path).with_context(|| format!("loading {path}"))?,
                Err(_) => ServerConfig::default(),
            };

            match config.strategy {
                StrategySpec::Mean => serve(&addr, &config, Mean).await,
                StrategySpec::Sum => serve(&addr, &config, Sum).await,
            }
        }
        "client" => {
            let config = match env::var("FEDERATION_CONFIG") {
                Ok(path) => ClientConfig::load(&path).with_context(|| format!("loading {path}"))?,
                Err(_) => ClientConfig::default(),
            };

            train(&addr, &config).await
        }
        _ => {
            eprintln!("Unknown mode: {mode}. You must use 'server' or 'client'.");
            process::exit(1);
        }
    }
}

/// Accepts clients into a session until ctrl-c is received.
async fn serve<S>(addr: &str, config: &ServerConfig, strategy: S) -> anyhow::Result<()>
where
    S: Strategy<Weights> + Send + 'static,
{
    let mut session = config.controller(strategy)?;

    let list = TcpListener::bind(addr).await?;
    info!("listening at {addr}");

    loop {
        tokio::select! {
            accepted = list.accept() => {
                let (stream, peer) = accepted?;
                info!("client connected from {peer}");

                let (rx, tx) = stream.into_split();
                let (rx, tx) = comms::channel(rx, tx);
                session.spawn(rx, tx);
            }
            _ = signal::ctrl_c() => {
                info!("received SIGTERM");
                break;
            }
        }
    }

    session.shutdown();
    session.run().await?;
    Ok(())
}

/// Joins the session at `addr` and trains a toy model for the configured rounds.
async fn train(addr: &str, config: &ClientConfig) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;

    let (rx, tx) = stream.into_split();
    let (rx, tx) = comms::channel(rx, tx);
    let mut coordinator = Coordinator::connect(rx, tx, config).await?;

    let target = rand::rng().random_range(-1.0..1.0);
    let mut trainer = DriftTrainer::new(target, 0.5);
    info!("drifting towards {target}");

    let finished = tokio::select! {
        ret = coordinator.run(&mut trainer, config.rounds) => Some(ret?),
        _ = signal::ctrl_c() => None,
    };

    match finished {
        Some(weights) => info!(
            round = coordinator.round();
            "finished training, final weights {:?}", &*weights
        ),
        None => info!("received SIGTERM"),
    }

    coordinator.disconnect().await?;
    Ok(())
}
