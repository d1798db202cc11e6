//! Round coordination and aggregation for federated training sessions.
//!
//! The `session` module is the server, multiplexing every client onto an `aggregation::Aggregator`.
//! The `coordinator` module is the client, driving local training through the session's rounds.

pub mod aggregation;
pub mod config;
pub mod coordinator;
pub mod session;
pub mod weights;
