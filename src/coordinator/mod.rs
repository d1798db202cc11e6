//! The client side of a federated session.

mod coordinator;
mod error;
mod peer;
mod status;
mod trainer;

pub use coordinator::{Coordinator, PeerList, RoundOutcome};
pub use error::{CoordinatorErr, Result};
pub use peer::PeerCoordinator;
pub use status::{Status, StatusBoard};
pub use trainer::{DriftTrainer, LocalTrainer};
