//! The server side of a federated session.

mod controller;
mod state;

pub use controller::SessionController;
pub use state::{IdGenerator, random_id};
