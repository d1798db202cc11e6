//! Round bookkeeping and aggregation of contributions.

mod aggregator;
mod error;
mod future;
mod gate;
mod roster;
mod secure;
mod store;
mod strategy;

pub use aggregator::Aggregator;
pub use error::{AggregationErr, Result, ThresholdErr};
pub use future::{Aggregation, AggregationFuture};
pub use gate::{Fraction, Threshold};
pub use roster::Roster;
pub use secure::SecureStrategy;
pub use store::{Contribution, ContributionStore};
pub use strategy::{Mean, Strategy, Sum};
