use std::{error::Error, fmt, io};

use comms::NodeId;

/// The aggregation module's result type.
pub type Result<T> = std::result::Result<T, AggregationErr>;

/// Failures raised by the `Aggregator`.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationErr {
    /// `add` was called for a contribution that `is_valid_contribution` rejects.
    ///
    /// Callers must screen contributions first, so this is always a bug in the caller.
    InvalidContribution {
        node: NodeId,
        round: u64,
        current: u64,
    },
}

impl fmt::Display for AggregationErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidContribution {
                node,
                round,
                current,
            } => write!(
                f,
                "tried adding an invalid contribution from node {node} for round {round} \
                 while at round {current}, it must be screened before calling add"
            ),
        }
    }
}

impl Error for AggregationErr {}

/// Boundary conversion for the session's io driven tasks.
impl From<AggregationErr> for io::Error {
    fn from(value: AggregationErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, value)
    }
}

/// Error returned when building a `Threshold` out of meaningless values.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdErr {
    ZeroCount,
    FractionOutOfRange(f64),
}

impl fmt::Display for ThresholdErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCount => {
                f.write_str("absolute threshold must require at least one contribution")
            }
            Self::FractionOutOfRange(fraction) => {
                write!(f, "relative threshold must be within (0, 1], got {fraction}")
            }
        }
    }
}

impl Error for ThresholdErr {}
