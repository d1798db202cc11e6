use std::{error::Error, fmt, io};

use crate::aggregation::AggregationErr;

/// The coordinator module's result type.
pub type Result<T> = std::result::Result<T, CoordinatorErr>;

/// Coordinator runtime failures.
#[derive(Debug)]
pub enum CoordinatorErr {
    Io(io::Error),
    /// A result was refused by the local aggregator.
    Aggregation(AggregationErr),
    /// The server answered the handshake with something else than `NodeInfo`.
    UnexpectedMessage { got: &'static str },
    /// The connection was closed, either by `disconnect` or by the server.
    Disconnected,
    /// The connection dropped before the handshake completed.
    HandshakeClosed,
}

impl fmt::Display for CoordinatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorErr::Io(e) => write!(f, "io error: {e}"),
            CoordinatorErr::Aggregation(e) => write!(f, "aggregation error: {e}"),
            CoordinatorErr::UnexpectedMessage { got } => {
                write!(f, "unexpected message during handshake: got {got}")
            }
            CoordinatorErr::Disconnected => f.write_str("disconnected from the session"),
            CoordinatorErr::HandshakeClosed => {
                f.write_str("connection closed before the handshake completed")
            }
        }
    }
}

impl Error for CoordinatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CoordinatorErr::Io(e) => Some(e),
            CoordinatorErr::Aggregation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoordinatorErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<AggregationErr> for CoordinatorErr {
    fn from(value: AggregationErr) -> Self {
        Self::Aggregation(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CoordinatorErr> for io::Error {
    fn from(value: CoordinatorErr) -> Self {
        match value {
            CoordinatorErr::Io(e) => e,
            CoordinatorErr::Disconnected | CoordinatorErr::HandshakeClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, value)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
