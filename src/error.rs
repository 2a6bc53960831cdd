use std::io;

use thiserror::Error;

use crate::parser::ParseError;
use crate::tls::TlsError;

/// Central error type for the engine.
///
/// Setup paths (`bind`, `listen`, certificate loading) surface these to the
/// caller. Per-connection failures never bubble up this far: they are logged
/// and the connection is closed.
#[derive(Debug, Error)]
pub enum MazurkaError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0:?}")]
    Parse(ParseError),

    /// TLS setup or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The listen address could not be understood.
    #[error("invalid listen address: {0}")]
    Addr(String),

    /// Connection pool reached its maximum capacity.
    #[error("connection pool is full")]
    PoolFull,

    /// A background worker panicked or failed to start.
    #[error("worker failure: {0}")]
    Worker(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

impl From<ParseError> for MazurkaError {
    fn from(e: ParseError) -> Self {
        MazurkaError::Parse(e)
    }
}

pub type MazurkaResult<T> = Result<T, MazurkaError>;
