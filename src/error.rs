//! Error taxonomy for query execution.
//!
//! Only transport faults are recovered locally (bounded by the retry budget). Every other
//! kind reaches the caller as soon as it is observed, carrying enough detail to diagnose
//! the failure without re-running the query.
use std::time::Duration;

use thiserror::Error;

use crate::protocol::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("gave up after {attempts} attempts over {elapsed:?}: {source}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: TransportError,
    },

    /// Submission failed after the request may have reached the server. Retrying could run
    /// the statement twice.
    #[error("submission outcome unknown, not retrying: {0}")]
    UnsafeToRetry(#[source] TransportError),

    #[error("server operation failed [{code}]: {message}")]
    ServerOperation { code: String, message: String },

    #[error("result cannot be recovered: {0}")]
    UnrecoverableResult(String),

    #[error("operation was canceled")]
    Cancellation,

    #[error("integrity check failed for file at row offset {row_offset}: {reason}")]
    Integrity { row_offset: i64, reason: String },

    #[error("request not authorized (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("exceeded {max} redirects, last location '{location}'")]
    TooManyRedirects { max: u32, location: String },

    /// Local download workers could not be started. Not a remote fault.
    #[error("cannot start download workers: {0}")]
    WorkerPool(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("handle is closed")]
    Closed,

    #[error("invalid execution identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("unexpected response to {request}: {detail}")]
    Protocol {
        request: &'static str,
        detail: String,
    },
}

impl Error {
    pub(crate) fn integrity(row_offset: i64, reason: impl Into<String>) -> Self {
        Error::Integrity {
            row_offset,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
