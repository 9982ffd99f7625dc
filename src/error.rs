//! Crate-wide error vocabulary.
//!
//! Per-connection failures (transient I/O, malformed requests, resource
//! errors, database errors) never propagate past the connection that caused
//! them -- they're turned into a close or a 4xx response at the
//! `Connection`/`Reactor` boundary. This type exists for the handful of
//! fallible operations that need to report *why* a connection was dropped,
//! for logging.

use thiserror::Error;

use crate::http::request::ParseError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors a connection-level or pool-level operation can fail with.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A fatal I/O error: peer reset, broken pipe, or similar.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request line or header block was malformed.
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),

    /// A database session could not complete a query. Treated as a
    /// verification failure by callers, never surfaced as a 500.
    #[error("database error: {0}")]
    Database(#[from] mysql::Error),

    /// `DbPool` was asked to hand out more sessions than it was built with.
    #[error("database pool exhausted")]
    PoolExhausted,
}
