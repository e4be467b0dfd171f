//! Centralized error types for the hmyload workspace.

use std::time::Duration;
use thiserror::Error;

/// Top-level error enum. Variants map to subsystems.
///
/// Cache misses and unresolved method signatures are not errors; they are
/// reported through `Option` and counters respectively.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// Dial failure, handshake rejection, socket error or malformed reply.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {after:?} waiting for {method}")]
    Timeout { method: String, after: Duration },

    /// The node answered with a JSON-RPC error object where a result was required.
    #[error("RPC error {code} from {method}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// Malformed hex, wrong-length byte strings, bad codec layout.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache at {0} is closed")]
    Closed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoadError {
    pub fn decode(context: impl std::fmt::Display) -> Self {
        Self::Decode(context.to_string())
    }

    pub fn transport(context: impl std::fmt::Display) -> Self {
        Self::Transport(context.to_string())
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
