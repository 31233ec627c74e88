//! Error types for Keel.
//!
//! Allocation decisions are data, not errors: a shard that cannot be placed
//! stays unassigned with a recorded [`Decision`] rather than raising anything.
//! Only configuration validation and explicit allocation commands produce
//! `Err` values, and those are surfaced to the operator verbatim.
//!
//! [`Decision`]: https://docs.rs/keel-allocation

use thiserror::Error;

/// A specialized `Result` type for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during configuration or command handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (invalid setting value, duplicate decider, ...).
    /// Raised at startup or settings-update time, never mid-pass.
    #[error("configuration error: {0}")]
    Config(String),

    /// An explicit allocation command was rejected during validation.
    /// The routing table is left untouched.
    #[error("invalid allocation command: {reason}")]
    InvalidCommand {
        /// Why the command was rejected.
        reason: String,
    },

    /// The referenced index does not exist in the cluster state.
    #[error("index '{0}' not found")]
    IndexNotFound(String),

    /// The referenced shard does not exist.
    #[error("shard [{index}][{shard}] not found")]
    ShardNotFound {
        /// Index name.
        index: String,
        /// Shard number.
        shard: u32,
    },

    /// The referenced node is not part of the cluster.
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    /// I/O error (settings file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates an `InvalidCommand` error.
    #[must_use]
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand { reason: reason.into() }
    }
}
