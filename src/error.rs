//! Error types shared across the crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A zone definition was rejected at load time. Nothing from the
    /// offending configuration is applied.
    #[error("invalid zone `{zone_id}`: {reason}")]
    InvalidZone { zone_id: String, reason: String },

    #[error("malformed zone configuration: {0}")]
    ZoneConfig(#[from] serde_json::Error),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("channel pipeline has already been shut down")]
    ChannelClosed,
}

impl Error {
    pub(crate) fn invalid_zone(zone_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidZone {
            zone_id: zone_id.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by a detection, embedding or classification backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("deadline exceeded")]
    TimedOut,
}

/// Failure reported by a storage sink.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    /// Worth retrying after a backoff.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// Retrying will not help; the batch is dropped.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}
