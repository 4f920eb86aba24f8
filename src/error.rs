//! Error types shared by every voxclone component

use std::time::Duration;

use thiserror::Error;

/// Result type alias for voxclone operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the caller boundary.
///
/// Every variant is recoverable by the caller. Only a `Capture` fault ends the
/// live voice loop, and even that leaves the rest of the daemon running.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, never retried automatically
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing profile or asset
    #[error("not found: {0}")]
    NotFound(String),

    /// Uploaded audio could not be decoded
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Filesystem or registry I/O failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Profile has zero usable samples
    #[error("profile {0} has no usable samples")]
    InsufficientSamples(String),

    /// Profile vanished between submission and processing
    #[error("profile {0} was deleted before its request was processed")]
    StaleProfile(String),

    /// Model failed to load; sticky until an explicit reload
    #[error("synthesis engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Scheduler did not drain within the caller's wait bound
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    /// Profile delete could not remove every asset; the profile is kept
    #[error("profile {profile_id} only partially deleted: {reason}")]
    PartialDelete { profile_id: String, reason: String },

    /// Inference failed on a loaded engine
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Speech-to-text failed
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Capture device fault
    #[error("capture device error: {0}")]
    Capture(String),

    /// Playback device fault
    #[error("playback error: {0}")]
    Playback(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable code used by the HTTP and D-Bus adapters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Storage(_) => "storage",
            Self::InsufficientSamples(_) => "insufficient_samples",
            Self::StaleProfile(_) => "stale_profile",
            Self::EngineUnavailable(_) => "engine_unavailable",
            Self::Timeout(_) => "timeout",
            Self::PartialDelete { .. } => "partial_delete",
            Self::Synthesis(_) => "synthesis",
            Self::Recognition(_) => "recognition",
            Self::Capture(_) => "capture",
            Self::Playback(_) => "playback",
            Self::Config(_) => "config",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("registry document: {e}"))
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(e: tempfile::PersistError) -> Self {
        Self::Storage(e.error.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
