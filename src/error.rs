//! Error types shared across the traversal components.
//!
//! Budget saturation and traversal completion are ordinary return values, not
//! errors. Only page fetching, checkpoint I/O, sinks and settings loading can
//! fail in the error sense.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a fetch can never succeed as issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    /// Credentials rejected or insufficient.
    Auth,
    /// The API rejected the query itself.
    MalformedQuery,
    /// The organization or scoped entity does not exist.
    NotFound,
    /// The response could not be interpreted.
    MalformedResponse,
}

impl FatalKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            FatalKind::Auth => "auth",
            FatalKind::MalformedQuery => "malformed_query",
            FatalKind::NotFound => "not_found",
            FatalKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Errors returned by a page fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure, 5xx, or secondary throttling. Safe to retry.
    #[error("transient fetch error: {message}")]
    Transient {
        message: String,
        /// Server-requested minimum delay (`Retry-After`).
        retry_after: Option<Duration>,
    },

    /// Not retryable; aborts the current run.
    #[error("fatal fetch error ({kind}): {message}")]
    Fatal { kind: FatalKind, message: String },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        FetchError::Fatal {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    /// Stable label for reports.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Transient { .. } => "transient",
            FetchError::Fatal { .. } => "fatal",
        }
    }
}

/// Errors from checkpoint encoding and persistence.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored checksum does not match the stored state.
    #[error("checkpoint checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Checkpoint written by an incompatible format version.
    #[error("unsupported checkpoint format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Traversal id is empty or not usable as a storage key.
    #[error("invalid traversal id: {0:?}")]
    InvalidTraversalId(String),
}

impl CheckpointError {
    /// The stored bytes exist but cannot be trusted.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            CheckpointError::Json(_)
                | CheckpointError::ChecksumMismatch { .. }
                | CheckpointError::UnsupportedVersion { .. }
        )
    }
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Errors raised by an entity sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The receiving side has gone away.
    #[error("entity sink closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}
