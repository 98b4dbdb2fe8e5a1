//! Error kinds shared across the engine, scheduler, and session layers.
//!
//! These model the error *kinds* named in the design (not a 1:1 mirror of any
//! wire/exception type): source-side failures the copy engine can retry past,
//! and terminal failures the session surfaces to its caller.

use crate::hash::ContentHash;

/// Failures a single replica attempt can produce; most are retryable at the
/// engine's discretion (see [`crate::copy_engine`]).
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("source {location} reported the content as missing")]
    SourceMissing { location: String },

    #[error("source {location} is unreachable or misbehaving: {detail}")]
    SourceBad { location: String, detail: String },

    #[error("destination out of disk space: {detail}")]
    DestinationFull { detail: String },

    #[error("destination error: {detail}")]
    DestinationError { detail: String },

    #[error("hash mismatch at {location}: expected {expected}, found {found}")]
    HashMismatch {
        location: String,
        expected: ContentHash,
        found: ContentHash,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("local or persistent store rejected the put: {detail}")]
    PutRejected { detail: String },

    #[error("exhausted the retry budget after {attempts} attempts")]
    MaxRetries { attempts: u32 },

    #[error("no candidate location for {hash} could satisfy the request: {detail}")]
    NotFound { hash: ContentHash, detail: String },
}

impl CopyError {
    /// The copy engine never retries past these — they terminate the whole call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CopyError::DestinationFull { .. }
                | CopyError::Cancelled
                | CopyError::PutRejected { .. }
                | CopyError::MaxRetries { .. }
        )
    }
}

/// Failures the admission-control layer can report.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("admission control timed out waiting for a free slot")]
    Timeout,
}

/// Failures surfaced at the session boundary.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("content {hash} could not be placed from any tier: {message}")]
    NotPlacedContentNotFound { hash: ContentHash, message: String },

    #[error("store rejected the request: {0}")]
    PutRejected(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("scheduler admission timed out")]
    SchedulerTimeout,

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error("unexpected failure: {0}")]
    Other(String),
}

impl From<SchedulerError> for SessionError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::Timeout => SessionError::SchedulerTimeout,
        }
    }
}
