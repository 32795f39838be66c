//! Error type returned by the sidecar engine.

use crate::disk::DiskError;
use crate::svid::jwt::JwtSvidError;
use crate::workload_api::WorkloadApiError;
use thiserror::Error;

/// Errors produced while fetching, validating or persisting credentials.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SidecarError {
    /// The operation observed the cancellation signal and stopped.
    ///
    /// Daemon modes treat this as a clean shutdown, never as a failure.
    #[error("operation cancelled")]
    Cancelled,

    /// The Workload API call failed.
    #[error(transparent)]
    WorkloadApi(#[from] WorkloadApiError),

    /// A freshly issued JWT-SVID did not pass parsing or validation.
    #[error("jwt svid rejected: {0}")]
    JwtSvid(#[from] JwtSvidError),

    /// Persisting credential material failed.
    #[error(transparent)]
    Disk(#[from] DiskError),

    /// The Workload API returned no JWT-SVID for a requested audience.
    #[error("no JWT-SVIDs returned for audience {audience}")]
    NoJwtSvids {
        /// The audience that was requested.
        audience: String,
    },

    /// No SVID carries the configured hint.
    #[error("no SVID found with hint: {0}")]
    HintNotFound(String),

    /// A spawned task panicked or was aborted.
    #[error("task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl SidecarError {
    /// Returns `true` if the error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SidecarError::Cancelled)
    }
}
