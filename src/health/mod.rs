//! Write-status bookkeeping behind the liveness and readiness probes.
//!
//! Every persisted resource (the X.509 material as a whole, the JWT bundle file and each JWT
//! SVID file) starts as [`WriteStatus::Unwritten`] and moves to `Written` or `Failed` with every
//! write attempt. It never returns to `Unwritten`.

pub mod server;

use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Outcome of the latest write attempt of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    /// No write has been attempted yet.
    Unwritten,
    /// The latest write attempt failed.
    Failed,
    /// The latest write attempt succeeded.
    Written,
}

/// Immutable copy of all write statuses.
///
/// Serializes as
/// `{"file_write_statuses":{"x509_write_status":"written","jwt_write_status":{"<path>":"written"}}}`,
/// with `x509_write_status` omitted when X.509 material is not managed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Statuses of the persisted files.
    pub file_write_statuses: FileWriteStatuses,
}

/// Per-file write statuses of a [`HealthSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileWriteStatuses {
    /// Status of the X.509 SVID, key and bundle files, when X.509 is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x509_write_status: Option<WriteStatus>,
    /// Status of the JWT bundle file and JWT SVID files, keyed by path.
    pub jwt_write_status: BTreeMap<String, WriteStatus>,
}

impl HealthSnapshot {
    fn statuses(&self) -> impl Iterator<Item = WriteStatus> + '_ {
        self.file_write_statuses
            .x509_write_status
            .into_iter()
            .chain(self.file_write_statuses.jwt_write_status.values().copied())
    }

    /// Returns `false` iff any resource's latest write failed.
    pub fn is_live(&self) -> bool {
        self.statuses().all(|status| status != WriteStatus::Failed)
    }

    /// Returns `true` iff every resource has been written successfully.
    pub fn is_ready(&self) -> bool {
        self.statuses().all(|status| status == WriteStatus::Written)
    }
}

/// Thread-safe map from resource to [`WriteStatus`].
///
/// The set of resources is fixed at construction; recording an outcome for an unknown JWT
/// path is ignored with a warning.
#[derive(Debug)]
pub struct WriteStatusTracker {
    inner: RwLock<FileWriteStatuses>,
}

impl WriteStatusTracker {
    /// Creates a tracker for the X.509 material (when `x509_enabled`) and the given JWT paths,
    /// all [`WriteStatus::Unwritten`].
    pub fn new<I, S>(x509_enabled: bool, jwt_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let jwt_write_status = jwt_paths
            .into_iter()
            .map(|path| (path.into(), WriteStatus::Unwritten))
            .collect();

        Self {
            inner: RwLock::new(FileWriteStatuses {
                x509_write_status: x509_enabled.then_some(WriteStatus::Unwritten),
                jwt_write_status,
            }),
        }
    }

    /// Records the outcome of an X.509 write.
    pub fn record_x509(&self, written: bool) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if guard.x509_write_status.is_some() {
            guard.x509_write_status = Some(outcome(written));
        }
    }

    /// Records the outcome of a write to the JWT file at `path`.
    pub fn record_jwt(&self, path: &str, written: bool) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match guard.jwt_write_status.get_mut(path) {
            Some(status) => *status = outcome(written),
            None => warn!("Ignoring write status of untracked file: path={}", path),
        }
    }

    /// Returns an immutable copy of all statuses.
    pub fn snapshot(&self) -> HealthSnapshot {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        HealthSnapshot {
            file_write_statuses: guard.clone(),
        }
    }

    /// Returns `false` iff any resource's latest write failed.
    pub fn check_liveness(&self) -> bool {
        self.snapshot().is_live()
    }

    /// Returns `true` iff every resource has been written successfully.
    pub fn check_readiness(&self) -> bool {
        self.snapshot().is_ready()
    }
}

fn outcome(written: bool) -> WriteStatus {
    if written {
        WriteStatus::Written
    } else {
        WriteStatus::Failed
    }
}
