//! The orchestration engine.
//!
//! A [`Sidecar`] owns the Workload API client, the credential writer, the process side
//! channel and the write-status tracker, and drives them in exactly one [`RunMode`] chosen
//! at construction.

mod fetch;
mod watch;

use crate::bundle::JwtBundleSet;
use crate::disk::CredentialWriter;
use crate::error::SidecarError;
use crate::health::{HealthSnapshot, WriteStatusTracker};
use crate::process::ProcessManager;
use crate::workload_api::WorkloadApi;
use log::info;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch as state_watch;
use tokio_util::sync::CancellationToken;

/// One JWT SVID the sidecar maintains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JwtSvidTarget {
    /// Audience the SVID is requested and validated for.
    pub audience: String,
    /// Additional audiences requested with the SVID.
    pub extra_audiences: Vec<String>,
    /// File name handed to the [`CredentialWriter`].
    pub file_name: String,
    /// Full path of the file; the key of its write status.
    pub path: String,
}

/// What the sidecar fetches and how it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarSettings {
    /// Fetches and writes the X.509 context.
    pub x509_enabled: bool,
    /// Selects the X.509 SVID carrying this hint.
    pub hint: Option<String>,
    /// Path of the JWT bundle file; `None` disables JWT bundle writes.
    pub jwt_bundle_path: Option<String>,
    /// JWT SVIDs to maintain.
    pub jwt_svids: Vec<JwtSvidTarget>,
    /// Number of concurrent fetch cycles.
    pub parallel_requests: usize,
    /// Keeps running after the first cycle.
    pub daemon_mode: bool,
}

/// The operating mode, derived once from the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One fetch cycle.
    OneShot,
    /// `n` concurrent fetch cycles, once.
    OneShotBurst(usize),
    /// Streaming X.509 and JWT bundle watches plus one refresh loop per JWT SVID.
    WatchDaemon,
    /// `n` workers running fetch cycles back-to-back.
    PollDaemon(usize),
}

impl RunMode {
    /// Selects the mode for the daemon flag and the configured parallelism.
    pub fn select(daemon_mode: bool, parallel_requests: usize) -> Self {
        match (daemon_mode, parallel_requests) {
            (false, 0) => RunMode::OneShot,
            (false, n) => RunMode::OneShotBurst(n),
            (true, 0) => RunMode::WatchDaemon,
            (true, n) => RunMode::PollDaemon(n),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::OneShot => f.write_str("one-shot"),
            RunMode::OneShotBurst(n) => write!(f, "one-shot burst of {n}"),
            RunMode::WatchDaemon => f.write_str("watch daemon"),
            RunMode::PollDaemon(n) => write!(f, "poll daemon with {n} workers"),
        }
    }
}

/// Lifecycle of a [`Sidecar`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet running.
    Initializing,
    /// Running its mode.
    Running,
    /// Cancellation observed; waiting for tasks to return.
    ShuttingDown,
    /// All tasks returned.
    Stopped,
}

/// The sidecar engine.
pub struct Sidecar {
    settings: SidecarSettings,
    mode: RunMode,
    client: Arc<dyn WorkloadApi>,
    writer: Arc<dyn CredentialWriter>,
    process: ProcessManager,
    health: Arc<WriteStatusTracker>,
    jwt_bundles: RwLock<Option<Arc<JwtBundleSet>>>,
    lifecycle: state_watch::Sender<LifecycleState>,
}

impl fmt::Debug for Sidecar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sidecar")
            .field("settings", &self.settings)
            .field("mode", &self.mode)
            .field("process", &self.process)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Sidecar {
    /// Creates a sidecar. Every configured resource starts as unwritten.
    pub fn new(
        settings: SidecarSettings,
        client: Arc<dyn WorkloadApi>,
        writer: Arc<dyn CredentialWriter>,
        process: ProcessManager,
    ) -> Self {
        let jwt_paths = settings
            .jwt_bundle_path
            .iter()
            .chain(settings.jwt_svids.iter().map(|target| &target.path))
            .cloned();
        let health = Arc::new(WriteStatusTracker::new(settings.x509_enabled, jwt_paths));
        let mode = RunMode::select(settings.daemon_mode, settings.parallel_requests);
        let (lifecycle, _) = state_watch::channel(LifecycleState::Initializing);

        Self {
            settings,
            mode,
            client,
            writer,
            process,
            health,
            jwt_bundles: RwLock::new(None),
            lifecycle,
        }
    }

    /// Runs the configured mode until it completes or `cancel` fires.
    ///
    /// One-shot modes return the first error. Daemon modes return `Ok(())` after
    /// cancellation, or the first error that was not caused by cancellation once every task
    /// has returned.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), SidecarError> {
        self.lifecycle.send_replace(LifecycleState::Running);
        info!("Starting sidecar: mode={}", self.mode);

        let work = self.run_mode(cancel.clone());
        tokio::pin!(work);
        let result = tokio::select! {
            result = &mut work => result,
            () = cancel.cancelled() => {
                self.lifecycle.send_replace(LifecycleState::ShuttingDown);
                info!("Shutdown requested; waiting for tasks to finish");
                work.await
            }
        };

        self.lifecycle.send_replace(LifecycleState::Stopped);
        info!("Sidecar stopped: mode={}", self.mode);
        result
    }

    async fn run_mode(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), SidecarError> {
        match self.mode {
            RunMode::OneShot => self.fetch_all_credentials(&cancel).await,
            RunMode::OneShotBurst(n) => self.run_burst(n, cancel).await,
            RunMode::WatchDaemon => self.run_watch_daemon(cancel).await,
            RunMode::PollDaemon(n) => self.run_poll_daemon(n, cancel).await,
        }
    }

    /// Returns the mode selected at construction.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Returns the current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe_lifecycle(&self) -> state_watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Returns `false` iff any resource's latest write failed.
    pub fn check_liveness(&self) -> bool {
        self.health.check_liveness()
    }

    /// Returns `true` iff every resource has been written successfully.
    pub fn check_readiness(&self) -> bool {
        self.health.check_readiness()
    }

    /// Returns a copy of all write statuses.
    pub fn get_health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Returns the tracker backing the health probes.
    pub fn health_tracker(&self) -> Arc<WriteStatusTracker> {
        Arc::clone(&self.health)
    }

    /// Returns the process side channel.
    pub fn process(&self) -> &ProcessManager {
        &self.process
    }

    fn cached_jwt_bundles(&self) -> Option<Arc<JwtBundleSet>> {
        self.jwt_bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_jwt_bundles(&self, bundles: Arc<JwtBundleSet>) {
        *self
            .jwt_bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(bundles);
    }
}
