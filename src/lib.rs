#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! A sidecar that keeps SPIFFE identity material fresh on disk for a co-located workload.
//!
//! The sidecar talks to the
//! [SPIFFE Workload API](https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE_Workload_API.md)
//! and persists X.509 SVIDs, X.509 bundles, JWT bundles and JWT SVIDs into a directory the
//! workload reads from. After every X.509 rotation it can start the workload (once) and
//! afterwards signal it, or signal an already running process through a PID file.
//!
//! The engine is [`Sidecar`]. It supports four run modes, selected once from configuration:
//!
//! - one-shot: fetch and write everything once,
//! - one-shot burst: run `parallel_requests` concurrent fetch cycles once,
//! - watch daemon: stream X.509 and JWT bundle updates and refresh each JWT SVID at half
//!   its remaining lifetime,
//! - poll daemon: keep `parallel_requests` workers fetching back-to-back.
//!
//! ```no_run
//! use spiffe_helper::{Config, DiskWriter, ProcessManager, Sidecar, WorkloadApiClient};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = Config::from_file("helper.conf")?;
//! config.validate()?;
//!
//! let client = WorkloadApiClient::new_from_path(&config.agent_address)?;
//! let sidecar = Arc::new(Sidecar::new(
//!     config.sidecar_settings(),
//!     Arc::new(client),
//!     Arc::new(DiskWriter::new(config.disk_config())),
//!     ProcessManager::new(config.process_config()?),
//! ));
//!
//! sidecar.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bundle;
pub mod config;
pub mod disk;
pub mod error;
pub mod health;
pub mod process;
pub mod sidecar;
pub mod svid;
pub mod workload_api;

// -----------------------
// Re-exports
// -----------------------

pub use crate::{
    backoff::RetryScheduler,
    bundle::{JwtBundle, JwtBundleError, JwtBundleSet},
    config::{Config, ConfigError},
    disk::{CredentialWriter, DiskError, DiskWriter},
    error::SidecarError,
    health::{HealthSnapshot, WriteStatus, WriteStatusTracker},
    process::{ProcessConfig, ProcessError, ProcessManager, ProcessStats, RenewSignal},
    sidecar::{JwtSvidTarget, LifecycleState, RunMode, Sidecar, SidecarSettings},
    svid::jwt::{JwtSvid, JwtSvidError},
    svid::x509::{X509Context, X509Svid, X509SvidError},
    workload_api::{WorkloadApi, WorkloadApiClient, WorkloadApiError},
};
