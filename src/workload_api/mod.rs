//! Access to the SPIFFE Workload API.
//!
//! [`WorkloadApi`] is the seam the sidecar talks through; [`WorkloadApiClient`] implements it
//! over gRPC on a Unix domain socket.

#[allow(
    clippy::derive_partial_eq_without_eq,
    clippy::doc_markdown,
    missing_docs,
    missing_debug_implementations,
    unreachable_pub
)]
pub(crate) mod pb {
    include!(concat!(env!("OUT_DIR"), "/_.rs"));
}

pub mod client;
pub mod error;
pub(crate) mod supervisor;

pub use client::WorkloadApiClient;
pub use error::WorkloadApiError;

use crate::bundle::JwtBundleSet;
use crate::svid::jwt::JwtSvid;
use crate::svid::x509::X509Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identity operations the sidecar needs from the Workload API.
///
/// The watch methods run until `cancel` fires or the receiving end of `updates` is dropped,
/// reconnecting on their own in between. Both endings return `Ok(())`.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Fetches the current X.509 context (SVIDs and bundles).
    async fn fetch_x509_context(&self) -> Result<X509Context, WorkloadApiError>;

    /// Streams X.509 context updates into `updates`.
    async fn watch_x509_contexts(
        &self,
        updates: mpsc::Sender<X509Context>,
        cancel: CancellationToken,
    ) -> Result<(), WorkloadApiError>;

    /// Fetches the current JWT bundle set.
    async fn fetch_jwt_bundles(&self) -> Result<JwtBundleSet, WorkloadApiError>;

    /// Streams JWT bundle set updates into `updates`.
    async fn watch_jwt_bundles(
        &self,
        updates: mpsc::Sender<JwtBundleSet>,
        cancel: CancellationToken,
    ) -> Result<(), WorkloadApiError>;

    /// Fetches the JWT-SVIDs issued for `audience` plus `extra_audiences`.
    ///
    /// The returned SVIDs are parsed but not validated; the caller validates them against a
    /// JWT bundle set.
    async fn fetch_jwt_svids(
        &self,
        audience: &str,
        extra_audiences: &[String],
    ) -> Result<Vec<JwtSvid>, WorkloadApiError>;
}
