//! Error types for Workload API operations.

use crate::bundle::JwtBundleError;
use crate::svid::jwt::JwtSvidError;
use crate::svid::x509::X509SvidError;
use thiserror::Error;

/// Errors produced by Workload API operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkloadApiError {
    /// The configured agent address is not a usable Unix domain socket path.
    #[error("invalid workload api address: {0}")]
    InvalidAddress(String),

    /// The Workload API returned an empty response.
    #[error("empty Workload API response")]
    EmptyResponse,

    /// The Workload API denied issuing an identity for this workload (e.g. selectors do not match).
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The Workload API denied the request for other permission reasons.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The call failed with a gRPC status.
    #[error("grpc status: {0}")]
    Grpc(tonic::Status),

    /// The gRPC transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A streaming call ended without an error.
    #[error("workload api stream ended")]
    StreamEnded,

    /// Failed to parse an X.509 SVID from the Workload API response.
    #[error("failed to parse X.509 SVID: {0}")]
    X509Svid(#[from] X509SvidError),

    /// Failed to parse a JWT-SVID from the Workload API response.
    #[error("failed to parse JWT-SVID: {0}")]
    JwtSvid(#[from] JwtSvidError),

    /// Failed to parse a JWT bundle from the Workload API response.
    #[error("failed to parse JWT bundle: {0}")]
    JwtBundle(#[from] JwtBundleError),
}

impl From<tonic::Status> for WorkloadApiError {
    fn from(status: tonic::Status) -> Self {
        if status.code() == tonic::Code::PermissionDenied {
            let msg = status.message();
            if msg.contains("no identity issued") {
                return Self::NoIdentityIssued;
            }
            return Self::PermissionDenied(msg.to_owned());
        }

        Self::Grpc(status)
    }
}
