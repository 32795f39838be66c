//! gRPC client for the SPIFFE Workload API over a Unix domain socket.

use crate::bundle::{JwtBundle, JwtBundleSet};
use crate::svid::jwt::JwtSvid;
use crate::svid::trust_domain_name;
use crate::svid::x509::{split_certificates, X509Context, X509Svid};
use crate::workload_api::pb::spiffe_workload_api_client::SpiffeWorkloadApiClient;
use crate::workload_api::pb::{
    JwtBundlesRequest, JwtBundlesResponse, JwtsvidRequest, X509svidRequest, X509svidResponse,
};
use crate::workload_api::supervisor::{supervise_stream, StreamKind};
use crate::workload_api::{WorkloadApi, WorkloadApiError};
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

const SPIFFE_HEADER_KEY: &str = "workload.spiffe.io";
const SPIFFE_HEADER_VALUE: &str = "true";

type GrpcClient = SpiffeWorkloadApiClient<InterceptedService<Channel, MetadataAdder>>;

/// Client for the SPIFFE Workload API.
///
/// The underlying channel connects lazily, so constructing a client never blocks on the
/// agent being up; the first call (or stream) does.
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    socket_path: Arc<str>,
    client: GrpcClient,
}

/// Tonic interceptor that adds the Workload API metadata header required by SPIRE.
#[derive(Debug, Clone)]
struct MetadataAdder;

impl tonic::service::Interceptor for MetadataAdder {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        let parsed_header = SPIFFE_HEADER_VALUE
            .parse()
            .map_err(|e| tonic::Status::internal(format!("Failed to parse header: {e}")))?;
        request
            .metadata_mut()
            .insert(SPIFFE_HEADER_KEY, parsed_header);
        Ok(request)
    }
}

/// Resolves an agent address (`/path`, `unix:/path` or `unix:///path`) to a socket path.
pub fn socket_path_from_address(address: &str) -> Result<&str, WorkloadApiError> {
    let path = address
        .strip_prefix("unix://")
        .or_else(|| address.strip_prefix("unix:"))
        .unwrap_or(address);

    if path.is_empty() {
        return Err(WorkloadApiError::InvalidAddress(address.to_owned()));
    }
    if path.contains("://") || path.starts_with("tcp:") {
        return Err(WorkloadApiError::InvalidAddress(format!(
            "{address}: only unix domain sockets are supported"
        )));
    }
    Ok(path)
}

impl WorkloadApiClient {
    const TONIC_DEFAULT_URI: &'static str = "http://[::]:50051";

    /// Creates a client for the agent listening at `address`.
    ///
    /// The address may be a plain path or be prefixed with `unix:` or `unix://`.
    pub fn new_from_path(address: impl AsRef<str>) -> Result<Self, WorkloadApiError> {
        let socket_path: Arc<str> = Arc::from(socket_path_from_address(address.as_ref())?);

        let connector_path = Arc::clone(&socket_path);
        let channel = Endpoint::from_static(Self::TONIC_DEFAULT_URI).connect_with_connector_lazy(
            service_fn(move |_: Uri| {
                let path = Arc::clone(&connector_path);
                async move { UnixStream::connect(&*path).await.map(TokioIo::new) }
            }),
        );

        Ok(WorkloadApiClient {
            socket_path,
            client: SpiffeWorkloadApiClient::with_interceptor(channel, MetadataAdder),
        })
    }

    /// Returns the Workload API socket path.
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    fn grpc(&self) -> GrpcClient {
        self.client.clone()
    }

    async fn stream_x509_contexts(
        &self,
    ) -> Result<
        impl tokio_stream::Stream<Item = Result<X509Context, WorkloadApiError>>,
        WorkloadApiError,
    > {
        let response = self.grpc().fetch_x509svid(X509svidRequest::default()).await?;
        Ok(response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(parse_x509_context)
        }))
    }

    async fn stream_jwt_bundles(
        &self,
    ) -> Result<
        impl tokio_stream::Stream<Item = Result<JwtBundleSet, WorkloadApiError>>,
        WorkloadApiError,
    > {
        let response = self
            .grpc()
            .fetch_jwt_bundles(JwtBundlesRequest::default())
            .await?;
        Ok(response.into_inner().map(|message| {
            message
                .map_err(WorkloadApiError::from)
                .and_then(parse_jwt_bundle_set)
        }))
    }
}

#[async_trait]
impl WorkloadApi for WorkloadApiClient {
    async fn fetch_x509_context(&self) -> Result<X509Context, WorkloadApiError> {
        let response = self
            .grpc()
            .fetch_x509svid(X509svidRequest::default())
            .await?
            .into_inner()
            .message()
            .await?
            .ok_or(WorkloadApiError::EmptyResponse)?;
        parse_x509_context(response)
    }

    async fn watch_x509_contexts(
        &self,
        updates: mpsc::Sender<X509Context>,
        cancel: CancellationToken,
    ) -> Result<(), WorkloadApiError> {
        supervise_stream(StreamKind::X509Context, &cancel, &updates, || {
            self.stream_x509_contexts()
        })
        .await
    }

    async fn fetch_jwt_bundles(&self) -> Result<JwtBundleSet, WorkloadApiError> {
        let response = self
            .grpc()
            .fetch_jwt_bundles(JwtBundlesRequest::default())
            .await?
            .into_inner()
            .message()
            .await?
            .ok_or(WorkloadApiError::EmptyResponse)?;
        parse_jwt_bundle_set(response)
    }

    async fn watch_jwt_bundles(
        &self,
        updates: mpsc::Sender<JwtBundleSet>,
        cancel: CancellationToken,
    ) -> Result<(), WorkloadApiError> {
        supervise_stream(StreamKind::JwtBundles, &cancel, &updates, || {
            self.stream_jwt_bundles()
        })
        .await
    }

    async fn fetch_jwt_svids(
        &self,
        audience: &str,
        extra_audiences: &[String],
    ) -> Result<Vec<JwtSvid>, WorkloadApiError> {
        let request = JwtsvidRequest {
            audience: std::iter::once(audience.to_owned())
                .chain(extra_audiences.iter().cloned())
                .collect(),
            spiffe_id: String::new(),
        };

        let response = self.grpc().fetch_jwtsvid(request).await?.into_inner();
        response
            .svids
            .into_iter()
            .map(|svid| -> Result<JwtSvid, WorkloadApiError> {
                Ok(JwtSvid::parse_insecure(&svid.svid)?.with_hint(svid.hint))
            })
            .collect()
    }
}

fn parse_x509_context(response: X509svidResponse) -> Result<X509Context, WorkloadApiError> {
    if response.svids.is_empty() {
        return Err(WorkloadApiError::EmptyResponse);
    }

    let mut svids = Vec::with_capacity(response.svids.len());
    let mut bundles = BTreeMap::new();

    for svid in response.svids {
        let x509_svid = X509Svid::parse_from_der(svid.spiffe_id, &svid.x509_svid, &svid.x509_svid_key)?
            .with_hint(svid.hint);

        if !svid.bundle.is_empty() {
            bundles
                .entry(x509_svid.trust_domain().to_owned())
                .or_insert(split_certificates(&svid.bundle)?);
        }
        svids.push(x509_svid);
    }

    for (trust_domain, bundle) in response.federated_bundles {
        let name = trust_domain_name(&trust_domain)
            .unwrap_or(&trust_domain)
            .to_owned();
        bundles.insert(name, split_certificates(&bundle)?);
    }

    Ok(X509Context::new(svids, bundles))
}

fn parse_jwt_bundle_set(response: JwtBundlesResponse) -> Result<JwtBundleSet, WorkloadApiError> {
    let mut bundle_set = JwtBundleSet::new();
    for (trust_domain, jwks) in response.bundles {
        let name = trust_domain_name(&trust_domain)
            .unwrap_or(&trust_domain)
            .to_owned();
        bundle_set.add_bundle(JwtBundle::from_jwks(name, &jwks)?);
    }
    Ok(bundle_set)
}
