//! HTTP listener exposing the liveness and readiness probes.

use crate::health::{HealthSnapshot, WriteStatusTracker};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Paths and port of the health listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthServerConfig {
    /// Port to bind on all interfaces.
    pub bind_port: u16,
    /// Path answering the liveness probe.
    pub liveness_path: String,
    /// Path answering the readiness probe.
    pub readiness_path: String,
}

type Probe = (StatusCode, Json<HealthSnapshot>);

async fn liveness(State(tracker): State<Arc<WriteStatusTracker>>) -> Probe {
    let snapshot = tracker.snapshot();
    (probe_status(snapshot.is_live()), Json(snapshot))
}

async fn readiness(State(tracker): State<Arc<WriteStatusTracker>>) -> Probe {
    let snapshot = tracker.snapshot();
    (probe_status(snapshot.is_ready()), Json(snapshot))
}

fn probe_status(healthy: bool) -> StatusCode {
    if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Builds the probe router for `tracker`.
pub fn router(config: &HealthServerConfig, tracker: Arc<WriteStatusTracker>) -> Router {
    Router::new()
        .route(&config.liveness_path, get(liveness))
        .route(&config.readiness_path, get(readiness))
        .with_state(tracker)
}

/// Serves the probes until `cancel` fires.
pub async fn serve(
    config: HealthServerConfig,
    tracker: Arc<WriteStatusTracker>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Health listener started: addr={}, liveness_path={}, readiness_path={}",
        addr, config.liveness_path, config.readiness_path
    );

    axum::serve(listener, router(&config, tracker))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get_status(port: u16, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_probes_follow_tracker() {
        let tracker = Arc::new(WriteStatusTracker::new(true, ["/certs/a.token"]));
        let config = HealthServerConfig {
            bind_port: 0,
            liveness_path: "/live".into(),
            readiness_path: "/ready".into(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = router(&config, Arc::clone(&tracker));
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        assert!(get_status(port, "/live").await.starts_with("HTTP/1.1 200"));
        assert!(get_status(port, "/ready").await.starts_with("HTTP/1.1 500"));

        tracker.record_x509(true);
        tracker.record_jwt("/certs/a.token", true);
        let response = get_status(port, "/ready").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""x509_write_status":"written""#));

        tracker.record_x509(false);
        assert!(get_status(port, "/live").await.starts_with("HTTP/1.1 500"));

        server.abort();
    }
}
