//! Reconnecting supervisor shared by the Workload API stream watchers.

use crate::backoff::{next_backoff, sleep_or_cancel};
use crate::workload_api::WorkloadApiError;
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Maximum number of consecutive identical errors before suppressing WARN logs.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

pub(crate) const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
pub(crate) const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

// "no identity issued" is an expected transient state while the workload gets registered.
const MIN_NO_IDENTITY_BACKOFF: Duration = Duration::from_secs(1);

/// The stream a supervisor maintains; used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    X509Context,
    JwtBundles,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::X509Context => f.write_str("x509_context"),
            StreamKind::JwtBundles => f.write_str("jwt_bundles"),
        }
    }
}

/// Allocation-free key type for error tracking categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    StreamConnect,
    StreamError,
    StreamEnded,
    NoIdentityIssued,
}

/// Tracks consecutive occurrences of the same error kind so that repeated failures are logged
/// at WARN only for the first few occurrences and at DEBUG afterwards.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

fn error_key(default: ErrorKey, err: &WorkloadApiError) -> ErrorKey {
    if matches!(err, WorkloadApiError::NoIdentityIssued) {
        ErrorKey::NoIdentityIssued
    } else {
        default
    }
}

fn log_failure(
    tracker: &mut ErrorTracker,
    key: ErrorKey,
    kind: StreamKind,
    err: &WorkloadApiError,
    backoff: Duration,
) {
    if tracker.record_error(key) {
        warn!(
            "Workload API stream failed; retrying: stream={}, error={}, backoff_ms={}",
            kind,
            err,
            backoff.as_millis()
        );
    } else {
        debug!(
            "Workload API stream failed (repeated); retrying: stream={}, error={}, backoff_ms={}, consecutive_failures={}",
            kind,
            err,
            backoff.as_millis(),
            tracker.consecutive_count()
        );
    }
}

/// Keeps a Workload API stream connected and forwards every update into `updates`.
///
/// `connect` opens a new stream. Connection failures, stream errors and stream ends are
/// retried with jittered exponential backoff; the backoff resets once a stream delivers an
/// update. Returns `Ok(())` when `cancel` fires or when the receiver of `updates` is dropped.
pub(crate) async fn supervise_stream<T, F, Fut, S>(
    kind: StreamKind,
    cancel: &CancellationToken,
    updates: &mpsc::Sender<T>,
    mut connect: F,
) -> Result<(), WorkloadApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, WorkloadApiError>>,
    S: Stream<Item = Result<T, WorkloadApiError>>,
{
    let mut backoff = MIN_RECONNECT_BACKOFF;
    let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

    loop {
        let connected = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = connect() => result,
        };

        let failure = match connected {
            Err(e) => (error_key(ErrorKey::StreamConnect, &e), e),
            Ok(stream) => {
                if tracker.consecutive_count() > 0 {
                    info!(
                        "Workload API stream recovered after {} consecutive failures: stream={}",
                        tracker.consecutive_count(),
                        kind
                    );
                }
                debug!("Connected to Workload API stream: stream={}", kind);

                tokio::pin!(stream);
                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        next = stream.next() => next,
                    };

                    match next {
                        Some(Ok(update)) => {
                            tracker.reset();
                            backoff = MIN_RECONNECT_BACKOFF;
                            if updates.send(update).await.is_err() {
                                debug!("Update receiver dropped; stopping: stream={}", kind);
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => break (error_key(ErrorKey::StreamError, &e), e),
                        None => break (ErrorKey::StreamEnded, WorkloadApiError::StreamEnded),
                    }
                }
            }
        };

        let (key, err) = failure;
        if key == ErrorKey::NoIdentityIssued {
            backoff = backoff.max(MIN_NO_IDENTITY_BACKOFF);
        }
        log_failure(&mut tracker, key, kind, &err, backoff);

        if sleep_or_cancel(cancel, backoff).await {
            return Ok(());
        }
        backoff = next_backoff(backoff, MAX_RECONNECT_BACKOFF);
    }
}
