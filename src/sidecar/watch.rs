//! Long-running modes: streaming watches, JWT SVID refresh loops and poll workers.

use super::{JwtSvidTarget, Sidecar};
use crate::backoff::{refresh_delay, sleep_or_cancel, RetryScheduler};
use crate::error::SidecarError;
use log::{debug, error, info, warn};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the channel between a stream supervisor and its consumer.
const UPDATE_CHANNEL_CAPACITY: usize = 8;

impl Sidecar {
    /// Runs `n` fetch cycles concurrently and returns the first error.
    pub(super) async fn run_burst(
        self: &Arc<Self>,
        n: usize,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        let mut tasks = JoinSet::new();
        for _ in 0..n {
            let sidecar = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move { sidecar.fetch_all_credentials(&cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined.map_err(SidecarError::from).and_then(|result| result) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs `n` workers, each repeating fetch cycles until cancellation.
    pub(super) async fn run_poll_daemon(
        self: &Arc<Self>,
        n: usize,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        let siblings = cancel.child_token();
        let mut tasks = JoinSet::new();
        for worker in 0..n {
            tasks.spawn(Arc::clone(self).poll_worker(worker, siblings.clone()));
        }
        join_daemon_tasks(tasks, siblings).await
    }

    async fn poll_worker(
        self: Arc<Self>,
        worker: usize,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        debug!("Starting poll worker: worker={}", worker);
        loop {
            // Failures are logged and recorded by the cycle itself.
            if let Err(SidecarError::Cancelled) = self.fetch_all_credentials(&cancel).await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
        }
        debug!("Poll worker stopped: worker={}", worker);
        Ok(())
    }

    /// Watches the X.509 context and the JWT bundles, and refreshes each JWT SVID at half
    /// its remaining lifetime.
    pub(super) async fn run_watch_daemon(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        let siblings = cancel.child_token();
        let mut tasks = JoinSet::new();

        if self.settings.x509_enabled {
            tasks.spawn(Arc::clone(self).watch_x509_contexts(siblings.clone()));
        }
        if self.settings.jwt_bundle_path.is_some() {
            tasks.spawn(Arc::clone(self).watch_jwt_bundles(siblings.clone()));
        }
        for target in &self.settings.jwt_svids {
            tasks.spawn(Arc::clone(self).refresh_jwt_svid(target.clone(), siblings.clone()));
        }

        join_daemon_tasks(tasks, siblings).await
    }

    async fn watch_x509_contexts(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let client = Arc::clone(&self.client);
        let producer = {
            let cancel = cancel.clone();
            tokio::spawn(async move { client.watch_x509_contexts(tx, cancel).await })
        };

        info!("Watching X.509 contexts");
        consume_updates(rx, &cancel, |context| {
            if let Err(err) = self.apply_x509_context(&context) {
                error!("Error updating X.509 certificates: error={}", err);
            }
        })
        .await;

        producer.await??;
        Ok(())
    }

    async fn watch_jwt_bundles(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let client = Arc::clone(&self.client);
        let producer = {
            let cancel = cancel.clone();
            tokio::spawn(async move { client.watch_jwt_bundles(tx, cancel).await })
        };

        info!("Watching JWT bundles");
        consume_updates(rx, &cancel, |bundles| {
            if let Err(err) = self.apply_jwt_bundles(bundles) {
                error!("Error updating JWT bundle: error={}", err);
            }
        })
        .await;

        producer.await??;
        Ok(())
    }

    /// Keeps one JWT SVID fresh.
    ///
    /// After a success the next fetch happens at half the remaining lifetime plus a margin.
    /// After a failure it happens after the next retry interval; a success resets the
    /// retry sequence.
    async fn refresh_jwt_svid(
        self: Arc<Self>,
        target: JwtSvidTarget,
        cancel: CancellationToken,
    ) -> Result<(), SidecarError> {
        let mut retry = RetryScheduler::new();
        loop {
            let delay = match self.fetch_and_write_jwt_svid(&target, &cancel).await {
                Ok(svid) => {
                    retry = RetryScheduler::new();
                    let delay = refresh_delay(svid.expiry(), OffsetDateTime::now_utc());
                    debug!(
                        "Scheduled JWT SVID refresh: audience={}, delay={:?}",
                        target.audience, delay
                    );
                    delay
                }
                Err(SidecarError::Cancelled) => return Ok(()),
                Err(err) => {
                    let delay = retry.next_interval();
                    warn!(
                        "Unable to update JWT SVID: audience={}, retry_in={:?}, error={}",
                        target.audience, delay, err
                    );
                    delay
                }
            };

            if sleep_or_cancel(&cancel, delay).await {
                return Ok(());
            }
        }
    }
}

/// Applies updates from `rx` until the producer hangs up or `cancel` fires.
async fn consume_updates<T, F>(
    mut rx: mpsc::Receiver<T>,
    cancel: &CancellationToken,
    mut apply: F,
) where
    F: FnMut(T),
{
    loop {
        let update = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            update = rx.recv() => update,
        };
        match update {
            Some(update) => apply(update),
            None => return,
        }
    }
}

/// Waits for every daemon task.
///
/// The first task to fail with anything but cancellation cancels `siblings`, the token the
/// tasks were spawned with; its error is returned once all of them have finished.
async fn join_daemon_tasks(
    mut tasks: JoinSet<Result<(), SidecarError>>,
    siblings: CancellationToken,
) -> Result<(), SidecarError> {
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(SidecarError::from).and_then(|result| result) {
            Ok(()) | Err(SidecarError::Cancelled) => {}
            Err(err) => {
                error!("Daemon task failed: error={}", err);
                if first_error.is_none() {
                    siblings.cancel();
                    first_error = Some(err);
                }
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}
