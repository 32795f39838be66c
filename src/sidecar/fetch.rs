//! A single fetch cycle: X.509 context, then the JWT bundle, then each JWT SVID.

use super::{JwtSvidTarget, Sidecar};
use crate::bundle::JwtBundleSet;
use crate::error::SidecarError;
use crate::svid::jwt::JwtSvid;
use crate::svid::x509::X509Context;
use log::{debug, error, info};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs `fut` unless `cancel` fires first.
pub(super) async fn cancellable<T, E, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, SidecarError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SidecarError>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SidecarError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

impl Sidecar {
    /// Fetches and writes every enabled credential, stopping at the first failure.
    ///
    /// The tracker records `Failed` for the resource that failed, unless the failure was
    /// cancellation.
    pub async fn fetch_all_credentials(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), SidecarError> {
        if self.settings.x509_enabled {
            self.fetch_and_write_x509_context(cancel)
                .await
                .inspect_err(|err| log_cycle_error("X.509 certificates", err))?;
        }

        if self.settings.jwt_bundle_path.is_some() {
            self.fetch_and_write_jwt_bundle(cancel)
                .await
                .inspect_err(|err| log_cycle_error("JWT bundle", err))?;
        }

        for target in &self.settings.jwt_svids {
            self.fetch_and_write_jwt_svid(target, cancel)
                .await
                .inspect_err(|err| log_cycle_error("JWT SVID", err))?;
        }

        Ok(())
    }

    /// Fetches the X.509 context once and applies it.
    pub(super) async fn fetch_and_write_x509_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), SidecarError> {
        match cancellable(cancel, self.client.fetch_x509_context()).await {
            Ok(context) => self.apply_x509_context(&context),
            Err(SidecarError::Cancelled) => Err(SidecarError::Cancelled),
            Err(err) => {
                self.health.record_x509(false);
                Err(err)
            }
        }
    }

    /// Writes the SVID selected by the hint, then notifies the process side channel.
    pub(super) fn apply_x509_context(&self, context: &X509Context) -> Result<(), SidecarError> {
        let result = self.write_x509_context(context);
        self.health.record_x509(result.is_ok());
        result?;

        info!("X.509 certificates updated");
        self.process.on_credentials_updated();
        Ok(())
    }

    fn write_x509_context(&self, context: &X509Context) -> Result<(), SidecarError> {
        let hint = self.settings.hint.as_deref();
        let svid = context
            .svid_for_hint(hint)
            .ok_or_else(|| SidecarError::HintNotFound(hint.unwrap_or_default().to_string()))?;
        debug!(
            "Writing X.509 SVID: spiffe_id={}, hint={}",
            svid.spiffe_id(),
            svid.hint().unwrap_or("")
        );
        self.writer.write_x509_context(svid, context)?;
        Ok(())
    }

    /// Fetches the JWT bundles once and applies them.
    pub(super) async fn fetch_and_write_jwt_bundle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), SidecarError> {
        match cancellable(cancel, self.client.fetch_jwt_bundles()).await {
            Ok(bundles) => self.apply_jwt_bundles(bundles),
            Err(SidecarError::Cancelled) => Err(SidecarError::Cancelled),
            Err(err) => {
                self.record_jwt_bundle(false);
                Err(err)
            }
        }
    }

    /// Caches the bundles for JWT SVID validation, then writes them.
    pub(super) fn apply_jwt_bundles(&self, bundles: JwtBundleSet) -> Result<(), SidecarError> {
        let bundles = Arc::new(bundles);
        self.store_jwt_bundles(Arc::clone(&bundles));

        let result = self.writer.write_jwt_bundle(&bundles);
        self.record_jwt_bundle(result.is_ok());
        result?;

        info!("JWT bundle updated: trust_domains={}", bundles.len());
        Ok(())
    }

    fn record_jwt_bundle(&self, written: bool) {
        if let Some(path) = &self.settings.jwt_bundle_path {
            self.health.record_jwt(path, written);
        }
    }

    /// Fetches, validates and writes the JWT SVID for `target`.
    ///
    /// Returns the written SVID so callers can schedule its refresh.
    pub(super) async fn fetch_and_write_jwt_svid(
        &self,
        target: &JwtSvidTarget,
        cancel: &CancellationToken,
    ) -> Result<JwtSvid, SidecarError> {
        let result = self.try_fetch_and_write_jwt_svid(target, cancel).await;
        match &result {
            Err(SidecarError::Cancelled) => {}
            Ok(svid) => {
                self.health.record_jwt(&target.path, true);
                info!(
                    "JWT SVID updated: spiffe_id={}, audience={}",
                    svid.spiffe_id(),
                    target.audience
                );
            }
            Err(_) => self.health.record_jwt(&target.path, false),
        }
        result
    }

    async fn try_fetch_and_write_jwt_svid(
        &self,
        target: &JwtSvidTarget,
        cancel: &CancellationToken,
    ) -> Result<JwtSvid, SidecarError> {
        let svids = cancellable(
            cancel,
            self.client
                .fetch_jwt_svids(&target.audience, &target.extra_audiences),
        )
        .await?;
        let svid = svids
            .into_iter()
            .next()
            .ok_or_else(|| SidecarError::NoJwtSvids {
                audience: target.audience.clone(),
            })?;

        self.validate_jwt_svid(&svid, target, cancel).await?;
        self.writer.write_jwt_svid(&svid, &target.file_name)?;
        Ok(svid)
    }

    /// Validates `svid` against the cached bundles, refreshing them once when the issuing
    /// trust domain or key is unknown.
    async fn validate_jwt_svid(
        &self,
        svid: &JwtSvid,
        target: &JwtSvidTarget,
        cancel: &CancellationToken,
    ) -> Result<(), SidecarError> {
        let audience = std::slice::from_ref(&target.audience);
        let bundles = self.jwt_bundles_for_validation(cancel, false).await?;
        match JwtSvid::parse_and_validate(svid.token(), &bundles, audience) {
            Ok(_) => Ok(()),
            Err(err) if err.is_missing_trust_material() => {
                debug!(
                    "Refreshing JWT bundles for validation: trust_domain={}, error={}",
                    svid.trust_domain(),
                    err
                );
                let bundles = self.jwt_bundles_for_validation(cancel, true).await?;
                JwtSvid::parse_and_validate(svid.token(), &bundles, audience)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn jwt_bundles_for_validation(
        &self,
        cancel: &CancellationToken,
        refresh: bool,
    ) -> Result<Arc<JwtBundleSet>, SidecarError> {
        if !refresh {
            if let Some(bundles) = self.cached_jwt_bundles() {
                return Ok(bundles);
            }
        }

        let bundles = Arc::new(cancellable(cancel, self.client.fetch_jwt_bundles()).await?);
        self.store_jwt_bundles(Arc::clone(&bundles));
        Ok(bundles)
    }
}

fn log_cycle_error(resource: &str, err: &SidecarError) {
    if !err.is_cancelled() {
        error!("Error fetching {}: error={}", resource, err);
    }
}
