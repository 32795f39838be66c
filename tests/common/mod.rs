//! In-memory Workload API and credential writer used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey as _;
use spiffe_helper::{
    CredentialWriter, DiskError, JwtBundle, JwtBundleSet, JwtSvid, WorkloadApi,
    WorkloadApiError, X509Context, X509Svid,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const TRUST_DOMAIN: &str = "example.org";
pub const KEY_ID: &str = "authority-1";

pub fn x509_svid(spiffe_id: &str, hint: &str) -> X509Svid {
    X509Svid::new(spiffe_id, vec![b"leaf".to_vec()], b"key".to_vec())
        .unwrap()
        .with_hint(hint)
}

pub fn x509_context(svids: Vec<X509Svid>) -> X509Context {
    let mut bundles = BTreeMap::new();
    bundles.insert(TRUST_DOMAIN.to_owned(), vec![b"root".to_vec()]);
    X509Context::new(svids, bundles)
}

fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[0x42; 32]).unwrap()
}

/// The bundle set holding the key that signs [`jwt_token`].
pub fn jwt_bundles() -> JwtBundleSet {
    let point = signing_key().verifying_key().to_encoded_point(false);
    let jwks = serde_json::json!({
        "keys": [{
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
            "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
            "use": "jwt-svid",
            "kid": KEY_ID,
        }]
    });

    let mut set = JwtBundleSet::new();
    set.add_bundle(JwtBundle::from_jwks(TRUST_DOMAIN, &serde_json::to_vec(&jwks).unwrap()).unwrap());
    set
}

/// Signs a JWT-SVID for `audience` that expires `ttl_secs` from now.
pub fn jwt_token(audience: &str, ttl_secs: i64) -> String {
    let claims = serde_json::json!({
        "sub": format!("spiffe://{TRUST_DOMAIN}/workload"),
        "aud": [audience],
        "exp": OffsetDateTime::now_utc().unix_timestamp() + ttl_secs,
    });
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(KEY_ID.to_owned());

    let der = signing_key().to_pkcs8_der().unwrap();
    encode(&header, &claims, &EncodingKey::from_ec_der(der.as_bytes())).unwrap()
}

pub fn jwt_svid(audience: &str, ttl_secs: i64) -> JwtSvid {
    JwtSvid::parse_insecure(&jwt_token(audience, ttl_secs)).unwrap()
}

pub fn unavailable() -> WorkloadApiError {
    WorkloadApiError::Grpc(tonic::Status::unavailable("agent down"))
}

/// A scripted Workload API.
///
/// Each fetch pops the next scripted result; once the script is exhausted the fallback is
/// used (an error when no fallback is set).
#[derive(Default)]
pub struct FakeWorkloadApi {
    x509_script: Mutex<VecDeque<Result<X509Context, WorkloadApiError>>>,
    x509_fallback: Mutex<Option<X509Context>>,
    x509_updates: Mutex<Vec<X509Context>>,
    x509_watch_error: Mutex<Option<WorkloadApiError>>,
    jwt_svid_script: Mutex<VecDeque<Result<Vec<JwtSvid>, WorkloadApiError>>>,
    jwt_bundle_script: Mutex<VecDeque<JwtBundleSet>>,
    jwt_bundle_fallback: Mutex<Option<JwtBundleSet>>,

    pub x509_fetches: AtomicUsize,
    pub jwt_svid_fetches: AtomicUsize,
    pub jwt_bundle_fetches: AtomicUsize,
    pub jwt_svid_fetch_times: Mutex<Vec<Instant>>,
}

impl FakeWorkloadApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_x509(&self, result: Result<X509Context, WorkloadApiError>) -> &Self {
        self.x509_script.lock().unwrap().push_back(result);
        self
    }

    pub fn set_x509_fallback(&self, context: X509Context) -> &Self {
        *self.x509_fallback.lock().unwrap() = Some(context);
        self
    }

    /// Contexts delivered, in order, by the X.509 watch.
    pub fn set_x509_updates(&self, updates: Vec<X509Context>) -> &Self {
        *self.x509_updates.lock().unwrap() = updates;
        self
    }

    /// Makes the X.509 watch fail with `err` once its updates are delivered.
    pub fn fail_x509_watch(&self, err: WorkloadApiError) -> &Self {
        *self.x509_watch_error.lock().unwrap() = Some(err);
        self
    }

    pub fn push_jwt_svids(&self, result: Result<Vec<JwtSvid>, WorkloadApiError>) -> &Self {
        self.jwt_svid_script.lock().unwrap().push_back(result);
        self
    }

    pub fn push_jwt_bundles(&self, bundles: JwtBundleSet) -> &Self {
        self.jwt_bundle_script.lock().unwrap().push_back(bundles);
        self
    }

    pub fn set_jwt_bundle_fallback(&self, bundles: JwtBundleSet) -> &Self {
        *self.jwt_bundle_fallback.lock().unwrap() = Some(bundles);
        self
    }

    fn next_jwt_bundles(&self) -> Result<JwtBundleSet, WorkloadApiError> {
        self.jwt_bundle_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(bundles) = self.jwt_bundle_script.lock().unwrap().pop_front() {
            return Ok(bundles);
        }
        self.jwt_bundle_fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or(WorkloadApiError::EmptyResponse)
    }
}

#[async_trait]
impl WorkloadApi for FakeWorkloadApi {
    async fn fetch_x509_context(&self) -> Result<X509Context, WorkloadApiError> {
        self.x509_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.x509_script.lock().unwrap().pop_front() {
            return result;
        }
        self.x509_fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or(WorkloadApiError::EmptyResponse)
    }

    async fn watch_x509_contexts(
        &self,
        updates: mpsc::Sender<X509Context>,
        cancel: CancellationToken,
    ) -> Result<(), WorkloadApiError> {
        let contexts = std::mem::take(&mut *self.x509_updates.lock().unwrap());
        for context in contexts {
            if updates.send(context).await.is_err() {
                return Ok(());
            }
        }
        if let Some(err) = self.x509_watch_error.lock().unwrap().take() {
            return Err(err);
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn fetch_jwt_bundles(&self) -> Result<JwtBundleSet, WorkloadApiError> {
        self.next_jwt_bundles()
    }

    async fn watch_jwt_bundles(
        &self,
        updates: mpsc::Sender<JwtBundleSet>,
        cancel: CancellationToken,
    ) -> Result<(), WorkloadApiError> {
        if let Ok(bundles) = self.next_jwt_bundles() {
            if updates.send(bundles).await.is_err() {
                return Ok(());
            }
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn fetch_jwt_svids(
        &self,
        _audience: &str,
        _extra_audiences: &[String],
    ) -> Result<Vec<JwtSvid>, WorkloadApiError> {
        self.jwt_svid_fetches.fetch_add(1, Ordering::SeqCst);
        self.jwt_svid_fetch_times.lock().unwrap().push(Instant::now());
        self.jwt_svid_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unavailable()))
    }
}

/// Records what would have been written; individual writes can be made to fail.
#[derive(Default)]
pub struct FakeWriter {
    pub fail_x509: AtomicBool,
    pub fail_jwt_svid: AtomicBool,
    pub x509_writes: Mutex<Vec<String>>,
    pub jwt_bundle_writes: AtomicUsize,
    pub jwt_svid_writes: Mutex<Vec<(String, String)>>,
}

impl FakeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn x509_write_count(&self) -> usize {
        self.x509_writes.lock().unwrap().len()
    }
}

impl CredentialWriter for FakeWriter {
    fn write_x509_context(&self, svid: &X509Svid, _context: &X509Context) -> Result<(), DiskError> {
        if self.fail_x509.load(Ordering::SeqCst) {
            return Err(DiskError::NotConfigured("svid_file_name"));
        }
        self.x509_writes
            .lock()
            .unwrap()
            .push(svid.spiffe_id().to_owned());
        Ok(())
    }

    fn write_jwt_bundle(&self, _bundles: &JwtBundleSet) -> Result<(), DiskError> {
        self.jwt_bundle_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_jwt_svid(&self, svid: &JwtSvid, file_name: &str) -> Result<(), DiskError> {
        if self.fail_jwt_svid.load(Ordering::SeqCst) {
            return Err(DiskError::NotConfigured("jwt_svid_file_name"));
        }
        self.jwt_svid_writes
            .lock()
            .unwrap()
            .push((file_name.to_owned(), svid.token().to_owned()));
        Ok(())
    }
}
