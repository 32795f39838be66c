//! JWT bundles: the public keys a trust domain signs JWT-SVIDs with.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// A single JWT authority (public key material) stored as a JWK JSON object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JwtAuthority {
    kid: Arc<str>,
    jwk_json: Arc<[u8]>,
}

impl JwtAuthority {
    /// Returns the key ID (`kid`).
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// Returns the JWK JSON bytes representing this authority.
    pub fn jwk_json(&self) -> &[u8] {
        &self.jwk_json
    }

    fn from_value(value: &Value) -> Result<Self, JwtBundleError> {
        let kid = value
            .get("kid")
            .and_then(Value::as_str)
            .ok_or(JwtBundleError::MissingKeyId)?;

        Ok(Self {
            kid: Arc::from(kid),
            jwk_json: Arc::from(serde_json::to_vec(value)?),
        })
    }
}

/// The JWT authorities of one trust domain, together with the JWKS document they came from.
///
/// The raw document is kept so the bundle can be written to disk exactly as the Workload API
/// served it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JwtBundle {
    trust_domain: String,
    jwks: Vec<u8>,
    authorities: HashMap<String, JwtAuthority>,
}

/// A set of [`JwtBundle`]s keyed by trust domain name.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct JwtBundleSet {
    bundles: BTreeMap<String, JwtBundle>,
}

/// An error that can arise parsing a [`JwtBundle`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwtBundleError {
    /// A JWT authority misses the key ID that identifies it.
    #[error("missing key ID")]
    MissingKeyId,

    /// The document is not a JWKS (no `keys` array).
    #[error("jwks must contain a 'keys' array")]
    MissingKeys,

    /// The bytes are not valid JSON.
    #[error("cannot deserialize json jwk set")]
    Deserialize(#[from] serde_json::Error),
}

impl JwtBundle {
    /// Parses a bundle for `trust_domain` from an RFC 7517 JWKS document.
    ///
    /// Key material is not interpreted here; it is only required to carry a `kid`.
    pub fn from_jwks(trust_domain: impl Into<String>, jwks: &[u8]) -> Result<Self, JwtBundleError> {
        let value: Value = serde_json::from_slice(jwks)?;
        let keys = value
            .get("keys")
            .and_then(Value::as_array)
            .ok_or(JwtBundleError::MissingKeys)?;

        let mut authorities = HashMap::with_capacity(keys.len());
        for key in keys {
            let authority = JwtAuthority::from_value(key)?;
            authorities.insert(authority.key_id().to_owned(), authority);
        }

        Ok(Self {
            trust_domain: trust_domain.into(),
            jwks: jwks.to_vec(),
            authorities,
        })
    }

    /// Returns the trust domain name of the bundle.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the JWKS document as received.
    pub fn jwks(&self) -> &[u8] {
        &self.jwks
    }

    /// Returns the [`JwtAuthority`] with the given key ID.
    pub fn find_jwt_authority(&self, key_id: &str) -> Option<&JwtAuthority> {
        self.authorities.get(key_id)
    }
}

impl JwtBundleSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bundle, replacing any previous bundle of the same trust domain.
    pub fn add_bundle(&mut self, bundle: JwtBundle) {
        self.bundles.insert(bundle.trust_domain.clone(), bundle);
    }

    /// Returns the bundle of `trust_domain`, if present.
    pub fn get(&self, trust_domain: &str) -> Option<&JwtBundle> {
        self.bundles.get(trust_domain)
    }

    /// Iterates over the bundles ordered by trust domain name.
    pub fn iter(&self) -> impl Iterator<Item = &JwtBundle> {
        self.bundles.values()
    }

    /// Returns the number of bundles in the set.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Returns `true` if the set holds no bundle.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JWKS: &str = r#"{
        "keys": [
            {
                "kty": "EC",
                "kid": "C6vs25welZOx6WksNYfbMfiw9l96pMnD",
                "crv": "P-256",
                "x": "ngLYQnlfF6GsojUwqtcEE3WgTNG2RUlsGhK73RNEl5k",
                "y": "tKbiDSUSsQ3F1P7wteeHNXIcU-cx6CgSbroeQrQHTLM"
            }
        ],
        "spiffe_refresh_hint": 300
    }"#;

    #[test]
    fn test_parse_jwks() {
        let bundle = JwtBundle::from_jwks("example.org", JWKS.as_bytes()).unwrap();
        assert_eq!(bundle.trust_domain(), "example.org");
        assert_eq!(bundle.jwks(), JWKS.as_bytes());

        let authority = bundle
            .find_jwt_authority("C6vs25welZOx6WksNYfbMfiw9l96pMnD")
            .unwrap();
        let jwk: Value = serde_json::from_slice(authority.jwk_json()).unwrap();
        assert_eq!(jwk["crv"], "P-256");
        assert!(bundle.find_jwt_authority("other").is_none());
    }

    #[test]
    fn test_parse_rejects_invalid_documents() {
        assert!(matches!(
            JwtBundle::from_jwks("example.org", b"not json"),
            Err(JwtBundleError::Deserialize(_))
        ));
        assert!(matches!(
            JwtBundle::from_jwks("example.org", br#"{"kty":"EC"}"#),
            Err(JwtBundleError::MissingKeys)
        ));
        assert!(matches!(
            JwtBundle::from_jwks("example.org", br#"{"keys":[{"kty":"EC"}]}"#),
            Err(JwtBundleError::MissingKeyId)
        ));
    }

    #[test]
    fn test_bundle_set_replaces_by_trust_domain() {
        let mut set = JwtBundleSet::new();
        assert!(set.is_empty());

        set.add_bundle(JwtBundle::from_jwks("example.org", br#"{"keys":[]}"#).unwrap());
        set.add_bundle(JwtBundle::from_jwks("example.org", JWKS.as_bytes()).unwrap());
        set.add_bundle(JwtBundle::from_jwks("other.org", br#"{"keys":[]}"#).unwrap());

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("example.org").unwrap().jwks(), JWKS.as_bytes());
        let domains: Vec<&str> = set.iter().map(JwtBundle::trust_domain).collect();
        assert_eq!(domains, vec!["example.org", "other.org"]);
    }
}
