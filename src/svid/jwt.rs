//! JWT-SVIDs.

use crate::bundle::{JwtAuthority, JwtBundleSet};
use crate::svid::trust_domain_name;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

const SUPPORTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// A [SPIFFE JWT-SVID](https://github.com/spiffe/spiffe/blob/main/standards/JWT-SVID.md).
#[derive(Clone, PartialEq)]
pub struct JwtSvid {
    spiffe_id: String,
    hint: Option<String>,
    expiry: OffsetDateTime,
    claims: Claims,
    kid: String,
    alg: Algorithm,
    token: String,
}

/// An error that can arise parsing or validating a [`JwtSvid`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwtSvidError {
    /// The token is not made of three dot-separated parts.
    #[error("malformed jwt token: expected three parts")]
    InvalidJwtFormat,

    /// A token part is not valid base64url.
    #[error("malformed jwt token: invalid base64url")]
    InvalidBase64,

    /// The header or claims are not valid JSON or miss required fields.
    #[error("malformed jwt token: invalid json")]
    InvalidJson(#[source] serde_json::Error),

    /// The header `typ` is present and is neither `JWT` nor `JOSE`.
    #[error("token header 'typ' should be 'JWT' or 'JOSE'")]
    InvalidTyp,

    /// The header `alg` names an algorithm JWT-SVIDs may not use.
    #[error("algorithm in 'alg' header is not supported")]
    UnsupportedAlgorithm,

    /// The header `kid` is not present.
    #[error("token header 'kid' not found")]
    MissingKeyId,

    /// The `sub` claim is not a SPIFFE ID.
    #[error("invalid spiffe_id in token 'sub' claim: {0}")]
    InvalidSubject(String),

    /// The `exp` claim is out of range.
    #[error("invalid 'exp' claim")]
    InvalidExpiration,

    /// No JWT bundle is known for the trust domain of the token.
    #[error("cannot find JWT bundle for trust domain: {0}")]
    BundleNotFound(String),

    /// The bundle has no authority with the token's key ID.
    #[error("cannot find JWT authority for key_id: {0}")]
    AuthorityNotFound(String),

    /// The authority JWK could not be turned into a verification key.
    #[error("cannot parse authority JWK JSON: {0}")]
    InvalidAuthorityJwk(#[source] serde_json::Error),

    /// Signature, expiry or audience validation failed.
    #[error("cannot decode token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl JwtSvidError {
    /// Returns `true` when validation failed because the trust material was not known, so a
    /// fresher JWT bundle set may let the same token validate.
    pub fn is_missing_trust_material(&self) -> bool {
        matches!(
            self,
            JwtSvidError::BundleNotFound(_) | JwtSvidError::AuthorityNotFound(_)
        )
    }
}

/// Required JWT-SVID claims.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    sub: String,
    #[serde(deserialize_with = "string_or_seq_string")]
    aud: Vec<String>,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    typ: Option<String>,
}

impl JwtSvid {
    /// Parses a JWT-SVID without performing signature verification.
    ///
    /// Appropriate only for tokens that are trusted by construction, such as the ones returned
    /// by the Workload API.
    pub fn parse_insecure(token: &str) -> Result<Self, JwtSvidError> {
        Self::from_str(token)
    }

    /// Parses `token` and validates it offline: the signature against the authority in
    /// `bundles` matching the token's trust domain and `kid`, the expiry with no leeway, and
    /// the audience against `expected_audience`.
    pub fn parse_and_validate<T: AsRef<str>>(
        token: &str,
        bundles: &JwtBundleSet,
        expected_audience: &[T],
    ) -> Result<Self, JwtSvidError> {
        let untrusted = Self::parse_insecure(token)?;
        let authority = Self::find_jwt_authority(bundles, untrusted.trust_domain(), &untrusted.kid)?;

        let mut validation = Validation::new(untrusted.alg);
        validation.validate_exp = true;
        validation.leeway = 0;
        let aud: Vec<&str> = expected_audience.iter().map(AsRef::as_ref).collect();
        validation.set_audience(&aud);

        let jwk: Jwk =
            serde_json::from_slice(authority.jwk_json()).map_err(JwtSvidError::InvalidAuthorityJwk)?;
        let key = DecodingKey::from_jwk(&jwk)?;
        jsonwebtoken::decode::<Claims>(token, &key, &validation)?;

        Ok(untrusted)
    }

    /// Returns a copy of this JWT-SVID with the given Workload API hint attached.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        self.hint = if hint.is_empty() { None } else { Some(hint) };
        self
    }

    /// Returns the serialized token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the SPIFFE ID (from the `sub` claim).
    pub fn spiffe_id(&self) -> &str {
        &self.spiffe_id
    }

    /// Returns the trust domain name of the SPIFFE ID.
    pub fn trust_domain(&self) -> &str {
        trust_domain_name(&self.spiffe_id).unwrap_or_default()
    }

    /// Returns the audience (from the `aud` claim).
    pub fn audience(&self) -> &[String] {
        &self.claims.aud
    }

    /// Returns the token expiration timestamp (from the `exp` claim).
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    /// Returns the `kid` header.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    /// Returns the Workload API hint (if any).
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    fn find_jwt_authority<'a>(
        bundles: &'a JwtBundleSet,
        trust_domain: &str,
        key_id: &str,
    ) -> Result<&'a JwtAuthority, JwtSvidError> {
        bundles
            .get(trust_domain)
            .ok_or_else(|| JwtSvidError::BundleNotFound(trust_domain.to_owned()))?
            .find_jwt_authority(key_id)
            .ok_or_else(|| JwtSvidError::AuthorityNotFound(key_id.to_owned()))
    }
}

impl fmt::Debug for JwtSvid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSvid")
            .field("spiffe_id", &self.spiffe_id)
            .field("audience", &self.claims.aud)
            .field("expiry", &self.expiry)
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .field("hint", &self.hint)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl FromStr for JwtSvid {
    type Err = JwtSvidError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(JwtSvidError::InvalidJwtFormat)?;
        let claims_b64 = parts.next().ok_or(JwtSvidError::InvalidJwtFormat)?;
        parts.next().ok_or(JwtSvidError::InvalidJwtFormat)?;
        if parts.next().is_some() {
            return Err(JwtSvidError::InvalidJwtFormat);
        }

        let header_json = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| JwtSvidError::InvalidBase64)?;
        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| JwtSvidError::InvalidBase64)?;

        let header: Header =
            serde_json::from_slice(&header_json).map_err(JwtSvidError::InvalidJson)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(JwtSvidError::InvalidJson)?;

        if let Some(typ) = header.typ.as_deref() {
            if typ != "JWT" && typ != "JOSE" {
                return Err(JwtSvidError::InvalidTyp);
            }
        }

        let alg = Algorithm::from_str(&header.alg)
            .ok()
            .filter(|alg| SUPPORTED_ALGORITHMS.contains(alg))
            .ok_or(JwtSvidError::UnsupportedAlgorithm)?;
        let kid = header.kid.ok_or(JwtSvidError::MissingKeyId)?;

        if !claims.sub.starts_with("spiffe://") || trust_domain_name(&claims.sub).is_none() {
            return Err(JwtSvidError::InvalidSubject(claims.sub));
        }

        let expiry = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| JwtSvidError::InvalidExpiration)?;

        Ok(JwtSvid {
            spiffe_id: claims.sub.clone(),
            hint: None,
            expiry,
            claims,
            kid,
            alg,
            token: token.to_owned(),
        })
    }
}

// Deserialize 'aud' claim being either a String or a sequence of strings.
fn string_or_seq_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> de::Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("string or sequence of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_owned()])
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut result = Vec::new();
            while let Some(elem) = seq.next_element::<String>()? {
                result.push(elem);
            }
            Ok(result)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}
