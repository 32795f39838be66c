//! X.509-SVIDs and the X.509 context delivered by the Workload API.

use crate::svid::trust_domain_name;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// An X.509-SVID: a certificate chain (leaf first) and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct X509Svid {
    spiffe_id: String,
    cert_chain: Vec<Vec<u8>>,
    private_key: Vec<u8>,
    hint: Option<String>,
}

/// Errors that can arise building an [`X509Svid`] or [`X509Context`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum X509SvidError {
    /// The certificate chain contains no certificate.
    #[error("no certificates found in chain")]
    EmptyChain,

    /// The private key is empty.
    #[error("private key is empty")]
    EmptyPrivateKey,

    /// The SPIFFE ID carries no trust domain.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// A certificate in a DER block could not be parsed.
    #[error("failed to parse certificate: {0}")]
    Certificate(String),
}

impl X509Svid {
    /// Creates an `X509Svid` from an already split certificate chain.
    pub fn new(
        spiffe_id: impl Into<String>,
        cert_chain: Vec<Vec<u8>>,
        private_key: Vec<u8>,
    ) -> Result<Self, X509SvidError> {
        let spiffe_id = spiffe_id.into();
        if trust_domain_name(&spiffe_id).is_none() {
            return Err(X509SvidError::InvalidSpiffeId(spiffe_id));
        }
        if cert_chain.is_empty() {
            return Err(X509SvidError::EmptyChain);
        }
        if private_key.is_empty() {
            return Err(X509SvidError::EmptyPrivateKey);
        }

        Ok(X509Svid {
            spiffe_id,
            cert_chain,
            private_key,
            hint: None,
        })
    }

    /// Parses an `X509Svid` from the ASN.1 DER blocks the Workload API returns: concatenated
    /// certificates (leaf first) and a PKCS#8 private key.
    pub fn parse_from_der(
        spiffe_id: impl Into<String>,
        cert_chain_der: &[u8],
        private_key_der: &[u8],
    ) -> Result<Self, X509SvidError> {
        let cert_chain = split_certificates(cert_chain_der)?;
        X509Svid::new(spiffe_id, cert_chain, private_key_der.to_vec())
    }

    /// Returns a copy of this SVID with the given Workload API hint attached.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        self.hint = if hint.is_empty() { None } else { Some(hint) };
        self
    }

    /// Returns the SPIFFE ID of the SVID.
    pub fn spiffe_id(&self) -> &str {
        &self.spiffe_id
    }

    /// Returns the trust domain name of the SVID.
    pub fn trust_domain(&self) -> &str {
        // checked in `new`
        trust_domain_name(&self.spiffe_id).unwrap_or_default()
    }

    /// Returns the DER certificates of the chain, leaf first.
    pub fn cert_chain(&self) -> &[Vec<u8>] {
        &self.cert_chain
    }

    /// Returns the DER leaf certificate.
    pub fn leaf(&self) -> &[u8] {
        &self.cert_chain[0]
    }

    /// Returns the DER intermediate certificates, if any.
    pub fn intermediates(&self) -> &[Vec<u8>] {
        &self.cert_chain[1..]
    }

    /// Returns the DER PKCS#8 private key.
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Returns the Workload API hint (if any).
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Svid")
            .field("spiffe_id", &self.spiffe_id)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("hint", &self.hint)
            .finish()
    }
}

/// All X.509 material fetched from the Workload API: the SVIDs issued to the workload and the
/// X.509 bundles (local and federated), keyed by trust domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Context {
    svids: Vec<X509Svid>,
    bundles: BTreeMap<String, Vec<Vec<u8>>>,
}

impl X509Context {
    /// Creates a new [`X509Context`].
    pub fn new(svids: Vec<X509Svid>, bundles: BTreeMap<String, Vec<Vec<u8>>>) -> Self {
        X509Context { svids, bundles }
    }

    /// Returns the default SVID (the first one returned by the Workload API).
    pub fn default_svid(&self) -> Option<&X509Svid> {
        self.svids.first()
    }

    /// Returns the SVID carrying `hint`, or the default SVID when `hint` is `None`.
    pub fn svid_for_hint(&self, hint: Option<&str>) -> Option<&X509Svid> {
        match hint {
            Some(hint) => self.svids.iter().find(|svid| svid.hint() == Some(hint)),
            None => self.default_svid(),
        }
    }

    /// Returns all SVIDs in this context.
    pub fn svids(&self) -> &[X509Svid] {
        &self.svids
    }

    /// Returns the DER authorities of the bundle for `trust_domain`.
    pub fn bundle_for(&self, trust_domain: &str) -> Option<&[Vec<u8>]> {
        self.bundles.get(trust_domain).map(Vec::as_slice)
    }

    /// Iterates over all bundles as `(trust domain, DER authorities)`.
    pub fn bundles(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.bundles
            .iter()
            .map(|(td, authorities)| (td.as_str(), authorities.as_slice()))
    }
}

/// Splits a block of concatenated DER certificates into one DER buffer per certificate.
pub fn split_certificates(der: &[u8]) -> Result<Vec<Vec<u8>>, X509SvidError> {
    let mut certificates = Vec::new();
    let mut rest = der;

    while !rest.is_empty() {
        let (remaining, _) = x509_parser::parse_x509_certificate(rest)
            .map_err(|e| X509SvidError::Certificate(e.to_string()))?;
        let consumed = rest.len() - remaining.len();
        certificates.push(rest[..consumed].to_vec());
        rest = remaining;
    }

    if certificates.is_empty() {
        return Err(X509SvidError::EmptyChain);
    }
    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svid(id: &str, hint: &str) -> X509Svid {
        X509Svid::new(id, vec![b"leaf".to_vec(), b"intermediate".to_vec()], b"key".to_vec())
            .unwrap()
            .with_hint(hint)
    }

    #[test]
    fn test_new_rejects_empty_material() {
        assert_eq!(
            X509Svid::new("spiffe://example.org/a", vec![], b"key".to_vec()),
            Err(X509SvidError::EmptyChain)
        );
        assert_eq!(
            X509Svid::new("spiffe://example.org/a", vec![b"leaf".to_vec()], vec![]),
            Err(X509SvidError::EmptyPrivateKey)
        );
        assert!(matches!(
            X509Svid::new("spiffe://", vec![b"leaf".to_vec()], b"key".to_vec()),
            Err(X509SvidError::InvalidSpiffeId(_))
        ));
    }

    #[test]
    fn test_leaf_and_intermediates() {
        let svid = svid("spiffe://example.org/a", "");
        assert_eq!(svid.leaf(), b"leaf");
        assert_eq!(svid.intermediates(), &[b"intermediate".to_vec()]);
        assert_eq!(svid.trust_domain(), "example.org");
        assert_eq!(svid.hint(), None);
    }

    #[test]
    fn test_svid_for_hint() {
        let ctx = X509Context::new(
            vec![
                svid("spiffe://example.org/a", "internal"),
                svid("spiffe://example.org/b", "external"),
            ],
            BTreeMap::new(),
        );

        assert_eq!(
            ctx.svid_for_hint(None).map(X509Svid::spiffe_id),
            Some("spiffe://example.org/a")
        );
        assert_eq!(
            ctx.svid_for_hint(Some("external")).map(X509Svid::spiffe_id),
            Some("spiffe://example.org/b")
        );
        assert!(ctx.svid_for_hint(Some("missing")).is_none());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let debug = format!("{:?}", svid("spiffe://example.org/a", ""));
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("107, 101, 121"));
    }

    #[test]
    fn test_split_certificates_rejects_garbage() {
        assert!(matches!(
            split_certificates(b"not a certificate"),
            Err(X509SvidError::Certificate(_))
        ));
        assert_eq!(split_certificates(&[]), Err(X509SvidError::EmptyChain));
    }
}
