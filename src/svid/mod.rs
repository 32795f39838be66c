//! X.509-SVID and JWT-SVID types.

pub mod jwt;
pub mod x509;

const SPIFFE_SCHEME_PREFIX: &str = "spiffe://";

/// Returns the trust domain name of a SPIFFE ID or of a trust domain ID.
///
/// Accepts `spiffe://example.org/workload`, `spiffe://example.org` and the bare
/// `example.org` form used as bundle keys by some Workload API implementations.
pub fn trust_domain_name(id: &str) -> Option<&str> {
    let rest = id.strip_prefix(SPIFFE_SCHEME_PREFIX).unwrap_or(id);
    let name = rest.split('/').next().unwrap_or_default();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
