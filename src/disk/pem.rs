//! PEM encoding of DER blocks.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub(crate) const CERTIFICATE: &str = "CERTIFICATE";
pub(crate) const PRIVATE_KEY: &str = "PRIVATE KEY";

const LINE_WIDTH: usize = 64;

/// Appends one PEM block with the given label to `out`.
pub(crate) fn push_block(out: &mut String, label: &str, der: &[u8]) {
    let encoded = STANDARD.encode(der);

    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\n");
    // base64 output is ASCII, so splitting on byte boundaries is safe.
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(label);
    out.push_str("-----\n");
}

/// Encodes every DER certificate as a `CERTIFICATE` block.
pub(crate) fn encode_certificates<'a, I>(certificates: I) -> String
where
    I: IntoIterator<Item = &'a Vec<u8>>,
{
    let mut out = String::new();
    for der in certificates {
        push_block(&mut out, CERTIFICATE, der);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_block_wraps_lines() {
        let mut out = String::new();
        push_block(&mut out, CERTIFICATE, &[0u8; 60]);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        // 60 bytes -> 80 base64 chars -> 64 + 16
        assert_eq!(lines[1].len(), 64);
        assert_eq!(lines[2].len(), 16);
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_encode_certificates_concatenates() {
        let certs = vec![b"one".to_vec(), b"two".to_vec()];
        let pem = encode_certificates(&certs);
        assert_eq!(pem.matches("-----BEGIN CERTIFICATE-----").count(), 2);
        assert!(pem.contains("b25l\n"));
        assert!(pem.contains("dHdv\n"));
        assert!(encode_certificates(&Vec::new()).is_empty());
    }
}
