//! Webhook signature validation.
//!
//! GitHub signs every delivery with an HMAC-SHA256 over the raw request
//! body, carried as `X-Hub-Signature-256: sha256=<hex>`. Verification
//! uses the `hmac` crate's constant-time comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Scheme prefix of the signature header value.
const SCHEME_PREFIX: &str = "sha256=";

/// Signature validation errors.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature header not found")]
    MissingHeader,

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("signature mismatch")]
    Mismatch,
}

/// Validate a raw `X-Hub-Signature-256` header value against `body`
/// using the shared webhook secret.
pub fn validate(secret: &str, signature: Option<&str>, body: &[u8]) -> Result<(), SignatureError> {
    let header = signature.ok_or(SignatureError::MissingHeader)?;

    let digest = header
        .strip_prefix(SCHEME_PREFIX)
        .ok_or(SignatureError::MalformedHeader)?;
    let digest = hex::decode(digest).map_err(|_| SignatureError::MalformedHeader)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "it's a secret to everybody";
    const BODY: &[u8] = br#"{"action":"queued"}"#;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let header = sign(SECRET, BODY);
        assert!(validate(SECRET, Some(&header), BODY).is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(
            validate(SECRET, None, BODY),
            Err(SignatureError::MissingHeader)
        ));
    }

    #[test]
    fn rejects_wrong_scheme() {
        let header = sign(SECRET, BODY).replace("sha256=", "sha1=");
        assert!(matches!(
            validate(SECRET, Some(&header), BODY),
            Err(SignatureError::MalformedHeader)
        ));
    }

    #[test]
    fn rejects_non_hex_digest() {
        assert!(matches!(
            validate(SECRET, Some("sha256=not-hex"), BODY),
            Err(SignatureError::MalformedHeader)
        ));
    }

    #[test]
    fn rejects_mutated_digest() {
        let header = sign(SECRET, BODY);
        // Flip every nibble of the digest in turn; all must be rejected.
        let digest = header.strip_prefix("sha256=").unwrap();
        for i in 0..digest.len() {
            let mut bytes = digest.as_bytes().to_vec();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let mutated = format!("sha256={}", String::from_utf8(bytes).unwrap());
            assert!(
                matches!(
                    validate(SECRET, Some(&mutated), BODY),
                    Err(SignatureError::Mismatch)
                ),
                "mutation at index {i} was accepted"
            );
        }
    }

    #[test]
    fn rejects_wrong_secret() {
        let header = sign("another secret", BODY);
        assert!(matches!(
            validate(SECRET, Some(&header), BODY),
            Err(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn rejects_signature_over_different_body() {
        let header = sign(SECRET, BODY);
        assert!(matches!(
            validate(SECRET, Some(&header), b"{}"),
            Err(SignatureError::Mismatch)
        ));
    }
}
