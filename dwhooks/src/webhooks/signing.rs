//! HMAC-SHA256 request signing.
//!
//! The signature covers `{timestamp}.{body}` where `timestamp` is the unix-seconds value sent
//! in `X-Webhook-Timestamp` and `body` is the exact request body. The header value is
//! `sha256=` followed by the lowercase hex digest.
//!
//! Receivers must verify against the raw bytes they received; parsing and re-serializing the
//! JSON body changes the bytes and invalidates the signature.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Prefix of the `X-Webhook-Signature` header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Default replay window for [`verify`].
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

/// Generate a new webhook secret.
///
/// Returns a `whsec_` prefixed base64-encoded 32-byte random secret.
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);

    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

/// Extract the raw key bytes from a `whsec_` prefixed secret.
///
/// Returns `None` if the secret doesn't have the correct prefix or invalid base64.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX)?;
    BASE64_STANDARD.decode(encoded).ok()
}

fn mac_for(key: &[u8], timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Sign a request body.
///
/// Deterministic and side-effect free: the same key, timestamp and body always produce the
/// same `sha256=<hex>` value.
pub fn sign(key: &[u8], timestamp: i64, body: &[u8]) -> String {
    let digest = mac_for(key, timestamp, body).finalize().into_bytes();
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest))
}

/// Sign with a `whsec_` secret as stored on a subscription.
pub fn sign_with_secret(secret: &str, timestamp: i64, body: &[u8]) -> Option<String> {
    let key = decode_secret(secret)?;
    Some(sign(&key, timestamp, body))
}

/// Verify a received signature.
///
/// Returns `false` when `|now - timestamp|` exceeds `max_skew_secs`, when the header is not a
/// well-formed `sha256=<hex>` value, or when the digest does not match. The digest comparison
/// is constant-time.
pub fn verify(key: &[u8], timestamp: i64, body: &[u8], signature: &str, now: i64, max_skew_secs: i64) -> bool {
    if now.abs_diff(timestamp) > max_skew_secs.unsigned_abs() {
        return false;
    }

    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(received) = hex::decode(hex_digest) else {
        return false;
    };

    mac_for(key, timestamp, body).verify_slice(&received).is_ok()
}

/// [`verify`] with a `whsec_` secret and the raw header values, as a receiver sees them.
pub fn verify_headers(secret: &str, timestamp_header: &str, body: &[u8], signature_header: &str, now: i64) -> bool {
    let Some(key) = decode_secret(secret) else {
        return false;
    };
    let Ok(timestamp) = timestamp_header.trim().parse::<i64>() else {
        return false;
    };
    verify(&key, timestamp, body, signature_header, now, DEFAULT_MAX_SKEW_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"super-secret-key";
    const BODY: &[u8] = br#"{"type":"order.completed","order_id":42}"#;
    const TS: i64 = 1_704_067_200; // 2024-01-01 00:00:00 UTC

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret();
        assert!(secret.starts_with(SECRET_PREFIX));

        let decoded = decode_secret(&secret);
        assert_eq!(decoded.map(|k| k.len()), Some(32));

        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_decode_secret_invalid() {
        assert!(decode_secret("invalid_secret").is_none());
        assert!(decode_secret("whsec_not-valid-base64!!!").is_none());
    }

    #[test]
    fn test_sign_format_is_lowercase_hex() {
        let signature = sign(KEY, TS, BODY);
        let digest = signature.strip_prefix("sha256=").expect("prefix");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(signature, sign(KEY, TS, BODY));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256(key = "key", msg = "1.x"), computed independently.
        let signature = sign(b"key", 1, b"x");
        let mut mac = HmacSha256::new_from_slice(b"key").unwrap();
        mac.update(b"1.x");
        assert_eq!(signature, format!("sha256={}", hex::encode(mac.finalize().into_bytes())));
    }

    #[test]
    fn test_sign_then_verify() {
        let signature = sign(KEY, TS, BODY);
        assert!(verify(KEY, TS, BODY, &signature, TS, DEFAULT_MAX_SKEW_SECS));
        assert!(verify(KEY, TS, BODY, &signature, TS + 300, DEFAULT_MAX_SKEW_SECS));
        assert!(verify(KEY, TS, BODY, &signature, TS - 300, DEFAULT_MAX_SKEW_SECS));
    }

    #[test]
    fn test_verify_rejects_stale_and_future_timestamps() {
        let signature = sign(KEY, TS, BODY);
        assert!(!verify(KEY, TS, BODY, &signature, TS + 301, DEFAULT_MAX_SKEW_SECS));
        assert!(!verify(KEY, TS, BODY, &signature, TS - 301, DEFAULT_MAX_SKEW_SECS));
    }

    #[test]
    fn test_verify_rejects_any_body_bit_flip() {
        let signature = sign(KEY, TS, BODY);
        for byte in 0..BODY.len() {
            for bit in 0..8 {
                let mut tampered = BODY.to_vec();
                tampered[byte] ^= 1 << bit;
                assert!(!verify(KEY, TS, &tampered, &signature, TS, DEFAULT_MAX_SKEW_SECS));
            }
        }
    }

    #[test]
    fn test_verify_rejects_signature_tampering() {
        let signature = sign(KEY, TS, BODY);
        let digest = hex::decode(signature.strip_prefix("sha256=").unwrap()).unwrap();
        for byte in 0..digest.len() {
            let mut tampered = digest.clone();
            tampered[byte] ^= 0x01;
            let header = format!("sha256={}", hex::encode(&tampered));
            assert!(!verify(KEY, TS, BODY, &header, TS, DEFAULT_MAX_SKEW_SECS));
        }
    }

    #[test]
    fn test_verify_rejects_wrong_inputs() {
        let signature = sign(KEY, TS, BODY);
        assert!(!verify(b"other-key", TS, BODY, &signature, TS, DEFAULT_MAX_SKEW_SECS));
        assert!(!verify(KEY, TS + 1, BODY, &signature, TS + 1, DEFAULT_MAX_SKEW_SECS));
        assert!(!verify(KEY, TS, BODY, "invalid", TS, DEFAULT_MAX_SKEW_SECS));
        assert!(!verify(KEY, TS, BODY, "sha256=zz", TS, DEFAULT_MAX_SKEW_SECS));
        assert!(!verify(KEY, TS, BODY, "sha256=", TS, DEFAULT_MAX_SKEW_SECS));
        // Truncated digest
        assert!(!verify(KEY, TS, BODY, &signature[..signature.len() - 2], TS, DEFAULT_MAX_SKEW_SECS));
    }

    #[test]
    fn test_reserialized_body_fails() {
        let signature = sign(KEY, TS, BODY);
        let value: serde_json::Value = serde_json::from_slice(BODY).unwrap();
        let pretty = serde_json::to_vec_pretty(&value).unwrap();
        assert!(!verify(KEY, TS, &pretty, &signature, TS, DEFAULT_MAX_SKEW_SECS));
    }

    #[test]
    fn test_verify_headers_with_secret() {
        let secret = generate_secret();
        let signature = sign_with_secret(&secret, TS, BODY).expect("should sign");
        assert!(verify_headers(&secret, &TS.to_string(), BODY, &signature, TS + 10));
        assert!(!verify_headers(&secret, "not-a-number", BODY, &signature, TS));
        assert!(!verify_headers(&generate_secret(), &TS.to_string(), BODY, &signature, TS));
        assert!(sign_with_secret("no-prefix", TS, BODY).is_none());
    }
}
