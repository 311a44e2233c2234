//! Signed envelope helper (§6.3): HMAC-SHA256 over canonical JSON, hex-encoded, verified
//! in constant time via `hmac::Mac::verify_slice`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub fn sign(canonical_bytes: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical_bytes);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex-encoded signature against `canonical_bytes`. Uses `Mac::verify_slice`,
/// which compares in constant time.
pub fn verify(canonical_bytes: &[u8], signature_hex: &str, secret: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical_bytes);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Issues a minimal bearer token: base64url(payload).hex(hmac), consumed by
/// `session::verify_token`.
pub fn issue_token(pubkey: &str, scope: &str, secret: &str) -> String {
    use base64::Engine;
    let payload = serde_json::json!({
        "pubkey": pubkey,
        "scope": scope,
        "exp": (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp(),
    });
    let payload_bytes = serde_json::to_vec(&payload).expect("token payload always serializes");
    let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&payload_bytes);
    let sig = sign(payload_b64.as_bytes(), secret);
    format!("{}.{}", payload_b64, sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let body = b"{\"relay_key\":\"a:b\"}";
        let sig = sign(body, "secret");
        assert!(verify(body, &sig, "secret"));
    }

    #[test]
    fn test_verify_fails_on_bit_flip() {
        let body = b"{\"relay_key\":\"a:b\"}";
        let sig = sign(body, "secret");
        let mut tampered = body.to_vec();
        tampered[2] ^= 0x01;
        assert!(!verify(&tampered, &sig, "secret"));
    }

    #[test]
    fn test_verify_fails_on_wrong_secret() {
        let body = b"payload";
        let sig = sign(body, "secret-a");
        assert!(!verify(body, &sig, "secret-b"));
    }

    #[test]
    fn test_issue_token_verifies() {
        let token = issue_token("abc123", "read", "secret");
        let claims = crate::session::verify_token(&token, "secret").unwrap();
        assert_eq!(claims.pubkey, "abc123");
        assert_eq!(claims.scope, "read");
    }
}
