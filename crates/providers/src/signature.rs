use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verify an `X-Hub-Signature-256` header value against the exact raw
/// request body. The header carries `sha256=<hexdigest>` where the digest is
/// HMAC-SHA256(secret, body). `verify_slice` does the constant-time compare.
pub fn verify_signature(signature_header: Option<&str>, body: &[u8], secret: &str) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Produce the header value a provider would send for this body; used by
/// callers that simulate provider deliveries.
pub fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "app-secret";
    const BODY: &[u8] = br#"{"entry":[{"id":"123"}]}"#;

    #[test]
    fn own_signature_verifies() {
        let header = sign_payload(BODY, SECRET);
        assert!(verify_signature(Some(&header), BODY, SECRET));
    }

    #[test]
    fn altered_body_is_rejected() {
        let header = sign_payload(BODY, SECRET);
        let mut tampered = BODY.to_vec();
        tampered[0] ^= 0x01;
        assert!(!verify_signature(Some(&header), &tampered, SECRET));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let header = sign_payload(BODY, SECRET);
        assert!(!verify_signature(Some(&header), BODY, "other-secret"));
    }

    #[test]
    fn altered_hex_is_rejected() {
        let header = sign_payload(BODY, SECRET);
        let mut chars: Vec<char> = header.chars().collect();
        let last = *chars.last().unwrap();
        *chars.last_mut().unwrap() = if last == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert!(!verify_signature(Some(&tampered), BODY, SECRET));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(!verify_signature(None, BODY, SECRET));
        assert!(!verify_signature(Some(""), BODY, SECRET));
        assert!(!verify_signature(Some("sha1=abcdef"), BODY, SECRET));
        assert!(!verify_signature(Some("sha256=not-hex"), BODY, SECRET));
        assert!(!verify_signature(Some("sha256=0000"), BODY, SECRET));
    }
}
