//! Session-token verification. Token issuance belongs to the external auth
//! provider; both sides share `AUTH_SECRET`. A token carries
//! `(user, organization, role, expiry)` and an HMAC over exactly those
//! fields.

use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use relaydesk_core::error::InboxError;
use relaydesk_core::types::AgentRole;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: AgentRole,
}

fn token_mac(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// `user:org:role:exp:sig` where sig = HMAC(secret, "user:org:role:exp").
pub fn issue_token(secret: &str, context: &AuthContext, ttl_secs: i64) -> String {
    let exp = Utc::now().timestamp() + ttl_secs;
    let payload = format!(
        "{}:{}:{}:{}",
        context.user_id,
        context.organization_id,
        context.role.as_str(),
        exp
    );
    format!("{}:{}", payload, token_mac(secret, &payload))
}

pub fn verify_token(secret: &str, token: &str) -> Option<AuthContext> {
    let (payload, sig_hex) = token.rsplit_once(':')?;
    let Ok(signature) = hex::decode(sig_hex) else {
        return None;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature).ok()?;

    let mut parts = payload.split(':');
    let user_id = Uuid::parse_str(parts.next()?).ok()?;
    let organization_id = Uuid::parse_str(parts.next()?).ok()?;
    let role = AgentRole::parse(parts.next()?)?;
    let exp: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || exp < Utc::now().timestamp() {
        return None;
    }

    Some(AuthContext { user_id, organization_id, role })
}

/// Per-handler check: read the bearer token and resolve the caller, or fail
/// Authn.
pub fn authenticate(secret: &str, headers: &HeaderMap) -> Result<AuthContext, InboxError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = header.strip_prefix("Bearer ").unwrap_or("");
    if token.is_empty() {
        return Err(InboxError::Authn("missing bearer token".to_string()));
    }
    verify_token(secret, token)
        .ok_or_else(|| InboxError::Authn("invalid or expired session".to_string()))
}
