use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-scrapco-signature";

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_signature(secret: &str, body: &[u8], provided: &str) -> bool {
    let expected = sign_body(secret, body);
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Rejects vendor callbacks whose body was not signed with the shared
/// webhook secret.
pub fn require_signature(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized(format!("missing {SIGNATURE_HEADER} header"))
        })?;

    if !verify_signature(&state.config.vendor_webhook_secret, body, provided) {
        return Err(AppError::Unauthorized("invalid signature".to_string()));
    }
    Ok(())
}

/// Authenticated customer. Extract this in handlers that require a bearer.
pub struct CustomerIdentity {
    pub customer_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CustomerIdentity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;

        match state.identity.customer_from_token(token).await {
            Ok(Some(customer_id)) => Ok(CustomerIdentity { customer_id }),
            Ok(None) => Err(AppError::Unauthorized("invalid bearer token".to_string())),
            Err(err) => Err(AppError::Upstream(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{sign_body, verify_signature};

    #[test]
    fn signature_roundtrip() {
        let body = br#"{"pickupId":"abc","vendor_id":"v1"}"#;
        let sig = sign_body("secret", body);
        assert!(verify_signature("secret", body, &sig));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let sig = sign_body("secret", b"original");
        assert!(!verify_signature("secret", b"tampered", &sig));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let sig = sign_body("secret", b"body");
        assert!(!verify_signature("other", b"body", &sig));
    }

    #[test]
    fn truncated_signature_fails_verification() {
        let sig = sign_body("secret", b"body");
        assert!(!verify_signature("secret", b"body", &sig[..10]));
    }
}
