//! Pre-shared API key gate.
//!
//! The `/api/*` endpoints require an `Authorization: Bearer <key>` header.
//! The bridge WebSocket paths use a `?token=` query parameter instead
//! (browsers can't set headers on WebSocket upgrades). `/health` is open.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected API key, injected as a router extension so [`require_api_key`]
/// doesn't need `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

impl ApiKey {
    /// Constant-time check of a client-supplied key.
    pub fn matches(&self, provided: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), provided.as_bytes())
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Axum middleware guarding the REST endpoints.
///
/// `401` when the header is missing or not a Bearer token, `403` when the
/// key is wrong, `500` if the [`ApiKey`] extension was never layered in.
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(api_key) = request.extensions().get::<ApiKey>().cloned() else {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error");
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        None => reject(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
        ),
        Some(key) if !api_key.matches(key) => reject(StatusCode::FORBIDDEN, "Invalid API key"),
        Some(_) => next.run(request).await,
    }
}

/// Byte comparison whose running time depends only on `expected`.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_api_key_matches() {
        let key = ApiKey("k3y".into());
        assert!(key.matches("k3y"));
        assert!(!key.matches("k3y "));
        assert!(!key.matches(""));
    }
}
