/// Pre-shared key authentication of the API

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::AppState;

/// Accept the request only when it carries `Authorization: Bearer <psk>`
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(provided) if is_valid(provided, &state.psk) => Ok(next.run(request).await),
        _ => Err(unauthorized_response()),
    }
}

fn is_valid(provided: &str, psk: &str) -> bool {
    !psk.is_empty() && provided == psk
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "type": "error",
            "data": "Unauthorized - invalid or missing pre-shared key"
        })),
    )
        .into_response()
}

/// Random key used when none is configured
pub fn generate_token() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    const TOKEN_LEN: usize = 32;
    let mut rng = rand::thread_rng();

    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_alphanumeric()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_empty_psk_never_matches() {
        assert!(!is_valid("", ""));
        assert!(is_valid("s3cret", "s3cret"));
        assert!(!is_valid("s3cret ", "s3cret"));
    }
}
