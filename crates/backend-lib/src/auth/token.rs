// ============================
// crates/backend-lib/src/auth/token.rs
// ============================
//! Token extraction from an HTTP upgrade or query request.
use axum::http::{header, HeaderMap};

/// Find the caller's token: `Authorization: Bearer`, then the auth cookie,
/// then the `token` query parameter.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>, cookie_name: &str) -> Option<String> {
    bearer_token(headers)
        .or_else(|| cookie_token(headers, cookie_name))
        .or_else(|| {
            query_token
                .filter(|token| !token.is_empty())
                .map(str::to_string)
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn cookie_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
