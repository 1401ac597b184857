//! Caller authentication for HTTP handlers and the WebSocket upgrade.
//!
//! The raw token is looked up in a fixed order: the `access_token` cookie,
//! then an `Authorization: Bearer` header, and for realtime connections
//! finally a `?token=` query parameter.

use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;

use huddle_shared::constants::AUTH_COOKIE;
use huddle_shared::types::UserId;
use huddle_shared::ChatError;

use crate::api::AppState;
use crate::error::ApiError;

/// The authenticated caller of an HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = http_token(&parts.headers)
            .ok_or_else(|| ChatError::Unauthenticated("Authentication required".into()))?;
        Ok(Self(state.authenticate(token)?))
    }
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == AUTH_COOKIE && !value.is_empty())
        .map(|(_, value)| value)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn http_token(headers: &HeaderMap) -> Option<&str> {
    cookie_token(headers).or_else(|| bearer_token(headers))
}

pub fn realtime_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<&'a str> {
    http_token(headers).or_else(|| query.filter(|t| !t.is_empty()))
}
