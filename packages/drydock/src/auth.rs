//! Bearer-token authentication for the API surface.
//!
//! Authentication is a startup-time decision: when no secret is configured
//! the service runs open and the extractor admits every request. When a
//! secret is configured, a missing credential (401) is distinguished from a
//! wrong one (403).

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::api::App;

/// Proof that the request carried a valid credential (or that the service
/// runs unauthenticated). Extract it in any handler that requires auth.
#[derive(Copy, Clone, Debug)]
pub struct Verified;

/// Why a request was turned away.
#[derive(Copy, Clone, Debug)]
pub enum AuthRejection {
    /// No usable `Authorization: Bearer` credential was presented.
    Missing,

    /// A credential was presented but does not match the configured secret.
    Forbidden,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AuthRejection::Missing => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthRejection::Forbidden => (StatusCode::FORBIDDEN, "Invalid authentication token"),
        };
        (status, Json(json!({ "success": false, "error": error }))).into_response()
    }
}

impl FromRequestParts<App> for Verified {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &App) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.secret_key.as_deref() else {
            return Ok(Verified);
        };

        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Err(AuthRejection::Missing);
        };
        let Ok(header) = header.to_str() else {
            return Err(AuthRejection::Missing);
        };

        let token = match header.strip_prefix("Bearer") {
            Some(token) => token.trim(),
            None => header.trim(),
        };
        if token.is_empty() {
            return Err(AuthRejection::Missing);
        }

        if token == expected {
            Ok(Verified)
        } else {
            Err(AuthRejection::Forbidden)
        }
    }
}
