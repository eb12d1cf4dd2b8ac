//! Authentication middleware for Axum.
//!
//! Extracts bearer tokens from requests and validates them against the
//! `AuthService`. Handlers take a `RequireAuth` argument to enforce auth.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ogent_core::{AuthContext, AuthService, Error};
use serde::Serialize;
use std::sync::Arc;

/// JSON error response for auth failures
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    success: bool,
    error: String,
    code: String,
}

/// Auth rejection type
pub struct AuthRejection {
    status: StatusCode,
    body: AuthErrorResponse,
}

impl AuthRejection {
    fn new(status: StatusCode, error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            body: AuthErrorResponse {
                success: false,
                error: error.into(),
                code: code.into(),
            },
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "UNAUTHORIZED")
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            "INTERNAL_ERROR",
        )
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Axum extractor that requires a valid bearer token.
///
/// Token sources, in order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `?token=<token>` query parameter (WebSocket upgrades)
pub struct RequireAuth(pub AuthContext);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<Arc<AuthService>>()
            .ok_or_else(|| AuthRejection::internal("AuthService not configured"))?;

        let token = extract_token(parts).ok_or_else(|| {
            AuthRejection::unauthorized(
                "Authentication required. Provide Authorization: Bearer <token>.",
            )
        })?;

        match auth.validate_token(&token) {
            Ok(ctx) => Ok(RequireAuth(ctx)),
            Err(Error::AuthFailure(msg)) => Err(AuthRejection::unauthorized(msg)),
            Err(e) => Err(AuthRejection::internal(e.to_string())),
        }
    }
}

/// Extract a token from request headers or query params.
fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(header) = parts.headers.get("authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    if let Some(query) = parts.uri.query() {
        for param in query.split('&') {
            if let Some(token) = param.strip_prefix("token=") {
                return Some(token.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_for(uri: &str, auth_header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth_header {
            builder = builder.header("authorization", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_extracts_bearer_header() {
        let parts = parts_for("/agents", Some("Bearer tok-123"));
        assert_eq!(extract_token(&parts).as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_extracts_query_token() {
        let parts = parts_for("/ws/gateway?token=tok-456", None);
        assert_eq!(extract_token(&parts).as_deref(), Some("tok-456"));
    }

    #[test]
    fn test_missing_token_is_none() {
        let parts = parts_for("/agents", None);
        assert!(extract_token(&parts).is_none());
    }

    #[test]
    fn test_non_bearer_header_is_ignored() {
        let parts = parts_for("/agents", Some("Basic dXNlcjpwdw=="));
        assert!(extract_token(&parts).is_none());
    }
}
