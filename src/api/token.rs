//! `POST /token` — exchange credentials for a short-lived bearer token.

use std::sync::Arc;

use axum::{http::StatusCode, Extension, Form, Json};
use ogent_core::AuthService;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

pub async fn issue_token(
    Extension(auth): Extension<Arc<AuthService>>,
    Form(request): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    if !auth.verify_credentials(&request.username, &request.password) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "incorrect username or password",
        ));
    }

    let access_token = auth.issue_token(&request.username)?;
    info!(username = %request.username, "token issued");
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}
