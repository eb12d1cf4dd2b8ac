//! Authentication: admin credential verification and short-lived bearer
//! tokens.
//!
//! Tokens are HS256 JWTs minted from `token_secret` with a TTL of
//! `token_ttl_minutes`. Validation is stateless, so any controller replica
//! holding the same secret can accept a token.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Claims carried by an access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier
    pub sub: String,
    /// Expiration timestamp (seconds since epoch)
    pub exp: usize,
    /// Issued-at timestamp
    pub iat: usize,
}

/// Authenticated context attached to a request or session.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User identifier
    pub user_id: String,
}

/// Token minting and validation plus the admin credential check.
pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    admin_username: String,
    admin_password: String,
}

impl AuthService {
    pub fn new(
        token_secret: &str,
        token_ttl_minutes: i64,
        admin_username: impl Into<String>,
        admin_password: impl Into<String>,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(token_secret.as_bytes()),
            decoding: DecodingKey::from_secret(token_secret.as_bytes()),
            ttl: Duration::minutes(token_ttl_minutes),
            admin_username: admin_username.into(),
            admin_password: admin_password.into(),
        }
    }

    /// Verify the configured credentials in constant time.
    pub fn verify_credentials(&self, username: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(username.as_bytes(), self.admin_username.as_bytes());
        let pass_ok = constant_time_eq(password.as_bytes(), self.admin_password.as_bytes());
        if !(user_ok && pass_ok) {
            warn!(username = %username, "credential check failed");
            return false;
        }
        true
    }

    /// Mint a bearer token for a user.
    pub fn issue_token(&self, user_id: &str) -> Result<String> {
        let now = Utc::now();
        let expires = now + self.ttl;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: expires.timestamp() as usize,
            iat: now.timestamp() as usize,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign token: {e}")))?;
        debug!(user_id = %user_id, ttl_secs = self.ttl.num_seconds(), "token issued");
        Ok(token)
    }

    /// Validate a bearer token, returning the authenticated context.
    pub fn validate_token(&self, token: &str) -> Result<AuthContext> {
        if token.is_empty() {
            return Err(Error::AuthFailure("missing token".to_string()));
        }
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| Error::AuthFailure(format!("invalid token: {e}")))?;
        Ok(AuthContext {
            user_id: data.claims.sub,
        })
    }
}

/// Constant-time byte comparison; unequal lengths compare unequal.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
