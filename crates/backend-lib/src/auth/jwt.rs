// ============================
// crates/backend-lib/src/auth/jwt.rs
// ============================
//! HS256 JWT verification against the secret shared with the login service.
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::AuthService;
use crate::error::AppError;
use crate::ids::UserIdentity;

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Display name; the user ID is shown when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

pub struct JwtAuth {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a token for `user`, valid for `valid_for`.
    pub fn issue(&self, user: &UserIdentity, valid_for: Duration) -> Result<String, AppError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let claims = Claims {
            user_id: user.id.clone(),
            name: Some(user.name.clone()),
            exp: (now + valid_for).as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
    }

    /// Verify a token and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AppError::Auth(format!("invalid or expired token: {e}")))?;
        if data.claims.user_id.is_empty() {
            return Err(AppError::Auth("token carries no user id".to_string()));
        }
        Ok(data.claims)
    }
}

#[async_trait]
impl AuthService for JwtAuth {
    async fn authenticate(&self, token: &str) -> Result<UserIdentity, AppError> {
        let claims = self.verify(token)?;
        let name = claims
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| claims.user_id.clone());
        Ok(UserIdentity::new(claims.user_id, name))
    }
}
