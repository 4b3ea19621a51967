// ============================
// crates/backend-lib/src/auth/service.rs
// ============================
use async_trait::async_trait;

use crate::error::AppError;
use crate::ids::UserIdentity;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolve a bearer token to the user behind it.
    async fn authenticate(&self, token: &str) -> Result<UserIdentity, AppError>;
}
