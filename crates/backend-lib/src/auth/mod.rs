// ============================
// crates/backend-lib/src/auth/mod.rs
// ============================
//! Authentication module.
//!
//! The coordinator trusts whatever identity the `AuthService` returns; it never
//! derives user ids itself.

mod jwt;
mod service;
mod token;

pub use jwt::{Claims, JwtAuth};
pub use service::AuthService;
pub use token::extract_token;
