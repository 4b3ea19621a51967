// ============================
// crates/backend-lib/src/handlers/mod.rs
// ============================
//! HTTP handlers.
pub mod lock_state;

use serde::Deserialize;

/// Query string accepted by every authenticated route
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}
