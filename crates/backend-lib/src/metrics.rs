// ============================
// crates/backend-lib/src/metrics.rs
// ============================
//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const WS_OVERFLOW: &str = "ws.overflow";
pub const LOCK_GRANTED: &str = "lock.granted";
pub const LOCK_RENEWED: &str = "lock.renewed";
pub const LOCK_DENIED: &str = "lock.denied";
pub const LOCK_RELEASED: &str = "lock.released";
pub const LOCK_EXPIRED: &str = "lock.expired";
pub const LOCK_STORE_UNAVAILABLE: &str = "lock.store_unavailable";
