// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::AppError;

/// Prefix of environment variable overrides, e.g. `CHAPTERLOCK_LOCK__TTL_MS`
pub const ENV_PREFIX: &str = "CHAPTERLOCK_";
/// Config file read by `Settings::load`
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
/// Secret shipped for local development only
pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MIN_TTL_MS: u64 = 1_000;

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level
    pub log_level: String,
    /// Lease timing
    pub lock: LockSettings,
    /// Token verification
    pub auth: AuthSettings,
}

/// Lease timing. Heartbeat and sweep cadences derive from the TTL unless set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lease lifetime after the last renewal
    pub ttl_ms: u64,
    /// Client renewal cadence; `ttl_ms / 3` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    /// Expiry sweep cadence; `ttl_ms / 4` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_ms: Option<u64>,
}

/// Token verification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret shared with the login service
    pub jwt_secret: String,
    /// Cookie carrying the token
    pub cookie_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            lock: LockSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 12_000,
            heartbeat_interval_ms: None,
            sweep_interval_ms: None,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            cookie_name: "token".to_string(),
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.unwrap_or(self.ttl_ms / 3)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms())
    }

    pub fn sweep_interval_ms(&self) -> u64 {
        self.sweep_interval_ms.unwrap_or(self.ttl_ms / 4)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms())
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.ttl_ms < MIN_TTL_MS {
            return Err(AppError::Config(format!(
                "lock.ttl_ms must be at least {MIN_TTL_MS}"
            )));
        }
        let heartbeat = self.heartbeat_interval_ms();
        if heartbeat == 0 || heartbeat.saturating_mul(3) > self.ttl_ms {
            return Err(AppError::Config(format!(
                "lock.heartbeat_interval_ms ({heartbeat}) must be positive and at most a third of lock.ttl_ms ({})",
                self.ttl_ms
            )));
        }
        let sweep = self.sweep_interval_ms();
        if sweep == 0 || sweep > self.ttl_ms {
            return Err(AppError::Config(format!(
                "lock.sweep_interval_ms ({sweep}) must be positive and not exceed lock.ttl_ms ({})",
                self.ttl_ms
            )));
        }
        Ok(())
    }
}

impl Settings {
    /// Load from `config.toml` (if present) and the environment
    pub fn load() -> Result<Self, AppError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific TOML file (if present) and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the coordinator cannot run safely with
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(AppError::Config(format!(
                "log_level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }
        self.lock.validate()?;
        if self.auth.jwt_secret.is_empty() {
            return Err(AppError::Config("auth.jwt_secret must not be empty".to_string()));
        }
        if self.auth.cookie_name.is_empty() {
            return Err(AppError::Config("auth.cookie_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.auth.jwt_secret == DEV_JWT_SECRET
    }
}
