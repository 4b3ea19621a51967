// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the chapter lock coordinator.
//!
//! Editors join a story room over a WebSocket, take short-lived leases on the
//! chapters they edit, and every room member is told whenever a chapter's lock
//! changes.

pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod lease_manager;
pub mod lease_store;
pub mod lifecycle;
pub mod metrics;
pub mod presence;
pub mod sweeper;
pub mod validation;
pub mod ws_router;

use axum::http::HeaderMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::auth::{extract_token, AuthService, JwtAuth};
use crate::clock::SystemClock;
use crate::config::Settings;
use crate::error::AppError;
use crate::ids::UserIdentity;
use crate::lease_manager::LeaseManager;
use crate::lease_store::{InMemoryLeaseStore, LeaseStore};
use crate::lifecycle::LifecycleHandler;
use crate::presence::PresenceRegistry;
use crate::sweeper::ExpirySweeper;

/// Application state shared across all handlers
pub struct AppState {
    /// Settings the server was started with
    pub settings: Arc<Settings>,
    /// Authentication service
    pub auth: Arc<dyn AuthService>,
    /// Live connections and story rooms
    pub presence: Arc<PresenceRegistry>,
    /// Lock policy over the lease store
    pub manager: Arc<LeaseManager>,
    /// Transport event entry point
    pub lifecycle: Arc<LifecycleHandler>,
}

impl AppState {
    /// Create the production state: in-memory lease store, wall clock, JWT auth.
    pub fn new(settings: Settings) -> Self {
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(SystemClock)));
        let auth = Arc::new(JwtAuth::new(&settings.auth.jwt_secret));
        Self::with_components(settings, store, auth)
    }

    /// Create a state around a caller-supplied store and auth service
    pub fn with_components(
        settings: Settings,
        store: Arc<dyn LeaseStore>,
        auth: Arc<dyn AuthService>,
    ) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let manager = Arc::new(LeaseManager::new(store, presence.clone(), settings.lock.ttl()));
        let lifecycle = Arc::new(LifecycleHandler::new(
            presence.clone(),
            manager.clone(),
            &settings.lock,
        ));

        Self {
            settings: Arc::new(settings),
            auth,
            presence,
            manager,
            lifecycle,
        }
    }

    /// Start the expiry sweeper. Call once per lease store.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        ExpirySweeper::new(self.manager.clone(), self.settings.lock.sweep_interval()).spawn()
    }

    /// Resolve the caller of an HTTP or upgrade request.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<UserIdentity, AppError> {
        let token = extract_token(headers, query_token, &self.settings.auth.cookie_name)
            .ok_or_else(|| AppError::Auth("missing token".to_string()))?;
        self.auth.authenticate(&token).await
    }
}
