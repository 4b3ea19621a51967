// ============================
// crates/backend-lib/src/sweeper.rs
// ============================
//! Expiry sweeper: background reclamation of leases whose owner stopped renewing.
//!
//! A lease stays visible as locked for at most `TTL + sweep interval` after its
//! last renewal. Only one sweeper may run per lease store.
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lease_manager::LeaseManager;

pub struct ExpirySweeper {
    manager: Arc<LeaseManager>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(manager: Arc<LeaseManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run one pass and return how many leases were reclaimed.
    pub fn sweep_once(&self) -> usize {
        match self.manager.reclaim_expired() {
            Ok(reclaimed) => {
                if reclaimed > 0 {
                    tracing::info!(reclaimed, "expired leases reclaimed");
                }
                reclaimed
            },
            Err(err) => {
                tracing::warn!(error = %err, "expiry sweep failed");
                0
            },
        }
    }

    /// Sweep forever on a fixed interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "expiry sweeper started");

        loop {
            ticker.tick().await;
            self.sweep_once();
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
