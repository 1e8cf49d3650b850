//! Periodic publication of this instance into the server registry

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use linkhub_core::models::ServerAddr;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::presence::PresenceStore;

/// Keeps this instance's entry in the server registry fresh
///
/// Publishes once immediately, then every `refresh`. On cancellation the
/// entry is removed so peers stop routing here before it goes stale.
pub struct PresenceHeartbeat {
    store: Arc<dyn PresenceStore>,
    server: ServerAddr,
    refresh: Duration,
}

impl PresenceHeartbeat {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, server: ServerAddr, refresh: Duration) -> Self {
        Self {
            store,
            server,
            refresh,
        }
    }

    /// Publish once. Failures are logged and reported as `false`.
    pub async fn beat(&self) -> bool {
        match self.store.set_server_heartbeat(&self.server, Utc::now()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "Failed to publish server heartbeat");
                false
            }
        }
    }

    /// Start the refresh loop
    ///
    /// Returns the `JoinHandle` so the caller can wait for the final removal.
    pub fn start(self, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut timer = interval(self.refresh);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            tracing::info!(
                server = %self.server,
                refresh_secs = self.refresh.as_secs(),
                "Presence heartbeat started"
            );

            loop {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => break,
                    _ = timer.tick() => {
                        self.beat().await;
                    }
                }
            }

            match self.store.remove_server(&self.server).await {
                Ok(()) => tracing::info!(server = %self.server, "Removed server from registry"),
                Err(e) => {
                    tracing::warn!(server = %self.server, error = %e, "Failed to remove server from registry");
                }
            }
        })
    }
}
