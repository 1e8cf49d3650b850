//! Eviction of lapsed connections: stale heartbeats, connections that never
//! logged in, and sessions whose token has expired

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use linkhub_core::config::WebSocketConfig;
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::{notify_and_close, Hub};
use crate::protocol::SESSION_EXPIRED;

/// Thresholds applied by each sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub heartbeat_timeout: Duration,
    /// `None` lets anonymous connections live until their heartbeat lapses
    pub anonymous_timeout: Option<Duration>,
}

impl SweepPolicy {
    #[must_use]
    pub const fn from_config(config: &WebSocketConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            anonymous_timeout: config.anonymous_timeout(),
        }
    }
}

/// Connections closed by one sweep, by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub anonymous: usize,
    pub expired: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.timed_out + self.anonymous + self.expired
    }
}

/// Close every connection that has lapsed under `policy` at `now`
///
/// Connections are only closed here. Their reader tasks observe the close
/// and submit the unregister event, so the registry is never touched directly.
/// Each connection is counted under the first reason that applies.
pub fn sweep_once(hub: &Hub, now: DateTime<Utc>, policy: &SweepPolicy) -> SweepReport {
    let mut report = SweepReport::default();
    for conn in hub.connections_snapshot() {
        if conn.is_closed() {
            continue;
        }
        if conn.is_heartbeat_timeout(now, policy.heartbeat_timeout) {
            info!(
                connection_id = %conn.id(),
                addr = %conn.addr(),
                last_heartbeat = %conn.last_heartbeat(),
                "Closing connection after heartbeat timeout"
            );
            conn.close();
            report.timed_out += 1;
            continue;
        }

        let Some(state) = conn.login_state() else {
            if let Some(limit) = policy.anonymous_timeout {
                let age = (now - conn.first_seen()).to_std().unwrap_or_default();
                if age >= limit {
                    info!(
                        connection_id = %conn.id(),
                        addr = %conn.addr(),
                        "Closing connection that never logged in"
                    );
                    conn.close();
                    report.anonymous += 1;
                }
            }
            continue;
        };

        if conn.is_token_expired(now) {
            info!(
                connection_id = %conn.id(),
                user_key = %state.user_key,
                "Closing connection with expired token"
            );
            notify_and_close(
                &conn,
                SESSION_EXPIRED,
                json!({ "user_key": state.user_key.to_string(), "reason": "token expired" }),
            );
            report.expired += 1;
        }
    }
    report
}

pub struct ConnectionSweeper {
    hub: Arc<Hub>,
    every: Duration,
    policy: SweepPolicy,
}

impl ConnectionSweeper {
    #[must_use]
    pub const fn new(hub: Arc<Hub>, every: Duration, policy: SweepPolicy) -> Self {
        Self { hub, every, policy }
    }

    pub fn start(self, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut timer = interval(self.every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            // The first tick completes immediately; nothing can be stale yet
            timer.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => {
                        info!("Connection sweeper shutting down");
                        break;
                    }
                    _ = timer.tick() => {
                        let report = sweep_once(&self.hub, Utc::now(), &self.policy);
                        debug!(
                            timed_out = report.timed_out,
                            anonymous = report.anonymous,
                            expired = report.expired,
                            remaining = self.hub.connection_count(),
                            "Sweep finished"
                        );
                    }
                }
            }
        })
    }
}
