use std::time::Duration;

use chrono::{DateTime, Utc};
use linkhub_core::models::{ConnectionId, ServerAddr, UserId, UserKey};
use serde::{Deserialize, Serialize};

/// Cluster-wide login record for one user key
///
/// Written by whichever instance accepted the login; other instances read it
/// to find where the user is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOnline {
    pub server: ServerAddr,
    pub platform: u32,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub client_addr: String,
    pub login_time: DateTime<Utc>,
    pub heartbeat_time: DateTime<Utc>,
    #[serde(default)]
    pub logout_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_logoff: bool,
}

impl UserOnline {
    /// Fresh record for a login accepted at `now`
    #[must_use]
    pub fn login(
        server: ServerAddr,
        key: &UserKey,
        connection_id: ConnectionId,
        client_addr: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            server,
            platform: key.platform,
            user_id: key.user_id.clone(),
            connection_id,
            client_addr: client_addr.into(),
            login_time: now,
            heartbeat_time: now,
            logout_time: None,
            is_logoff: false,
        }
    }

    #[must_use]
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.platform, self.user_id.clone())
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        if now > self.heartbeat_time {
            self.heartbeat_time = now;
        }
        self.is_logoff = false;
    }

    pub fn log_out(&mut self, now: DateTime<Utc>) {
        self.logout_time = Some(now);
        self.is_logoff = true;
    }

    /// Whether the record was written by this exact connection on this instance
    #[must_use]
    pub fn is_held_by(&self, server: &ServerAddr, connection_id: &ConnectionId) -> bool {
        &self.server == server && &self.connection_id == connection_id
    }

    /// Logged in and heard from within `timeout`
    #[must_use]
    pub fn is_online(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.is_logoff {
            return false;
        }
        let age = now.signed_duration_since(self.heartbeat_time);
        age.to_std().map_or(true, |age| age <= timeout)
    }
}
