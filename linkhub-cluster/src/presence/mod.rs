//! Distributed presence store
//!
//! Two kinds of state are shared between hub instances:
//! - a server registry mapping `ip:port` to the last time that instance
//!   published itself
//! - one [`UserOnline`] record per user key naming the instance and
//!   connection the user is attached to
//!
//! Both are best-effort. Callers on the connection path log failures and
//! keep serving local traffic.

mod memory;
mod record;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use linkhub_core::models::{ConnectionId, ServerAddr, UserKey};

use crate::Result;

pub use memory::MemoryPresenceStore;
pub use record::UserOnline;
pub use redis::RedisPresenceStore;

/// One entry in the server registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInstance {
    pub addr: ServerAddr,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServerInstance {
    /// Stale once strictly older than `stale_after`
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .is_ok_and(|age| age > stale_after)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Publish this instance as alive at `now`
    async fn set_server_heartbeat(&self, server: &ServerAddr, now: DateTime<Utc>) -> Result<()>;

    async fn remove_server(&self, server: &ServerAddr) -> Result<()>;

    /// Instances whose last heartbeat is no older than `stale_after`
    async fn list_live_servers(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ServerInstance>>;

    async fn get_user_online(&self, key: &UserKey) -> Result<Option<UserOnline>>;

    async fn set_user_online(&self, record: &UserOnline) -> Result<()>;

    async fn delete_user_online(&self, key: &UserKey) -> Result<()>;
}

/// Mark the record for `key` logged out if this connection still holds it
///
/// Returns whether a record was updated. A record written by a newer login,
/// here or on another instance, is left alone.
pub async fn mark_logged_out(
    store: &dyn PresenceStore,
    key: &UserKey,
    server: &ServerAddr,
    connection_id: &ConnectionId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(mut record) = store.get_user_online(key).await? else {
        return Ok(false);
    };
    if !record.is_held_by(server, connection_id) || record.is_logoff {
        return Ok(false);
    }
    record.log_out(now);
    store.set_user_online(&record).await?;
    Ok(true)
}

/// Refresh the heartbeat time on the record for `key` if this connection holds it
pub async fn refresh_user_heartbeat(
    store: &dyn PresenceStore,
    key: &UserKey,
    server: &ServerAddr,
    connection_id: &ConnectionId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(mut record) = store.get_user_online(key).await? else {
        return Ok(false);
    };
    if !record.is_held_by(server, connection_id) {
        return Ok(false);
    }
    record.heartbeat(now);
    store.set_user_online(&record).await?;
    Ok(true)
}

/// Make `record` the stored record for its key unless the same connection
/// already holds a live one
///
/// Used once the local registry has committed a mapping, so a record
/// overwritten by an interleaved login is put back. Returns whether a write
/// happened.
pub async fn claim_user_online(
    store: &dyn PresenceStore,
    mut record: UserOnline,
    now: DateTime<Utc>,
) -> Result<bool> {
    let key = record.user_key();
    if let Some(existing) = store.get_user_online(&key).await? {
        if existing.is_held_by(&record.server, &record.connection_id) && !existing.is_logoff {
            return Ok(false);
        }
    }
    record.heartbeat(now);
    store.set_user_online(&record).await?;
    Ok(true)
}
