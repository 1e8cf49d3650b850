//! Redis-backed presence store
//!
//! Layout:
//! - `{prefix}hash:servers`: hash of `ip:port` to unix seconds of the last
//!   heartbeat, with a key-level TTL refreshed on every write
//! - `{prefix}user:online:{platform}_{user_id}`: JSON [`UserOnline`] written with SETEX

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use linkhub_core::models::{ServerAddr, UserKey};
use tokio::time::timeout;

use super::{PresenceStore, ServerInstance, UserOnline};
use crate::error::{Error, Result};

/// TTL on the whole server hash; individual entries age out via `stale_after`
const SERVERS_KEY_TTL_SECS: u64 = 2 * 60 * 60;

/// TTL on one user online record
const USER_ONLINE_TTL_SECS: u64 = 24 * 60 * 60;

pub struct RedisPresenceStore {
    client: redis::Client,
    key_prefix: String,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisPresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPresenceStore")
            .field("key_prefix", &self.key_prefix)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisPresenceStore {
    /// Open a client for `url`
    ///
    /// No connection is made until the first operation.
    pub fn new(url: &str, key_prefix: impl Into<String>, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            op_timeout,
        })
    }

    /// Round-trip a PING so startup fails fast on a bad address
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        timeout(
            self.op_timeout,
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis PING timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis PING failed: {e}")))?;
        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        timeout(
            self.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis connection failed: {e}")))
    }

    fn servers_key(&self) -> String {
        format!("{}hash:servers", self.key_prefix)
    }

    fn user_online_key(&self, key: &UserKey) -> String {
        format!("{}user:online:{key}", self.key_prefix)
    }
}

/// Turn raw hash entries into live instances
///
/// Entries with an unparsable field or value are skipped.
fn parse_server_entries(
    entries: HashMap<String, String>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<ServerInstance> {
    let mut live = Vec::with_capacity(entries.len());
    for (field, value) in entries {
        let addr = match field.parse::<ServerAddr>() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(field = %field, error = %e, "Skipping malformed server entry");
                continue;
            }
        };
        let last_heartbeat = match value
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            Some(ts) => ts,
            None => {
                tracing::warn!(field = %field, value = %value, "Skipping server entry with bad timestamp");
                continue;
            }
        };
        let instance = ServerInstance {
            addr,
            last_heartbeat,
        };
        if !instance.is_stale(now, stale_after) {
            live.push(instance);
        }
    }
    live.sort_by(|a, b| a.addr.to_string().cmp(&b.addr.to_string()));
    live
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_server_heartbeat(&self, server: &ServerAddr, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = self.servers_key();

        timeout(
            self.op_timeout,
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&key)
                .arg(server.to_string())
                .arg(now.timestamp())
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(SERVERS_KEY_TTL_SECS)
                .ignore()
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis HSET timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis HSET failed: {e}")))?;

        tracing::debug!(server = %server, "Server heartbeat published");
        Ok(())
    }

    async fn remove_server(&self, server: &ServerAddr) -> Result<()> {
        let mut conn = self.connection().await?;

        timeout(
            self.op_timeout,
            redis::cmd("HDEL")
                .arg(self.servers_key())
                .arg(server.to_string())
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis HDEL timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis HDEL failed: {e}")))?;

        Ok(())
    }

    async fn list_live_servers(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ServerInstance>> {
        let mut conn = self.connection().await?;

        let entries: HashMap<String, String> = timeout(
            self.op_timeout,
            redis::cmd("HGETALL")
                .arg(self.servers_key())
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis HGETALL timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis HGETALL failed: {e}")))?;

        Ok(parse_server_entries(entries, now, stale_after))
    }

    async fn get_user_online(&self, key: &UserKey) -> Result<Option<UserOnline>> {
        let mut conn = self.connection().await?;

        let value: Option<String> = timeout(
            self.op_timeout,
            redis::cmd("GET")
                .arg(self.user_online_key(key))
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis GET timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis GET failed: {e}")))?;

        value
            .map(|json| {
                serde_json::from_str::<UserOnline>(&json).map_err(|e| {
                    Error::Serialization(format!("Failed to decode user online record: {e}"))
                })
            })
            .transpose()
    }

    async fn set_user_online(&self, record: &UserOnline) -> Result<()> {
        let mut conn = self.connection().await?;
        let value = serde_json::to_string(record)
            .map_err(|e| Error::Serialization(format!("Failed to encode user online record: {e}")))?;

        timeout(
            self.op_timeout,
            redis::cmd("SETEX")
                .arg(self.user_online_key(&record.user_key()))
                .arg(USER_ONLINE_TTL_SECS)
                .arg(&value)
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis SETEX timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis SETEX failed: {e}")))?;

        Ok(())
    }

    async fn delete_user_online(&self, key: &UserKey) -> Result<()> {
        let mut conn = self.connection().await?;

        timeout(
            self.op_timeout,
            redis::cmd("DEL")
                .arg(self.user_online_key(key))
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis DEL timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis DEL failed: {e}")))?;

        Ok(())
    }
}
