use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use linkhub_core::models::{ServerAddr, UserKey};

use super::{PresenceStore, ServerInstance, UserOnline};
use crate::Result;

/// Process-local presence store
///
/// Used when no Redis URL is configured (single-instance deployments) and in tests.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    servers: DashMap<ServerAddr, DateTime<Utc>>,
    users: DashMap<UserKey, UserOnline>,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_server_heartbeat(&self, server: &ServerAddr, now: DateTime<Utc>) -> Result<()> {
        self.servers.insert(server.clone(), now);
        Ok(())
    }

    async fn remove_server(&self, server: &ServerAddr) -> Result<()> {
        self.servers.remove(server);
        Ok(())
    }

    async fn list_live_servers(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ServerInstance>> {
        let mut live: Vec<ServerInstance> = self
            .servers
            .iter()
            .map(|entry| ServerInstance {
                addr: entry.key().clone(),
                last_heartbeat: *entry.value(),
            })
            .filter(|instance| !instance.is_stale(now, stale_after))
            .collect();
        live.sort_by(|a, b| a.addr.to_string().cmp(&b.addr.to_string()));
        Ok(live)
    }

    async fn get_user_online(&self, key: &UserKey) -> Result<Option<UserOnline>> {
        Ok(self.users.get(key).map(|entry| entry.value().clone()))
    }

    async fn set_user_online(&self, record: &UserOnline) -> Result<()> {
        self.users.insert(record.user_key(), record.clone());
        Ok(())
    }

    async fn delete_user_online(&self, key: &UserKey) -> Result<()> {
        self.users.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkhub_core::models::ConnectionId;

    #[tokio::test]
    async fn test_list_live_servers_excludes_stale() {
        let store = MemoryPresenceStore::new();
        let now = Utc::now();
        let fresh = ServerAddr::new("10.0.0.1", 8089);
        let stale = ServerAddr::new("10.0.0.2", 8089);
        store
            .set_server_heartbeat(&fresh, now - chrono::Duration::seconds(10))
            .await
            .unwrap();
        store
            .set_server_heartbeat(&stale, now - chrono::Duration::seconds(181))
            .await
            .unwrap();

        let live = store
            .list_live_servers(now, Duration::from_secs(180))
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].addr, fresh);
    }

    #[tokio::test]
    async fn test_remove_server() {
        let store = MemoryPresenceStore::new();
        let now = Utc::now();
        let addr = ServerAddr::new("10.0.0.1", 8089);
        store.set_server_heartbeat(&addr, now).await.unwrap();
        store.remove_server(&addr).await.unwrap();
        assert!(store
            .list_live_servers(now, Duration::from_secs(180))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_user_online_roundtrip_and_delete() {
        let store = MemoryPresenceStore::new();
        let key = UserKey::new(102, "bob");
        let record = UserOnline::login(
            ServerAddr::new("10.0.0.1", 8089),
            &key,
            ConnectionId::new(),
            "peer",
            Utc::now(),
        );
        store.set_user_online(&record).await.unwrap();
        assert_eq!(store.get_user_online(&key).await.unwrap(), Some(record));

        store.delete_user_online(&key).await.unwrap();
        assert!(store.get_user_online(&key).await.unwrap().is_none());
    }
}
