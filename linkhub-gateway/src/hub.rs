use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use linkhub_cluster::presence::{self, PresenceStore, UserOnline};
use linkhub_core::config::PresenceConfig;
use linkhub_core::models::{ConnectionId, ServerAddr, UserId, UserKey};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::protocol::{Response, SESSION_KICKED};

/// Lifecycle mutations, applied in submission order by [`Hub::run`]
#[derive(Debug)]
pub enum HubEvent {
    Register(Arc<Connection>),
    Login {
        user_key: UserKey,
        /// Key the connection held before this login, if any
        previous: Option<UserKey>,
        conn: Arc<Connection>,
    },
    Unregister(Arc<Connection>),
}

impl HubEvent {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Login { .. } => "login",
            Self::Unregister(_) => "unregister",
        }
    }
}

/// Where a user key is currently attached
#[derive(Debug, Clone)]
pub enum Location {
    Local(Arc<Connection>),
    Remote(ServerAddr),
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub server: String,
    pub connections: usize,
    pub users: usize,
    /// Registered connections that have not logged in
    pub anonymous: usize,
    pub topics: usize,
    pub pending_events: usize,
    /// Authenticated connections per platform
    pub platforms: BTreeMap<u32, usize>,
}

type Subscribers = HashMap<ConnectionId, Arc<Connection>>;

/// In-process registry of live connections and the user keys they hold
pub struct Hub {
    server: ServerAddr,
    presence: Arc<dyn PresenceStore>,
    stale_after: Duration,
    user_online_timeout: Duration,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    users: RwLock<HashMap<UserKey, Arc<Connection>>>,
    /// Lock order: `connections` before `topics`
    topics: RwLock<HashMap<String, Subscribers>>,
    events_tx: mpsc::UnboundedSender<HubEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HubEvent>>>,
    pending: AtomicUsize,
    presence_tasks: TaskTracker,
}

impl Hub {
    #[must_use]
    pub fn new(
        server: ServerAddr,
        presence: Arc<dyn PresenceStore>,
        presence_config: &PresenceConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            server,
            presence,
            stale_after: presence_config.stale_after(),
            user_online_timeout: presence_config.user_online_timeout(),
            connections: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pending: AtomicUsize::new(0),
            presence_tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub const fn server(&self) -> &ServerAddr {
        &self.server
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.presence
    }

    /// Queue a lifecycle event for the event loop
    pub fn submit(&self, event: HubEvent) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(event)) = self.events_tx.send(event) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(event = event.kind(), "Hub event loop stopped, dropping event");
        }
    }

    /// Spawn [`Hub::run`] on the runtime
    pub fn start(self: &Arc<Self>, cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.run(cancel_token).await })
    }

    /// Consume lifecycle events until cancelled
    ///
    /// Each event is applied under its own panic guard. Only the first call
    /// gets the event stream; later calls return immediately.
    pub async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        let Some(mut events) = self.events_rx.lock().take() else {
            warn!("Hub event loop already running");
            return;
        };
        info!(server = %self.server, "Hub event loop started");

        loop {
            let event = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.pending.fetch_sub(1, Ordering::AcqRel);

            let kind = event.kind();
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| self.apply(event))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(event = kind, panic = %reason, "Hub event handling panicked");
            }
        }

        info!(server = %self.server, "Hub event loop stopped");
    }

    /// Apply one event synchronously
    ///
    /// Presence store writes that follow from the event run on tracked tasks;
    /// see [`Hub::wait_presence_updates`].
    pub fn apply(self: &Arc<Self>, event: HubEvent) {
        match event {
            HubEvent::Register(conn) => self.register(conn),
            HubEvent::Login {
                user_key,
                previous,
                conn,
            } => {
                self.login(user_key.clone(), &conn, previous.as_ref());
                if let Some(previous) = previous.filter(|previous| previous != &user_key) {
                    self.spawn_release(previous, conn.id().clone());
                }
                if self.holds(&user_key, &conn) {
                    self.spawn_claim(user_key, conn);
                }
            }
            HubEvent::Unregister(conn) => {
                if let Some(user_key) = self.unregister(&conn) {
                    self.spawn_release(user_key, conn.id().clone());
                }
            }
        }
    }

    fn spawn_release(self: &Arc<Self>, user_key: UserKey, connection_id: ConnectionId) {
        let hub = Arc::clone(self);
        self.presence_tasks.spawn(async move {
            hub.release_presence(&user_key, &connection_id).await;
        });
    }

    fn spawn_claim(self: &Arc<Self>, user_key: UserKey, conn: Arc<Connection>) {
        let hub = Arc::clone(self);
        self.presence_tasks.spawn(async move {
            // A later login may have taken the key while this task was queued
            if hub.holds(&user_key, &conn) {
                hub.claim_presence(&user_key, &conn).await;
            }
        });
    }

    /// Wait until every presence update spawned so far has finished
    ///
    /// Used on shutdown so logged-out marks reach the store before the
    /// process exits. Updates spawned afterwards are still tracked.
    pub async fn wait_presence_updates(&self) {
        self.presence_tasks.close();
        self.presence_tasks.wait().await;
    }

    pub fn register(&self, conn: Arc<Connection>) {
        info!(connection_id = %conn.id(), addr = %conn.addr(), "Connection registered");
        self.connections.write().insert(conn.id().clone(), conn);
    }

    /// Map `user_key` to `conn`
    ///
    /// Ignored unless `conn` is registered. `previous` is the key `conn` held
    /// before; its mapping is dropped if it still points at `conn`. A
    /// different connection previously holding `user_key` is sent a
    /// `session.kicked` push and closed; it is returned so callers can
    /// observe the displacement.
    pub fn login(
        &self,
        user_key: UserKey,
        conn: &Arc<Connection>,
        previous: Option<&UserKey>,
    ) -> Option<Arc<Connection>> {
        if !self.connections.read().contains_key(conn.id()) {
            debug!(
                connection_id = %conn.id(),
                user_key = %user_key,
                "Ignoring login for unregistered connection"
            );
            return None;
        }

        let displaced = {
            let mut users = self.users.write();
            if let Some(previous) = previous.filter(|previous| **previous != user_key) {
                if users
                    .get(previous)
                    .is_some_and(|holder| Arc::ptr_eq(holder, conn))
                {
                    users.remove(previous);
                    debug!(
                        connection_id = %conn.id(),
                        user_key = %previous,
                        "Previous login released"
                    );
                }
            }
            users.insert(user_key.clone(), Arc::clone(conn))
        }
        .filter(|holder| !Arc::ptr_eq(holder, conn));

        info!(connection_id = %conn.id(), user_key = %user_key, "User logged in");

        if let Some(holder) = &displaced {
            warn!(
                connection_id = %holder.id(),
                user_key = %user_key,
                "Session displaced by a newer login"
            );
            notify_and_close(
                holder,
                SESSION_KICKED,
                json!({"user_key": user_key.to_string(), "reason": "logged in elsewhere"}),
            );
        }
        displaced
    }

    /// Whether `user_key` is currently mapped to exactly `conn`
    #[must_use]
    pub fn holds(&self, user_key: &UserKey, conn: &Arc<Connection>) -> bool {
        self.users
            .read()
            .get(user_key)
            .is_some_and(|holder| Arc::ptr_eq(holder, conn))
    }

    /// Remove `conn`; returns its user key if this call released the mapping
    pub fn unregister(&self, conn: &Arc<Connection>) -> Option<UserKey> {
        let was_registered = self.connections.write().remove(conn.id()).is_some();
        if !was_registered {
            debug!(connection_id = %conn.id(), "Unregister for unknown connection");
        }
        self.unsubscribe_all(conn);

        let user_key = conn.user_key()?;
        let mut users = self.users.write();
        match users.get(&user_key) {
            Some(holder) if Arc::ptr_eq(holder, conn) => {
                users.remove(&user_key);
                drop(users);
                info!(connection_id = %conn.id(), user_key = %user_key, "User logged out");
                Some(user_key)
            }
            _ => None,
        }
    }

    /// Mark the presence record logged out if it still names this connection
    pub async fn release_presence(&self, user_key: &UserKey, connection_id: &ConnectionId) {
        match presence::mark_logged_out(
            self.presence.as_ref(),
            user_key,
            &self.server,
            connection_id,
            Utc::now(),
        )
        .await
        {
            Ok(true) => debug!(user_key = %user_key, "Presence record marked logged out"),
            Ok(false) => {}
            Err(e) => warn!(
                user_key = %user_key,
                error = %e,
                "Failed to mark presence record logged out"
            ),
        }
    }

    /// Point the presence record for `user_key` at `conn` unless it already does
    pub async fn claim_presence(&self, user_key: &UserKey, conn: &Connection) {
        let now = Utc::now();
        let record = UserOnline::login(
            self.server.clone(),
            user_key,
            conn.id().clone(),
            conn.addr(),
            conn.login_time().unwrap_or(now),
        );
        match presence::claim_user_online(self.presence.as_ref(), record, now).await {
            Ok(true) => debug!(
                user_key = %user_key,
                connection_id = %conn.id(),
                "Presence record claimed"
            ),
            Ok(false) => {}
            Err(e) => warn!(
                user_key = %user_key,
                error = %e,
                "Failed to claim presence record"
            ),
        }
    }

    /// Queue `payload` on every authenticated connection except `exclude`,
    /// optionally restricted to one platform; returns how many accepted it
    pub fn broadcast(
        &self,
        payload: &Bytes,
        exclude: Option<&ConnectionId>,
        platform: Option<u32>,
    ) -> usize {
        let targets: Vec<Arc<Connection>> = self.users.read().values().cloned().collect();
        targets
            .iter()
            .filter(|conn| exclude != Some(conn.id()))
            .filter(|conn| platform.is_none() || conn.platform() == platform)
            .filter(|conn| conn.send(payload.clone()))
            .count()
    }

    /// Local unicast; `false` if the user is not attached here or the queue refused it
    pub fn send_to_user(&self, user_key: &UserKey, payload: Bytes) -> bool {
        self.user_connection(user_key)
            .is_some_and(|conn| conn.send(payload))
    }

    /// Push to `user_id` on every platform it is logged in on here
    pub fn push_to_user_all_platforms(&self, user_id: &UserId, cmd: &str, data: Value) -> usize {
        let Some(payload) = encode_push(cmd, data) else {
            return 0;
        };
        self.user_connections(user_id)
            .iter()
            .filter(|conn| conn.send(payload.clone()))
            .count()
    }

    /// Connections logged in as `user_id` on any platform
    #[must_use]
    pub fn user_connections(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.users
            .read()
            .iter()
            .filter(|(key, _)| &key.user_id == user_id)
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    #[must_use]
    pub fn user_connection(&self, user_key: &UserKey) -> Option<Arc<Connection>> {
        self.users.read().get(user_key).cloned()
    }

    #[must_use]
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Send a `session.kicked` notice to one connection and close it
    pub fn kick_connection(&self, connection_id: &ConnectionId, reason: &str) -> bool {
        let Some(conn) = self.connection(connection_id) else {
            return false;
        };
        info!(connection_id = %connection_id, reason, "Kicking connection");
        notify_and_close(&conn, SESSION_KICKED, json!({ "reason": reason }));
        true
    }

    /// Kick every local session of `user_id`, on all platforms
    pub fn kick_user(&self, user_id: &UserId, reason: &str) -> usize {
        let connections = self.user_connections(user_id);
        for conn in &connections {
            info!(connection_id = %conn.id(), user_id = %user_id, reason, "Kicking user session");
            notify_and_close(conn, SESSION_KICKED, json!({ "reason": reason }));
        }
        connections.len()
    }

    /// Subscribe `conn` to `topics`; returns the topics actually subscribed
    ///
    /// Empty and repeated names are skipped. Nothing is subscribed for a
    /// connection that is not registered.
    pub fn subscribe(&self, conn: &Arc<Connection>, topics: &[String]) -> Vec<String> {
        // Held until the index is updated so a concurrent unregister cannot
        // miss these subscriptions
        let connections = self.connections.read();
        if !connections.contains_key(conn.id()) {
            return Vec::new();
        }

        let mut index = self.topics.write();
        let mut subscribed: Vec<String> = Vec::with_capacity(topics.len());
        for topic in topics {
            if topic.is_empty() || subscribed.contains(topic) {
                continue;
            }
            index
                .entry(topic.clone())
                .or_default()
                .insert(conn.id().clone(), Arc::clone(conn));
            conn.add_topic(topic);
            subscribed.push(topic.clone());
        }
        drop(index);
        drop(connections);

        debug!(connection_id = %conn.id(), topics = ?subscribed, "Subscribed");
        subscribed
    }

    /// Remove `conn` from `topics`; returns the topics it was subscribed to
    pub fn unsubscribe(&self, conn: &Connection, topics: &[String]) -> Vec<String> {
        let mut index = self.topics.write();
        let mut removed = Vec::new();
        for topic in topics {
            if !conn.remove_topic(topic) {
                continue;
            }
            if let Some(subscribers) = index.get_mut(topic) {
                subscribers.remove(conn.id());
                if subscribers.is_empty() {
                    index.remove(topic);
                }
            }
            removed.push(topic.clone());
        }
        drop(index);

        debug!(connection_id = %conn.id(), topics = ?removed, "Unsubscribed");
        removed
    }

    fn unsubscribe_all(&self, conn: &Connection) {
        let topics = conn.take_topics();
        if topics.is_empty() {
            return;
        }
        let mut index = self.topics.write();
        for topic in &topics {
            if let Some(subscribers) = index.get_mut(topic) {
                subscribers.remove(conn.id());
                if subscribers.is_empty() {
                    index.remove(topic);
                }
            }
        }
    }

    /// Push to every subscriber of `topic`; returns how many accepted it
    pub fn push_to_topic(&self, topic: &str, cmd: &str, data: Value) -> usize {
        let subscribers: Vec<Arc<Connection>> = match self.topics.read().get(topic) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => return 0,
        };
        let Some(payload) = encode_push(cmd, data) else {
            return 0;
        };
        subscribers
            .iter()
            .filter(|conn| conn.send(payload.clone()))
            .count()
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    #[must_use]
    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, HashMap::len)
    }

    /// User ids logged in here on `platform`, sorted
    #[must_use]
    pub fn user_list(&self, platform: u32) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .users
            .read()
            .keys()
            .filter(|key| key.platform == platform)
            .map(|key| key.user_id.clone())
            .collect();
        users.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        users
    }

    /// Find the instance holding `user_key`
    ///
    /// A record naming this instance without a local mapping, a logged-out or
    /// timed-out record, and a record naming a dead instance all mean offline.
    pub async fn locate(
        &self,
        user_key: &UserKey,
        now: DateTime<Utc>,
    ) -> linkhub_cluster::Result<Location> {
        if let Some(conn) = self.user_connection(user_key) {
            return Ok(Location::Local(conn));
        }

        let Some(record) = self.presence.get_user_online(user_key).await? else {
            return Ok(Location::Offline);
        };
        if !record.is_online(now, self.user_online_timeout) || record.server == self.server {
            return Ok(Location::Offline);
        }

        let live = self.presence.list_live_servers(now, self.stale_after).await?;
        if live.iter().any(|instance| instance.addr == record.server) {
            Ok(Location::Remote(record.server))
        } else {
            Ok(Location::Offline)
        }
    }

    #[must_use]
    pub fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.read().contains_key(connection_id)
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let mut platforms = BTreeMap::new();
        for key in self.users.read().keys() {
            *platforms.entry(key.platform).or_insert(0) += 1;
        }
        let (connections, anonymous) = {
            let connections = self.connections.read();
            let anonymous = connections
                .values()
                .filter(|conn| !conn.is_authenticated())
                .count();
            (connections.len(), anonymous)
        };
        HubStats {
            server: self.server.to_string(),
            connections,
            users: platforms.values().sum(),
            anonymous,
            topics: self.topic_count(),
            pending_events: self.pending.load(Ordering::Acquire),
            platforms,
        }
    }

    /// Close every live connection; their reader tasks unregister them
    pub fn shutdown(&self) {
        let connections = self.connections_snapshot();
        info!(count = connections.len(), "Closing all connections");
        for conn in connections {
            conn.close();
        }
    }
}

fn encode_push(cmd: &str, data: Value) -> Option<Bytes> {
    match Response::push(cmd, data).encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(cmd, error = %e, "Failed to encode push");
            None
        }
    }
}

/// Queue a server push on `conn`, then close it
///
/// The writer flushes queued frames before the close frame, so the notice
/// is delivered unless the queue was already full.
pub(crate) fn notify_and_close(conn: &Connection, cmd: &str, data: Value) {
    if let Some(payload) = encode_push(cmd, data) {
        conn.send(payload);
    }
    conn.close();
}
