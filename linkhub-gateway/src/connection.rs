use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use linkhub_core::models::{ConnectionId, UserKey};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::throttle::CommandLimiter;

/// Authenticated identity of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginState {
    pub user_key: UserKey,
    pub login_time: DateTime<Utc>,
    /// Expiry of the service token presented at login
    pub expires_at: Option<DateTime<Utc>>,
}

/// One live transport session
///
/// Shared as `Arc<Connection>` between its reader task, the hub and command
/// handlers. The writer task owns the receiving half of the outbound queue.
pub struct Connection {
    id: ConnectionId,
    addr: String,
    first_seen: DateTime<Utc>,
    /// Unix millis, only ever raised
    last_heartbeat: AtomicI64,
    login: RwLock<Option<LoginState>>,
    /// Topics this connection is subscribed to; the hub owns the reverse index
    topics: Mutex<BTreeSet<String>>,
    sender: mpsc::Sender<Bytes>,
    close_token: CancellationToken,
    command_limiter: Option<CommandLimiter>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("login", &*self.login.read())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create an anonymous connection and the receiving half of its outbound queue
    #[must_use]
    pub fn new(
        addr: impl Into<String>,
        queue_size: usize,
        now: DateTime<Utc>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let conn = Self {
            id: ConnectionId::new(),
            addr: addr.into(),
            first_seen: now,
            last_heartbeat: AtomicI64::new(now.timestamp_millis()),
            login: RwLock::new(None),
            topics: Mutex::new(BTreeSet::new()),
            sender,
            close_token: CancellationToken::new(),
            command_limiter: None,
        };
        (conn, receiver)
    }

    #[must_use]
    pub fn with_command_limiter(mut self, limiter: Option<CommandLimiter>) -> Self {
        self.command_limiter = limiter;
        self
    }

    #[must_use]
    pub const fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[must_use]
    pub const fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    #[must_use]
    pub fn command_limiter(&self) -> Option<&CommandLimiter> {
        self.command_limiter.as_ref()
    }

    /// Enqueue an outbound frame without waiting
    ///
    /// Returns whether the frame was queued. A full queue drops the frame
    /// with a warning; a closing connection drops it silently.
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        if self.is_closed() {
            debug!(connection_id = %self.id, "Dropping message for closing connection");
            return false;
        }
        match self.sender.try_send(payload.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.id,
                    addr = %self.addr,
                    "Outbound queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "Dropping message for closed connection");
                false
            }
        }
    }

    /// Authenticate as `user_key`, returning the previous identity if there was one
    pub fn login(&self, user_key: UserKey, now: DateTime<Utc>) -> Option<UserKey> {
        self.login_until(user_key, now, None)
    }

    /// [`Connection::login`] with a token expiry enforced by the sweep task
    pub fn login_until(
        &self,
        user_key: UserKey,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Option<UserKey> {
        let previous = self.login.write().replace(LoginState {
            user_key,
            login_time: now,
            expires_at,
        });
        self.heartbeat(now);
        previous.map(|state| state.user_key)
    }

    pub fn heartbeat(&self, now: DateTime<Utc>) {
        self.last_heartbeat
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_heartbeat.load(Ordering::Acquire))
            .unwrap_or(self.first_seen)
    }

    /// `now - last_heartbeat >= threshold`
    #[must_use]
    pub fn is_heartbeat_timeout(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = now
            .timestamp_millis()
            .saturating_sub(self.last_heartbeat.load(Ordering::Acquire));
        elapsed_ms >= threshold_ms
    }

    #[must_use]
    pub fn login_state(&self) -> Option<LoginState> {
        self.login.read().clone()
    }

    #[must_use]
    pub fn user_key(&self) -> Option<UserKey> {
        self.login.read().as_ref().map(|state| state.user_key.clone())
    }

    #[must_use]
    pub fn platform(&self) -> Option<u32> {
        self.login.read().as_ref().map(|state| state.user_key.platform)
    }

    #[must_use]
    pub fn login_time(&self) -> Option<DateTime<Utc>> {
        self.login.read().as_ref().map(|state| state.login_time)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.login.read().is_some()
    }

    #[must_use]
    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.login.read().as_ref().and_then(|state| state.expires_at)
    }

    /// Authenticated with a token whose expiry is at or before `now`
    #[must_use]
    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at().is_some_and(|expires_at| expires_at <= now)
    }

    /// Subscribed topics, sorted
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    pub(crate) fn add_topic(&self, topic: &str) -> bool {
        self.topics.lock().insert(topic.to_string())
    }

    pub(crate) fn remove_topic(&self, topic: &str) -> bool {
        self.topics.lock().remove(topic)
    }

    pub(crate) fn take_topics(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.topics.lock())
    }

    /// Signal the reader and writer tasks to shut down. Idempotent.
    pub fn close(&self) {
        if !self.close_token.is_cancelled() {
            debug!(connection_id = %self.id, "Closing connection");
        }
        self.close_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Token cancelled once the connection starts closing
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_new_connection_is_anonymous() {
        let now = Utc::now();
        let (conn, _rx) = Connection::new("127.0.0.1:5000", 8, now);
        assert!(!conn.is_authenticated());
        assert_eq!(conn.user_key(), None);
        assert_eq!(conn.addr(), "127.0.0.1:5000");
        assert_eq!(conn.first_seen(), now);
        assert_eq!(
            conn.last_heartbeat().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_login_sets_state_and_refreshes_heartbeat() {
        let now = Utc::now();
        let (conn, _rx) = Connection::new("peer", 8, now);
        let later = now + secs(5);
        let previous = conn.login(UserKey::new(101, "alice"), later);
        assert_eq!(previous, None);
        assert!(conn.is_authenticated());
        assert_eq!(conn.platform(), Some(101));
        assert_eq!(conn.login_time(), Some(later));
        assert_eq!(
            conn.last_heartbeat().timestamp_millis(),
            later.timestamp_millis()
        );

        let previous = conn.login(UserKey::new(102, "alice"), later);
        assert_eq!(previous, Some(UserKey::new(101, "alice")));
    }

    #[test]
    fn test_token_expiry() {
        let now = Utc::now();
        let (conn, _rx) = Connection::new("peer", 8, now);
        assert!(!conn.is_token_expired(now));

        conn.login(UserKey::new(101, "alice"), now);
        assert_eq!(conn.token_expires_at(), None);
        assert!(!conn.is_token_expired(now + secs(86_400)));

        conn.login_until(UserKey::new(101, "alice"), now, Some(now + secs(60)));
        assert!(!conn.is_token_expired(now + secs(59)));
        assert!(conn.is_token_expired(now + secs(60)));
    }

    #[test]
    fn test_topic_set() {
        let (conn, _rx) = Connection::new("peer", 8, Utc::now());
        assert!(conn.add_topic("room.2"));
        assert!(conn.add_topic("room.1"));
        assert!(!conn.add_topic("room.1"));
        assert_eq!(conn.topics(), ["room.1", "room.2"]);

        assert!(conn.remove_topic("room.2"));
        assert!(!conn.remove_topic("room.2"));
        assert_eq!(conn.take_topics().len(), 1);
        assert!(conn.topics().is_empty());
    }

    #[test]
    fn test_heartbeat_is_monotonic() {
        let now = Utc::now();
        let (conn, _rx) = Connection::new("peer", 8, now);
        conn.heartbeat(now + secs(10));
        conn.heartbeat(now + secs(3));
        assert_eq!(
            conn.last_heartbeat().timestamp_millis(),
            (now + secs(10)).timestamp_millis()
        );
    }

    #[test]
    fn test_heartbeat_timeout_boundary_is_inclusive() {
        let now = Utc::now();
        let (conn, _rx) = Connection::new("peer", 8, now);
        let threshold = Duration::from_secs(90);
        assert!(!conn.is_heartbeat_timeout(now + secs(89), threshold));
        assert!(conn.is_heartbeat_timeout(now + secs(90), threshold));
        assert!(conn.is_heartbeat_timeout(now + secs(91), threshold));
    }

    #[test]
    fn test_send_queues_until_full() {
        let (conn, mut rx) = Connection::new("peer", 2, Utc::now());
        assert!(conn.send("a"));
        assert!(conn.send("b"));
        assert!(!conn.send("c"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from("a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from("b"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_close_is_swallowed() {
        let (conn, mut rx) = Connection::new("peer", 2, Utc::now());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.send("late"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (conn, rx) = Connection::new("peer", 2, Utc::now());
        drop(rx);
        assert!(!conn.send("late"));
    }
}
