use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::connection::Connection;
use crate::hub::Hub;
use crate::protocol::StatusCode;
use crate::router::{CommandHandler, Reply};

#[derive(Debug, Deserialize)]
struct TopicsRequest {
    #[serde(default)]
    topics: Vec<String>,
}

/// Shared checks: logged in, and a non-empty topic list
fn parse_topics(conn: &Connection, data: &Value) -> Result<Vec<String>, Reply> {
    if !conn.is_authenticated() {
        return Err(Reply::error(StatusCode::NotLoggedIn));
    }
    let request = TopicsRequest::deserialize(data)
        .map_err(|e| Reply::error(StatusCode::ParameterIllegal).with_message(e.to_string()))?;
    if request.topics.iter().all(String::is_empty) {
        return Err(Reply::error(StatusCode::ParameterIllegal).with_message("topics is required"));
    }
    Ok(request.topics)
}

/// `subscribe`: `{topics: [..]}` → `{subscribed: [..]}`
pub struct SubscribeHandler {
    hub: Arc<Hub>,
}

impl SubscribeHandler {
    #[must_use]
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl CommandHandler for SubscribeHandler {
    async fn handle(&self, conn: &Arc<Connection>, _seq: &str, data: &Value) -> Reply {
        let topics = match parse_topics(conn, data) {
            Ok(topics) => topics,
            Err(reply) => return reply,
        };
        let subscribed = self.hub.subscribe(conn, &topics);
        Reply::ok(json!({ "subscribed": subscribed }))
    }
}

/// `unsubscribe`: `{topics: [..]}` → `{unsubscribed: [..]}`
pub struct UnsubscribeHandler {
    hub: Arc<Hub>,
}

impl UnsubscribeHandler {
    #[must_use]
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl CommandHandler for UnsubscribeHandler {
    async fn handle(&self, conn: &Arc<Connection>, _seq: &str, data: &Value) -> Reply {
        let topics = match parse_topics(conn, data) {
            Ok(topics) => topics,
            Err(reply) => return reply,
        };
        let unsubscribed = self.hub.unsubscribe(conn, &topics);
        Reply::ok(json!({ "unsubscribed": unsubscribed }))
    }
}
