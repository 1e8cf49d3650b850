use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use linkhub_cluster::presence;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::hub::Hub;
use crate::router::{CommandHandler, Reply};

/// `heartbeat`: keeps the connection and its presence record fresh
pub struct HeartbeatHandler {
    hub: Arc<Hub>,
}

impl HeartbeatHandler {
    #[must_use]
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl CommandHandler for HeartbeatHandler {
    async fn handle(&self, conn: &Arc<Connection>, _seq: &str, _data: &Value) -> Reply {
        let now = Utc::now();
        conn.heartbeat(now);

        if let Some(user_key) = conn.user_key() {
            match presence::refresh_user_heartbeat(
                self.hub.presence().as_ref(),
                &user_key,
                self.hub.server(),
                conn.id(),
                now,
            )
            .await
            {
                Ok(true) => {}
                // The record names another connection or is gone, but this
                // one owns the key locally: put the record back
                Ok(false) if self.hub.holds(&user_key, conn) => {
                    debug!(
                        connection_id = %conn.id(),
                        user_key = %user_key,
                        "Presence record out of date, reclaiming"
                    );
                    self.hub.claim_presence(&user_key, conn).await;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    connection_id = %conn.id(),
                    user_key = %user_key,
                    error = %e,
                    "Failed to refresh presence heartbeat"
                ),
            }
        }

        Reply::ok(json!({ "server_time": now.timestamp() }))
    }
}
