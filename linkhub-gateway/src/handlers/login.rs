use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use linkhub_cluster::presence::UserOnline;
use linkhub_core::auth::IdentityVerifier;
use linkhub_core::config::PlatformsConfig;
use linkhub_core::models::UserKey;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::hub::{Hub, HubEvent};
use crate::protocol::StatusCode;
use crate::router::{CommandHandler, Reply};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    #[serde(default)]
    service_token: String,
    #[serde(default)]
    app_id: u32,
    #[serde(default)]
    user_id: Option<String>,
}

/// `login`: exchanges a service token for an authenticated session
pub struct LoginHandler {
    hub: Arc<Hub>,
    verifier: Arc<dyn IdentityVerifier>,
    platforms: PlatformsConfig,
}

impl LoginHandler {
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        verifier: Arc<dyn IdentityVerifier>,
        platforms: PlatformsConfig,
    ) -> Self {
        Self {
            hub,
            verifier,
            platforms,
        }
    }
}

#[async_trait]
impl CommandHandler for LoginHandler {
    async fn handle(&self, conn: &Arc<Connection>, seq: &str, data: &Value) -> Reply {
        let request = match LoginRequest::deserialize(data) {
            Ok(request) => request,
            Err(e) => {
                return Reply::error(StatusCode::ParameterIllegal).with_message(e.to_string());
            }
        };
        if request.service_token.is_empty() {
            return Reply::error(StatusCode::ParameterIllegal).with_message("serviceToken is required");
        }
        let Some(platform) = self.platforms.resolve(request.app_id) else {
            return Reply::error(StatusCode::ParameterIllegal)
                .with_message(format!("Unsupported appId {}", request.app_id));
        };

        let identity = match self.verifier.verify(&request.service_token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(connection_id = %conn.id(), seq, error = %e, "Login token rejected");
                return Reply::error(StatusCode::UnauthorizedUserId);
            }
        };
        if let Some(claimed) = request.user_id.as_deref().filter(|id| !id.is_empty()) {
            if claimed != identity.user_id.as_str() {
                warn!(
                    connection_id = %conn.id(),
                    claimed,
                    subject = %identity.user_id,
                    "Login userId does not match token subject"
                );
                return Reply::error(StatusCode::UnauthorizedUserId);
            }
        }

        let user_key = UserKey::new(platform, identity.user_id.clone());
        let now = Utc::now();
        let record = UserOnline::login(
            self.hub.server().clone(),
            &user_key,
            conn.id().clone(),
            conn.addr(),
            now,
        );
        if let Err(e) = self.hub.presence().set_user_online(&record).await {
            warn!(
                connection_id = %conn.id(),
                user_key = %user_key,
                error = %e,
                "Failed to write presence record"
            );
            return Reply::error(StatusCode::ServerError);
        }

        let expires_at = DateTime::from_timestamp(identity.expires_at, 0);
        let previous = conn.login_until(user_key.clone(), now, expires_at);
        self.hub.submit(HubEvent::Login {
            user_key: user_key.clone(),
            previous,
            conn: Arc::clone(conn),
        });

        info!(connection_id = %conn.id(), user_key = %user_key, "Login accepted");
        Reply::ok(json!({ "userId": identity.user_id, "appId": platform }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use linkhub_cluster::presence::{MemoryPresenceStore, PresenceStore, ServerInstance};
    use linkhub_core::auth::JwtService;
    use linkhub_core::config::PresenceConfig;
    use linkhub_core::models::{ServerAddr, UserId};
    use std::time::Duration;

    const SECRET: &[u8] = b"login-handler-test-secret";

    struct BrokenStore;

    #[async_trait]
    impl PresenceStore for BrokenStore {
        async fn set_server_heartbeat(
            &self,
            _: &ServerAddr,
            _: DateTime<Utc>,
        ) -> linkhub_cluster::Result<()> {
            Ok(())
        }
        async fn remove_server(&self, _: &ServerAddr) -> linkhub_cluster::Result<()> {
            Ok(())
        }
        async fn list_live_servers(
            &self,
            _: DateTime<Utc>,
            _: Duration,
        ) -> linkhub_cluster::Result<Vec<ServerInstance>> {
            Ok(Vec::new())
        }
        async fn get_user_online(
            &self,
            _: &UserKey,
        ) -> linkhub_cluster::Result<Option<UserOnline>> {
            Ok(None)
        }
        async fn set_user_online(&self, _: &UserOnline) -> linkhub_cluster::Result<()> {
            Err(linkhub_cluster::Error::Timeout("Redis SETEX timed out".to_string()))
        }
        async fn delete_user_online(&self, _: &UserKey) -> linkhub_cluster::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<MemoryPresenceStore>,
        jwt: JwtService,
        handler: LoginHandler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPresenceStore::new());
        let hub = Arc::new(Hub::new(
            ServerAddr::new("10.0.0.1", 8089),
            store.clone(),
            &PresenceConfig::default(),
        ));
        let jwt = JwtService::new(SECRET, 0).unwrap();
        let handler = LoginHandler::new(
            hub.clone(),
            Arc::new(jwt.clone()),
            PlatformsConfig::default(),
        );
        Fixture {
            hub,
            store,
            jwt,
            handler,
        }
    }

    fn token(jwt: &JwtService, user: &str) -> String {
        jwt.sign_token(&UserId::from(user), chrono::Duration::minutes(5))
            .unwrap()
    }

    fn new_conn() -> Arc<Connection> {
        Arc::new(Connection::new("192.168.1.9:51000", 8, Utc::now()).0)
    }

    #[tokio::test]
    async fn test_login_success() {
        let f = fixture();
        let conn = new_conn();
        let data = json!({"serviceToken": token(&f.jwt, "alice"), "appId": 102, "userId": "alice"});

        let reply = f.handler.handle(&conn, "1", &data).await;
        assert_eq!(reply.code, StatusCode::Ok);
        assert_eq!(reply.data, json!({"userId": "alice", "appId": 102}));

        let key = UserKey::new(102, "alice");
        assert_eq!(conn.user_key(), Some(key.clone()));

        let record = f.store.get_user_online(&key).await.unwrap().unwrap();
        assert_eq!(record.connection_id, *conn.id());
        assert_eq!(record.client_addr, "192.168.1.9:51000");
        assert_eq!(f.hub.stats().pending_events, 1);

        // Token expiry is carried onto the connection for the sweep task
        let expires_at = conn.token_expires_at().unwrap();
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(4));
        assert!(expires_at <= Utc::now() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_app_id_zero_uses_default_platform() {
        let f = fixture();
        let conn = new_conn();
        let data = json!({"serviceToken": token(&f.jwt, "bob")});
        let reply = f.handler.handle(&conn, "1", &data).await;
        assert_eq!(reply.code, StatusCode::Ok);
        assert_eq!(conn.platform(), Some(101));
    }

    #[tokio::test]
    async fn test_missing_token_is_parameter_illegal() {
        let f = fixture();
        let conn = new_conn();
        let reply = f.handler.handle(&conn, "1", &json!({"appId": 101})).await;
        assert_eq!(reply.code, StatusCode::ParameterIllegal);
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_wrong_field_type_is_parameter_illegal() {
        let f = fixture();
        let conn = new_conn();
        let reply = f
            .handler
            .handle(&conn, "1", &json!({"serviceToken": 7, "appId": "x"}))
            .await;
        assert_eq!(reply.code, StatusCode::ParameterIllegal);
    }

    #[tokio::test]
    async fn test_unknown_platform_is_parameter_illegal() {
        let f = fixture();
        let conn = new_conn();
        let data = json!({"serviceToken": token(&f.jwt, "alice"), "appId": 999});
        let reply = f.handler.handle(&conn, "1", &data).await;
        assert_eq!(reply.code, StatusCode::ParameterIllegal);
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_invalid_token_leaves_connection_anonymous() {
        let f = fixture();
        let conn = new_conn();
        let other = JwtService::new(b"some-other-secret", 0).unwrap();
        let data = json!({"serviceToken": token(&other, "alice"), "appId": 101});
        let reply = f.handler.handle(&conn, "1", &data).await;
        assert_eq!(reply.code, StatusCode::UnauthorizedUserId);
        assert!(!conn.is_authenticated());
        assert_eq!(f.hub.stats().pending_events, 0);
    }

    #[tokio::test]
    async fn test_user_id_mismatch_rejected() {
        let f = fixture();
        let conn = new_conn();
        let data = json!({"serviceToken": token(&f.jwt, "alice"), "appId": 101, "userId": "mallory"});
        let reply = f.handler.handle(&conn, "1", &data).await;
        assert_eq!(reply.code, StatusCode::UnauthorizedUserId);
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_store_failure_is_server_error() {
        let hub = Arc::new(Hub::new(
            ServerAddr::new("10.0.0.1", 8089),
            Arc::new(BrokenStore),
            &PresenceConfig::default(),
        ));
        let jwt = JwtService::new(SECRET, 0).unwrap();
        let handler = LoginHandler::new(hub, Arc::new(jwt.clone()), PlatformsConfig::default());
        let conn = new_conn();
        let data = json!({"serviceToken": token(&jwt, "alice"), "appId": 101});
        let reply = handler.handle(&conn, "1", &data).await;
        assert_eq!(reply.code, StatusCode::ServerError);
        assert!(!conn.is_authenticated());
    }
}
