//! End-to-end tests against a real listener with a WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use linkhub_cluster::presence::{MemoryPresenceStore, PresenceStore};
use linkhub_core::auth::JwtService;
use linkhub_core::config::{PlatformsConfig, PresenceConfig, RateLimitConfig, WebSocketConfig};
use linkhub_core::models::{ServerAddr, UserId, UserKey};
use linkhub_gateway::handlers::default_router;
use linkhub_gateway::{serve, AppState, ConnectionSweeper, Hub, SweepPolicy};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    addr: std::net::SocketAddr,
    hub: Arc<Hub>,
    store: Arc<MemoryPresenceStore>,
    jwt: JwtService,
    cancel: CancellationToken,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn token(&self, user: &str) -> String {
        self.jwt
            .sign_token(&UserId::from(user), chrono::Duration::minutes(5))
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Boot a server on an ephemeral port
async fn boot_server() -> TestServer {
    boot_server_with(WebSocketConfig::default()).await
}

async fn boot_server_with(websocket: WebSocketConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = Arc::new(MemoryPresenceStore::new());
    let hub = Arc::new(Hub::new(
        ServerAddr::new(addr.ip().to_string(), addr.port()),
        store.clone(),
        &PresenceConfig::default(),
    ));
    let jwt = JwtService::new(b"integration-test-secret", 0).unwrap();
    let router = default_router(
        &hub,
        Arc::new(jwt.clone()),
        PlatformsConfig::default(),
        &RateLimitConfig::default(),
    );
    let state = AppState::new(hub.clone(), router, websocket);

    let cancel = CancellationToken::new();
    hub.start(cancel.clone());
    tokio::spawn(serve(listener, state, cancel.clone()));

    TestServer {
        addr,
        hub,
        store,
        jwt,
        cancel,
    }
}

async fn connect(server: &TestServer) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(server.ws_url()))
        .await
        .unwrap()
        .unwrap();
    ws
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let message = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn request(ws: &mut WsStream, seq: &str, cmd: &str, data: Value) -> Value {
    let frame = json!({"seq": seq, "cmd": cmd, "data": data}).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
    next_json(ws).await
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Wait for the server to end the socket, by close frame or by dropping it
async fn expect_closed(ws: &mut WsStream) {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("socket stayed open") {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => {}
        }
    }
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_heartbeat_round_trip() {
    let server = boot_server().await;
    let mut ws = connect(&server).await;

    let response = request(&mut ws, "42", "heartbeat", json!({})).await;
    assert_eq!(response["seq"], "42");
    assert_eq!(response["cmd"], "heartbeat");
    assert_eq!(response["response"]["code"], 200);
    assert_eq!(response["response"]["message"], "Success");
    assert!(response["response"]["data"]["server_time"].is_i64());

    eventually(|| server.hub.connection_count() == 1).await;
}

#[tokio::test]
async fn test_unknown_and_malformed_requests_keep_connection_open() {
    let server = boot_server().await;
    let mut ws = connect(&server).await;

    let response = request(&mut ws, "1", "does.not.exist", json!({})).await;
    assert_eq!(response["seq"], "1");
    assert_eq!(response["response"]["code"], 1010);

    ws.send(Message::Text(r#"{"seq":"2","cmd":42}"#.into()))
        .await
        .unwrap();
    let response = next_json(&mut ws).await;
    assert_eq!(response["seq"], "2");
    assert_eq!(response["response"]["code"], 1001);

    let response = request(&mut ws, "3", "heartbeat", json!({})).await;
    assert_eq!(response["response"]["code"], 200);
}

#[tokio::test]
async fn test_login_registers_user_and_presence() {
    let server = boot_server().await;
    let mut ws = connect(&server).await;

    let response = request(
        &mut ws,
        "1",
        "login",
        json!({"serviceToken": server.token("alice"), "appId": 101}),
    )
    .await;
    assert_eq!(response["response"]["code"], 200);
    assert_eq!(response["response"]["data"]["userId"], "alice");

    let key = UserKey::new(101, "alice");
    eventually(|| server.hub.user_connection(&key).is_some()).await;

    let record = server.store.get_user_online(&key).await.unwrap().unwrap();
    let conn = server.hub.user_connection(&key).unwrap();
    assert_eq!(record.connection_id, *conn.id());
    assert!(!record.is_logoff);
}

#[tokio::test]
async fn test_bad_token_is_rejected_and_connection_survives() {
    let server = boot_server().await;
    let mut ws = connect(&server).await;

    let response = request(
        &mut ws,
        "1",
        "login",
        json!({"serviceToken": "not-a-jwt", "appId": 101}),
    )
    .await;
    assert_eq!(response["response"]["code"], 1002);

    let response = request(&mut ws, "2", "heartbeat", json!({})).await;
    assert_eq!(response["response"]["code"], 200);
    assert_eq!(server.hub.user_count(), 0);
}

#[tokio::test]
async fn test_second_login_kicks_first_connection() {
    let server = boot_server().await;
    let key = UserKey::new(101, "alice");

    let mut first = connect(&server).await;
    let response = request(
        &mut first,
        "1",
        "login",
        json!({"serviceToken": server.token("alice"), "appId": 101}),
    )
    .await;
    assert_eq!(response["response"]["code"], 200);
    eventually(|| server.hub.user_connection(&key).is_some()).await;
    let first_id = server.hub.user_connection(&key).unwrap().id().clone();

    let mut second = connect(&server).await;
    let response = request(
        &mut second,
        "1",
        "login",
        json!({"serviceToken": server.token("alice"), "appId": 101}),
    )
    .await;
    assert_eq!(response["response"]["code"], 200);

    let notice = next_json(&mut first).await;
    assert_eq!(notice["cmd"], "session.kicked");
    assert_eq!(notice["seq"], "");

    eventually(|| {
        server
            .hub
            .user_connection(&key)
            .is_some_and(|conn| *conn.id() != first_id)
    })
    .await;
    eventually(|| server.hub.connection_count() == 1).await;

    // The newer session is still served
    let response = request(&mut second, "2", "heartbeat", json!({})).await;
    assert_eq!(response["response"]["code"], 200);
}

#[tokio::test]
async fn test_disconnect_unregisters_and_marks_logged_out() {
    let server = boot_server().await;
    let key = UserKey::new(102, "bob");

    let mut ws = connect(&server).await;
    let response = request(
        &mut ws,
        "1",
        "login",
        json!({"serviceToken": server.token("bob"), "appId": 102}),
    )
    .await;
    assert_eq!(response["response"]["code"], 200);
    eventually(|| server.hub.user_connection(&key).is_some()).await;

    ws.close(None).await.unwrap();
    drop(ws);

    eventually(|| server.hub.connection_count() == 0).await;
    assert!(server.hub.user_connection(&key).is_none());

    for _ in 0..400 {
        let record = server.store.get_user_online(&key).await.unwrap().unwrap();
        if record.is_logoff {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("presence record never marked logged out");
}

#[tokio::test]
async fn test_healthz_and_stats() {
    let server = boot_server().await;
    let _ws = connect(&server).await;
    eventually(|| server.hub.connection_count() == 1).await;

    let health = http_get(server.addr, "/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#"{"status":"ok"}"#));

    let stats = http_get(server.addr, "/stats").await;
    assert!(stats.starts_with("HTTP/1.1 200"));
    assert!(stats.contains(r#""connections":1"#));
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let server = boot_server_with(WebSocketConfig {
        max_message_size: 64,
        ..WebSocketConfig::default()
    })
    .await;
    let mut ws = connect(&server).await;
    eventually(|| server.hub.connection_count() == 1).await;

    let padding = "x".repeat(1024);
    let frame = json!({"seq": "1", "cmd": "heartbeat", "data": {"padding": padding}});
    // The server may already be gone by the time the send completes
    let _ = ws.send(Message::Text(frame.to_string().into())).await;

    expect_closed(&mut ws).await;
    eventually(|| server.hub.connection_count() == 0).await;
}

#[tokio::test]
async fn test_silent_client_hits_read_deadline() {
    let server = boot_server_with(WebSocketConfig {
        pong_wait_seconds: 1,
        ping_period_seconds: 60,
        ..WebSocketConfig::default()
    })
    .await;
    let mut ws = connect(&server).await;
    eventually(|| server.hub.connection_count() == 1).await;

    expect_closed(&mut ws).await;
    eventually(|| server.hub.connection_count() == 0).await;
}

#[tokio::test]
async fn test_sweeper_closes_and_unregisters_idle_connection() {
    let server = boot_server().await;
    let _sweeper = ConnectionSweeper::new(
        server.hub.clone(),
        Duration::from_millis(50),
        SweepPolicy {
            heartbeat_timeout: Duration::from_millis(300),
            anonymous_timeout: None,
        },
    )
    .start(server.cancel.clone());

    let mut ws = connect(&server).await;
    eventually(|| server.hub.connection_count() == 1).await;

    expect_closed(&mut ws).await;
    eventually(|| server.hub.connection_count() == 0).await;
}

#[tokio::test]
async fn test_topic_push_reaches_subscribers() {
    let server = boot_server().await;
    let mut ws = connect(&server).await;

    let response = request(
        &mut ws,
        "1",
        "login",
        json!({"serviceToken": server.token("alice"), "appId": 101}),
    )
    .await;
    assert_eq!(response["response"]["code"], 200);
    let key = UserKey::new(101, "alice");
    eventually(|| server.hub.user_connection(&key).is_some()).await;

    let response = request(&mut ws, "2", "subscribe", json!({"topics": ["room.7"]})).await;
    assert_eq!(response["response"]["code"], 200);
    assert_eq!(response["response"]["data"]["subscribed"], json!(["room.7"]));

    assert_eq!(server.hub.push_to_topic("room.7", "room.message", json!({"text": "hi"})), 1);
    let push = next_json(&mut ws).await;
    assert_eq!(push["cmd"], "room.message");
    assert_eq!(push["response"]["data"]["text"], "hi");

    ws.close(None).await.unwrap();
    drop(ws);
    eventually(|| server.hub.connection_count() == 0).await;
    assert_eq!(server.hub.topic_count(), 0);
}
