//! WebSocket transport for one connection
//!
//! The upgrade handler creates a [`Connection`], registers it with the hub and
//! runs a reader loop in the upgrade task. A spawned writer drains the
//! outbound queue and owns the ping timer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use linkhub_core::config::WebSocketConfig;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::hub::HubEvent;
use crate::router::Router;
use crate::server::AppState;

/// `GET /ws`
pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.websocket.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (conn, outbound) = Connection::new(
        peer.to_string(),
        state.websocket.send_queue_size,
        Utc::now(),
    );
    let conn = Arc::new(conn.with_command_limiter(state.router.new_limiter()));
    info!(connection_id = %conn.id(), addr = %peer, "WebSocket connection established");

    state.hub.submit(HubEvent::Register(Arc::clone(&conn)));

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        conn.close_token(),
        Arc::clone(&state.websocket),
        conn.id().to_string(),
    ));

    read_loop(stream, &conn, &state.router, &state.websocket).await;

    conn.close();
    state.hub.submit(HubEvent::Unregister(Arc::clone(&conn)));
    if let Err(e) = writer.await {
        warn!(connection_id = %conn.id(), error = %e, "WebSocket writer task failed");
    }

    info!(connection_id = %conn.id(), addr = %peer, "WebSocket connection closed");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    conn: &Arc<Connection>,
    router: &Router,
    config: &WebSocketConfig,
) {
    let close_token = conn.close_token();
    loop {
        let next = tokio::select! {
            biased;
            () = close_token.cancelled() => break,
            next = timeout(config.pong_wait(), stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(connection_id = %conn.id(), "Read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %conn.id(), error = %e, "WebSocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let response = match message {
            Message::Text(text) => router.dispatch(conn, text.as_str().as_bytes()).await,
            Message::Binary(bytes) => router.dispatch(conn, &bytes).await,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        match response.encode() {
            Ok(bytes) => {
                conn.send(bytes);
            }
            Err(e) => warn!(connection_id = %conn.id(), error = %e, "Failed to encode response"),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    close_token: CancellationToken,
    config: Arc<WebSocketConfig>,
    connection_id: String,
) {
    let write_wait = config.write_wait();
    let mut ping = interval_at(Instant::now() + config.ping_period(), config.ping_period());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = close_token.cancelled() => {
                // Flush what is already queued, e.g. a kick notice
                while let Ok(bytes) = outbound.try_recv() {
                    if !send_frame(&mut sink, frame(bytes), write_wait).await {
                        break;
                    }
                }
                let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                break;
            }
            queued = outbound.recv() => {
                let Some(bytes) = queued else { break };
                if !send_frame(&mut sink, frame(bytes), write_wait).await {
                    debug!(connection_id = %connection_id, "WebSocket write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if !send_frame(&mut sink, Message::Ping(Bytes::new()), write_wait).await {
                    debug!(connection_id = %connection_id, "WebSocket ping failed");
                    break;
                }
            }
        }
    }

    // A failed write must also stop the reader
    close_token.cancel();
}

fn frame(bytes: Bytes) -> Message {
    match std::str::from_utf8(&bytes) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(bytes),
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_wait: std::time::Duration,
) -> bool {
    matches!(timeout(write_wait, sink.send(message)).await, Ok(Ok(())))
}

