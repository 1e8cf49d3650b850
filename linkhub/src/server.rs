//! Server lifecycle management
//!
//! Wires the presence store, hub, command router and maintenance tasks
//! together, serves HTTP until a shutdown signal, then tears down in order:
//! stop accepting, close connections, let unregisters and their presence
//! writes drain, then stop tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use linkhub_cluster::{MemoryPresenceStore, PresenceHeartbeat, PresenceStore, RedisPresenceStore};
use linkhub_core::auth::JwtService;
use linkhub_core::config::RedisConfig;
use linkhub_core::models::ServerAddr;
use linkhub_core::Config;
use linkhub_gateway::handlers::default_router;
use linkhub_gateway::{serve, AppState, ConnectionSweeper, Hub, SweepPolicy};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct LinkHubServer {
    config: Config,
    listener: TcpListener,
    server_addr: ServerAddr,
    presence: Arc<dyn PresenceStore>,
    hub: Arc<Hub>,
    state: AppState,
}

impl LinkHubServer {
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let presence = init_presence(&config.redis).await?;

        let listener = TcpListener::bind(config.listen_address())
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_address()))?;
        let local_addr = listener.local_addr()?;

        let advertise_ip = config
            .server
            .advertise_ip
            .clone()
            .unwrap_or_else(detect_local_ip);
        let server_addr = ServerAddr::new(advertise_ip, local_addr.port());
        info!(
            server = %server_addr,
            hostname = %local_hostname(),
            "Instance identity resolved"
        );

        let hub = Arc::new(Hub::new(
            server_addr.clone(),
            Arc::clone(&presence),
            &config.presence,
        ));
        let verifier = Arc::new(JwtService::from_config(&config.auth)?);
        let router = default_router(
            &hub,
            verifier,
            config.platforms.clone(),
            &config.rate_limit,
        );
        info!(commands = ?router.commands(), "Command router built");
        let state = AppState::new(Arc::clone(&hub), router, config.websocket.clone());

        Ok(Self {
            config,
            listener,
            server_addr,
            presence,
            hub,
            state,
        })
    }

    /// Serve until a shutdown signal, then shut down gracefully
    pub async fn run(self) -> anyhow::Result<()> {
        let http_token = CancellationToken::new();
        let tasks_token = CancellationToken::new();

        let hub_handle = self.hub.start(tasks_token.clone());
        let sweeper_handle = ConnectionSweeper::new(
            Arc::clone(&self.hub),
            self.config.websocket.sweep_interval(),
            SweepPolicy::from_config(&self.config.websocket),
        )
        .start(tasks_token.clone());
        let heartbeat_handle = PresenceHeartbeat::new(
            Arc::clone(&self.presence),
            self.server_addr.clone(),
            self.config.presence.refresh_interval(),
        )
        .start(tasks_token.clone());

        let mut http_handle = tokio::spawn(serve(self.listener, self.state, http_token.clone()));

        info!("All components started");

        tokio::select! {
            result = &mut http_handle => {
                match result {
                    Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                    Ok(Err(e)) => error!("HTTP server error: {}", e),
                    Err(e) => error!("HTTP server task failed: {}", e),
                }
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        // 1. Stop accepting new sockets and close live connections
        http_token.cancel();
        self.hub.shutdown();
        if !http_handle.is_finished() {
            match tokio::time::timeout(DRAIN_TIMEOUT, http_handle).await {
                Ok(Err(e)) => warn!("HTTP server task failed during shutdown: {}", e),
                Err(_) => warn!("HTTP server did not stop within {:?}", DRAIN_TIMEOUT),
                Ok(Ok(_)) => {}
            }
        }

        // 2. Let unregisters drain
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = self.hub.connection_count();
            if remaining == 0 {
                info!("All connections drained");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Drain timeout reached with {} connection(s) still registered",
                    remaining
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        // 3. Let presence releases from those unregisters land
        if tokio::time::timeout(DRAIN_TIMEOUT, self.hub.wait_presence_updates())
            .await
            .is_err()
        {
            warn!("Presence updates still pending after {:?}", DRAIN_TIMEOUT);
        }

        // 4. Stop maintenance tasks; the presence heartbeat removes this instance
        tasks_token.cancel();
        for (name, handle) in [
            ("presence heartbeat", heartbeat_handle),
            ("connection sweeper", sweeper_handle),
            ("hub event loop", hub_handle),
        ] {
            if let Err(e) = handle.await {
                warn!("{} task failed: {}", name, e);
            }
        }

        info!("LinkHub shut down complete");
        Ok(())
    }
}

async fn init_presence(config: &RedisConfig) -> anyhow::Result<Arc<dyn PresenceStore>> {
    if config.url.is_empty() {
        info!("Redis not configured, using in-memory presence store (single instance)");
        return Ok(Arc::new(MemoryPresenceStore::new()));
    }

    let store = RedisPresenceStore::new(
        &config.url,
        config.key_prefix.clone(),
        Duration::from_secs(config.timeout_seconds),
    )?;
    match store.ping().await {
        Ok(()) => info!("Redis presence store connected"),
        // Presence is best-effort; the instance still serves local traffic
        Err(e) => warn!("Redis presence store unreachable at startup: {}", e),
    }
    Ok(Arc::new(store))
}

/// Local IP used to reach the outside world, as peers would see it
fn detect_local_ip() -> String {
    use std::net::UdpSocket;

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
