//! WebSocket side of the hub: connections, the local registry, command
//! routing and the HTTP surface that upgrades sockets.

pub mod connection;
pub mod handlers;
pub mod hub;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod sweep;
pub mod throttle;

pub use connection::Connection;
pub use hub::{Hub, HubEvent, HubStats, Location};
pub use router::{CommandHandler, Reply, Router, RouterBuilder};
pub use server::{create_router, serve, AppState};
pub use sweep::{sweep_once, ConnectionSweeper, SweepPolicy, SweepReport};
