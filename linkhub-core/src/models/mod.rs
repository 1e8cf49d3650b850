pub mod id;
pub mod server;

pub use id::{generate_id, ConnectionId, UserId, UserKey};
pub use server::ServerAddr;
