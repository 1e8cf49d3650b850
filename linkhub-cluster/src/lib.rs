pub mod error;
pub mod presence;
pub mod tasks;

pub use error::{Error, Result};
pub use presence::{
    MemoryPresenceStore, PresenceStore, RedisPresenceStore, ServerInstance, UserOnline,
};
pub use tasks::PresenceHeartbeat;
