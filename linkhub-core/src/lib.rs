pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{ConnectionId, ServerAddr, UserId, UserKey};
