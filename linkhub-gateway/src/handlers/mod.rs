mod heartbeat;
mod login;
mod topics;

use std::sync::Arc;

use linkhub_core::auth::IdentityVerifier;
use linkhub_core::config::{PlatformsConfig, RateLimitConfig};

pub use heartbeat::HeartbeatHandler;
pub use login::LoginHandler;
pub use topics::{SubscribeHandler, UnsubscribeHandler};

use crate::hub::Hub;
use crate::router::Router;
use crate::throttle::CommandThrottle;

/// Router with the built-in `heartbeat`, `login`, `subscribe` and `unsubscribe` commands
#[must_use]
pub fn default_router(
    hub: &Arc<Hub>,
    verifier: Arc<dyn IdentityVerifier>,
    platforms: PlatformsConfig,
    rate_limit: &RateLimitConfig,
) -> Router {
    Router::builder()
        .route("heartbeat", HeartbeatHandler::new(Arc::clone(hub)))
        .route("login", LoginHandler::new(Arc::clone(hub), verifier, platforms))
        .route("subscribe", SubscribeHandler::new(Arc::clone(hub)))
        .route("unsubscribe", UnsubscribeHandler::new(Arc::clone(hub)))
        .throttle(CommandThrottle::from_config(rate_limit))
        .build()
}
