//! Per-connection command throttling backed by `governor` (GCRA)
//!
//! Every connection gets its own keyed limiter with one bucket per command
//! name, so a burst of one command never starves another and the buckets are
//! dropped together with the connection.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use linkhub_core::config::RateLimitConfig;

/// Command buckets owned by one connection
pub type CommandLimiter = DefaultKeyedRateLimiter<String>;

/// Returned when a command exceeded its quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandThrottle {
    /// `None` disables throttling
    quota: Option<Quota>,
    exempt: HashSet<String>,
}

impl CommandThrottle {
    /// `per_second == 0` disables throttling
    #[must_use]
    pub fn new(per_second: u32, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            quota: NonZeroU32::new(per_second).map(Quota::per_second),
            exempt: exempt.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.per_second, config.exempt.iter().cloned())
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, std::iter::empty())
    }

    #[must_use]
    pub fn is_exempt(&self, cmd: &str) -> bool {
        self.exempt.contains(cmd)
    }

    /// Fresh limiter for a new connection, `None` when throttling is off
    #[must_use]
    pub fn new_limiter(&self) -> Option<CommandLimiter> {
        self.quota.map(RateLimiter::keyed)
    }

    pub fn check(&self, limiter: Option<&CommandLimiter>, cmd: &str) -> Result<(), Throttled> {
        let Some(limiter) = limiter else {
            return Ok(());
        };
        if self.is_exempt(cmd) {
            return Ok(());
        }
        limiter.check_key(&cmd.to_string()).map_err(|not_until| Throttled {
            retry_after: not_until.wait_time_from(DefaultClock::default().now()),
        })
    }
}

impl Default for CommandThrottle {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
