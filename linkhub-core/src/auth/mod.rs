//! Login-handshake token verification
//!
//! The identity service is an external collaborator; the gateway only needs
//! to turn a service token into a user ID.

pub mod jwt;

pub use jwt::{Claims, JwtService};

use crate::{models::UserId, Result};

/// Identity proven by a service token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    /// Token expiry (Unix timestamp)
    pub expires_at: i64,
}

/// Verifies service tokens presented during the login handshake
#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Returns `Error::Authentication` for bad or expired tokens
    async fn verify(&self, token: &str) -> Result<Identity>;
}
