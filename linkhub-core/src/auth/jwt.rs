use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Identity, IdentityVerifier};
use crate::{config::AuthConfig, models::UserId, Error, Result};

/// Service-token claims issued by the identity service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// HS256 service-token verifier
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    algorithm: Algorithm,
    leeway_secs: u64,
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("algorithm", &self.algorithm)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl JwtService {
    /// Create a new JWT service from a shared secret
    pub fn new(secret: &[u8], leeway_secs: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Configuration("JWT secret must not be empty".to_string()));
        }

        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            algorithm: Algorithm::HS256,
            leeway_secs,
        })
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        Self::new(config.jwt_secret.as_bytes(), config.leeway_seconds)
    }

    /// Sign a service token for `user_id` valid for `ttl`
    ///
    /// Token issuance belongs to the identity service; this exists for tooling and tests.
    pub fn sign_token(&self, user_id: &UserId, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        let header = Header::new(self.algorithm);
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a token and extract claims
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = self.leeway_secs;

        let token_data: TokenData<Claims> = decode(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Authentication("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    Error::Authentication("Invalid token".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Error::Authentication("Invalid token signature".to_string())
                }
                _ => Error::Authentication(format!("Token verification failed: {e}")),
            })?;

        if token_data.claims.sub.is_empty() {
            return Err(Error::Authentication("Token has no subject".to_string()));
        }

        Ok(token_data.claims)
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for JwtService {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let claims = self.verify_token(token)?;
        Ok(Identity {
            user_id: UserId::from_string(claims.sub),
            expires_at: claims.exp,
        })
    }
}
