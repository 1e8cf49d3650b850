use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::Error;

/// Address of one server instance as published in the presence store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub ip: String,
    pub port: u16,
}

impl ServerAddr {
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplit so that bracket-less IPv6 literals keep their colons
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("Server address missing port: {s}")))?;
        if ip.is_empty() {
            return Err(Error::InvalidInput(format!("Server address missing host: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidInput(format!("Invalid port in server address {s}: {e}")))?;
        Ok(Self::new(ip, port))
    }
}
