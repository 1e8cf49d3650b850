use serde::{Serialize, Serializer};

/// Numeric status carried in every response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 200,
    NotLoggedIn = 1000,
    ParameterIllegal = 1001,
    UnauthorizedUserId = 1002,
    Unauthorized = 1003,
    ServerError = 1004,
    NotData = 1005,
    OperationFailure = 1009,
    RoutingNotExist = 1010,
}

impl StatusCode {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::NotLoggedIn => "Not logged in",
            Self::ParameterIllegal => "Parameter illegal",
            Self::UnauthorizedUserId => "Unauthorized user id",
            Self::Unauthorized => "Unauthorized",
            Self::ServerError => "System error",
            Self::NotData => "No data",
            Self::OperationFailure => "Operation failure",
            Self::RoutingNotExist => "Routing not exist",
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    #[must_use]
    pub const fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            200 => Self::Ok,
            1000 => Self::NotLoggedIn,
            1001 => Self::ParameterIllegal,
            1002 => Self::UnauthorizedUserId,
            1003 => Self::Unauthorized,
            1004 => Self::ServerError,
            1005 => Self::NotData,
            1009 => Self::OperationFailure,
            1010 => Self::RoutingNotExist,
            _ => return None,
        })
    }

    /// Caller-supplied text wins when non-empty
    #[must_use]
    pub fn resolve_message(self, message: Option<&str>) -> String {
        match message {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => self.default_message().to_string(),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_u32(), self.default_message())
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}
