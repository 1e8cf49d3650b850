use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StatusCode;

/// Command name of the notice sent to a connection displaced by a newer login
pub const SESSION_KICKED: &str = "session.kicked";

/// Command name of the notice sent before closing a connection whose token expired
pub const SESSION_EXPIRED: &str = "session.expired";

/// Inbound envelope
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Request {
    pub seq: String,
    pub cmd: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Request {
    /// Decode a frame. On failure the error carries whatever `seq` and `cmd`
    /// could still be read from the raw JSON.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Self>(raw) {
            Ok(mut request) => {
                if request.data.is_null() {
                    request.data = empty_object();
                }
                Ok(request)
            }
            Err(e) => {
                let (seq, cmd) = salvage_correlation(raw);
                Err(DecodeError {
                    seq,
                    cmd,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub seq: String,
    pub cmd: String,
    pub reason: String,
}

fn salvage_correlation(raw: &[u8]) -> (String, String) {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(raw) else {
        return (String::new(), String::new());
    };
    let field = |name: &str| match map.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    (field("seq"), field("cmd"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseBody {
    pub code: StatusCode,
    pub message: String,
    pub data: Value,
}

/// Outbound envelope; also used for server-initiated pushes with an empty `seq`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub seq: String,
    pub cmd: String,
    pub response: ResponseBody,
}

impl Response {
    #[must_use]
    pub fn new(
        seq: impl Into<String>,
        cmd: impl Into<String>,
        code: StatusCode,
        message: Option<&str>,
        data: Value,
    ) -> Self {
        Self {
            seq: seq.into(),
            cmd: cmd.into(),
            response: ResponseBody {
                code,
                message: code.resolve_message(message),
                data,
            },
        }
    }

    #[must_use]
    pub fn push(cmd: impl Into<String>, data: Value) -> Self {
        Self::new(String::new(), cmd, StatusCode::Ok, None, data)
    }

    #[must_use]
    pub const fn code(&self) -> StatusCode {
        self.response.code
    }

    pub fn encode(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_defaults_data() {
        let request = Request::decode(br#"{"seq":"1","cmd":"heartbeat"}"#).unwrap();
        assert_eq!(request.seq, "1");
        assert_eq!(request.cmd, "heartbeat");
        assert_eq!(request.data, json!({}));

        let request = Request::decode(br#"{"seq":"1","cmd":"heartbeat","data":null}"#).unwrap();
        assert_eq!(request.data, json!({}));
    }

    #[test]
    fn test_decode_error_salvages_seq() {
        // cmd has the wrong type, seq is still readable
        let err = Request::decode(br#"{"seq":"7","cmd":5}"#).unwrap_err();
        assert_eq!(err.seq, "7");
        assert_eq!(err.cmd, "5");

        let err = Request::decode(br#"{"seq":"8"}"#).unwrap_err();
        assert_eq!(err.seq, "8");
        assert_eq!(err.cmd, "");
    }

    #[test]
    fn test_decode_error_on_garbage() {
        let err = Request::decode(b"not json at all").unwrap_err();
        assert_eq!(err.seq, "");
        assert!(!err.reason.is_empty());
    }

    #[test]
    fn test_response_wire_shape() {
        let response = Response::new(
            "42",
            "heartbeat",
            StatusCode::Ok,
            None,
            json!({"server_time": 1}),
        );
        let value: Value = serde_json::from_slice(&response.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "seq": "42",
                "cmd": "heartbeat",
                "response": {"code": 200, "message": "Success", "data": {"server_time": 1}}
            })
        );
    }

    #[test]
    fn test_push_has_empty_seq() {
        let push = Response::push(SESSION_KICKED, json!({"reason": "login elsewhere"}));
        assert_eq!(push.seq, "");
        assert_eq!(push.code(), StatusCode::Ok);
    }
}
