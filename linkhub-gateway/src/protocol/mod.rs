//! JSON envelope exchanged over the WebSocket
//!
//! Request: `{"seq": "...", "cmd": "...", "data": {...}}`
//! Response: `{"seq": "...", "cmd": "...", "response": {"code": 200, "message": "...", "data": ...}}`

mod envelope;
mod status;

pub use envelope::{
    DecodeError, Request, Response, ResponseBody, SESSION_EXPIRED, SESSION_KICKED,
};
pub use status::StatusCode;
