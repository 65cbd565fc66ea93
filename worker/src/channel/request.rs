//! Control channel records: requests in, responses and notifications out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from the parent process.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u32,
    /// Dot-separated method, e.g. `room.createRoom`.
    pub method: String,
    /// Routing fields: `roomId`, `peerName`, `transportId`, `rtpReceiverId`.
    #[serde(default)]
    pub internal: Value,
    /// Method-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn internal_u32(&self, key: &str) -> Option<u32> {
        self.internal
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn internal_str(&self, key: &str) -> Option<&str> {
        self.internal.get(key).and_then(Value::as_str)
    }

    pub fn accept(&self, data: Value) -> Response {
        Response {
            id: self.id,
            accepted: true,
            data: if data.is_null() { None } else { Some(data) },
            error: None,
        }
    }

    pub fn reject(&self, reason: String) -> Response {
        Response {
            id: self.id,
            accepted: false,
            data: None,
            error: Some(reason),
        }
    }
}

/// The reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An unsolicited event from the worker to the parent; carries no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Notification {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data: if data.is_null() { None } else { Some(data) },
        }
    }
}
