//! Wire protocol types for controller-worker communication.
//!
//! Two frame shapes cross the pipe:
//! - **Messages** (controller → worker): JSON array, header first, then requests
//! - **Responses** (worker → controller): `{id, isError, result}`

use serde::{Deserialize, Serialize};

/// Key of the close sentinel returned by the worker's `close` built-in.
pub const CLOSED_MARKER: &str = "closedMarker";

/// Correlation token tying a response to a pending call or a registered callback.
///
/// UUID v4 keeps trigger ids and callback ids apart without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Leading record of every outbound message.
///
/// Unknown keys are kept in `extensions` so caller-defined options survive
/// the trip to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub id: CorrelationId,
    #[serde(default)]
    pub log_messages: bool,
    #[serde(default)]
    pub log_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this_arg: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Header {
    pub fn new(id: CorrelationId) -> Self {
        Self {
            id,
            log_messages: false,
            log_result: false,
            this_arg: None,
            extensions: serde_json::Map::new(),
        }
    }

    /// Header as a JSON object, for embedding in frames and descriptors.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = self.extensions.clone();
        map.insert("id".to_string(), self.id.as_str().into());
        map.insert("logMessages".to_string(), self.log_messages.into());
        map.insert("logResult".to_string(), self.log_result.into());
        if let Some(this_arg) = &self.this_arg {
            map.insert("thisArg".to_string(), this_arg.clone());
        }
        serde_json::Value::Object(map)
    }

    /// Lenient parse of whatever sits in the header position of a frame.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(header) => Some(header),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed message header");
                None
            }
        }
    }
}

/// Frame sent by the worker, either in answer to a message or out of band
/// from a worker-side callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl Response {
    pub fn success(id: Option<CorrelationId>, result: serde_json::Value) -> Self {
        Self {
            id,
            is_error: false,
            result,
        }
    }

    pub fn failure(id: Option<CorrelationId>, result: serde_json::Value) -> Self {
        Self {
            id,
            is_error: true,
            result,
        }
    }

    /// True when the worker answered with the close sentinel.
    pub fn is_closed_sentinel(&self) -> bool {
        !self.is_error && is_closed_sentinel(&self.result)
    }
}

pub fn closed_sentinel() -> serde_json::Value {
    serde_json::json!({ CLOSED_MARKER: true })
}

pub fn is_closed_sentinel(value: &serde_json::Value) -> bool {
    value.get(CLOSED_MARKER) == Some(&serde_json::Value::Bool(true))
}

/// Build an outbound frame: the header followed by the request list.
///
/// A non-list message is a single request and gets wrapped.
pub fn frame_message(header: &Header, message: serde_json::Value) -> serde_json::Value {
    let mut frame = vec![header.to_json()];
    match message {
        serde_json::Value::Array(requests) => frame.extend(requests),
        request => frame.push(request),
    }
    serde_json::Value::Array(frame)
}

/// Split an inbound frame into its header and the remaining request list.
///
/// Frames that are not lists carry no header and are interpreted as-is.
pub fn split_message(frame: serde_json::Value) -> (Option<Header>, serde_json::Value) {
    match frame {
        serde_json::Value::Array(mut items) if !items.is_empty() => {
            let header = Header::from_json(items.remove(0));
            (header, serde_json::Value::Array(items))
        }
        other => (None, other),
    }
}
