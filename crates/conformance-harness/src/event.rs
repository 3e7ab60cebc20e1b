use serde_json::Value;

use crate::errors::HarnessError;
use crate::frame::SseFrame;

/// Payload field linking a tool invocation to its result.
pub const CORRELATION_FIELD: &str = "tool_call_id";
/// Payload field naming the session an event belongs to.
pub const SESSION_FIELD: &str = "mission_id";

/// A decoded stream event. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub event_type: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

impl StreamEvent {
    /// Decodes a frame's payload text, which must be a JSON object.
    pub fn decode(frame: &SseFrame) -> Result<Self, HarnessError> {
        let payload: Value = serde_json::from_str(&frame.data)
            .map_err(|e| HarnessError::decode(format!("{} frame: {e}", frame.event)))?;
        if !payload.is_object() {
            return Err(HarnessError::decode(format!(
                "{} frame: payload is not a JSON object",
                frame.event
            )));
        }
        Ok(Self::new(frame.event.clone(), payload))
    }

    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        let correlation_id = payload
            .get(CORRELATION_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned);
        Self {
            event_type: event_type.into(),
            payload,
            correlation_id,
        }
    }

    /// Session id carried by the payload, if any and non-empty.
    pub fn session_id(&self) -> Option<&str> {
        self.str_field(SESSION_FIELD).filter(|id| !id.is_empty())
    }

    /// Whether the event should be kept for `session_id`. Events that carry no
    /// session id are assumed to belong to the watched session.
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id().is_none_or(|id| id == session_id)
    }

    /// String field from the payload object.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Whether `content` is present and not empty.
    pub fn has_content(&self) -> bool {
        self.payload.get("content").is_some_and(truthy)
    }
}

/// Loose JSON truthiness: null, `false`, zero and empty strings or containers
/// count as absent.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
