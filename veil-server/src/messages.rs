use crate::error::FrameError;
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_CHAT_ID_LENGTH: usize = 64;
/// Base64 envelope of a message, not the message itself.
const MAX_CONTENT_LENGTH: usize = 65536;

/// First parsing stage: any `{type, data}` object.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Payload of an inbound `event` frame.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct EventData {
    #[garde(length(min = 1, max = MAX_CHAT_ID_LENGTH))]
    pub chat: String,
    #[garde(length(min = 1, max = MAX_CONTENT_LENGTH))]
    pub content: String,
}

/// Frames a client may send.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    KeepAlive,
    Me,
    Event(EventData),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        match raw.kind.as_str() {
            "keep-alive" => Ok(Self::KeepAlive),
            "me" => Ok(Self::Me),
            "event" => {
                let data: EventData = serde_json::from_value(raw.data.unwrap_or(Value::Null))?;
                data.validate()?;
                Ok(Self::Event(data))
            }
            _ => Err(FrameError::UnknownType(raw.kind)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MePayload {
    pub id: String,
    pub username: String,
    pub name: String,
}

/// A chat event as relayed to participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPayload {
    pub id: String,
    pub timestamp: i64,
    pub from: String,
    pub chat: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Frames the server sends: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    Me(MePayload),
    Event(EventPayload),
    Error(ErrorPayload),
    OverviewReload,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
