use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Realtime event types, as they appear in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    KeepAlive,
    Me,
    Event,
    Error,
    OverviewReload,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepAlive => "keep-alive",
            Self::Me => "me",
            Self::Event => "event",
            Self::Error => "error",
            Self::OverviewReload => "overview-reload",
        }
    }
}

/// Frame sent by the client: `{"type": ..., "data": ...}`
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
}

impl OutboundFrame {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }
}

/// Payload of an outbound `event` frame. `content` is an envelope string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEvent {
    pub chat: String,
    pub content: String,
}

/// Identity echo returned for `me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeData {
    pub id: String,
    pub username: String,
    pub name: String,
}

/// A chat message relayed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: String,
    pub timestamp: i64,
    pub from: String,
    pub chat: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// Frames the server sends, tagged by `type` with the payload under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    KeepAlive,
    Me(MeData),
    Event(ChatEvent),
    Error(ErrorData),
    OverviewReload,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::KeepAlive => EventKind::KeepAlive,
            Self::Me(_) => EventKind::Me,
            Self::Event(_) => EventKind::Event,
            Self::Error(_) => EventKind::Error,
            Self::OverviewReload => EventKind::OverviewReload,
        }
    }
}
