mod client;
mod config;
mod dispatch;
mod messages;

pub use client::{Channel, ChannelError, ChannelNotice, ChannelState};
pub use config::{ChannelConfig, DEFAULT_SERVER_URL};
pub use dispatch::{Listener, ListenerTable};
pub use messages::{
    ChatEvent, ErrorData, EventKind, MeData, OutboundFrame, SendEvent, ServerEvent,
};
