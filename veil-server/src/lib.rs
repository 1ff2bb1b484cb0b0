//! Veil relay server
//!
//! Authenticates realtime connections by session token, relays sealed chat
//! events between participants and brokers the chat-key handshake. Message
//! content and chat keys are opaque here.

pub mod broker;
pub mod config;
mod connection;
mod error;
mod messages;
mod state;
pub mod store;

pub use broker::Broker;
pub use config::ServerConfig;
pub use connection::{accept_connection, handle_connection, handle_frame, token_from_query};
pub use error::{BrokerError, FrameError};
pub use messages::{ClientFrame, EventData, ServerFrame};
pub use state::{ConnectionId, Registry, ServerState};
pub use store::{Identity, SessionValidator, Store};
