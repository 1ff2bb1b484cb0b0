//! Client core for Veil, an end-to-end encrypted chat.
//!
//! Message content never leaves the client in plaintext: every chat has a
//! symmetric key that only its two participants can unwrap, and the relay
//! server only ever handles sealed envelopes.

pub mod crypto;
pub mod handshake;
pub mod websocket;

pub use crypto::{CryptoError, CryptoManager, Registration, SecurityKey};
pub use websocket::{Channel, ChannelConfig, ChannelError, ChannelNotice, ChannelState, EventKind, ServerEvent};
