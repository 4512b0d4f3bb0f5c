//! chatter-relay — realtime room relay for chat events
//!
//! Clients hold a WebSocket open to the relay, join the rooms of the
//! conversations they are viewing, and receive every `receive_message` and
//! `message_deleted` event emitted into those rooms while they stay connected.
//! Messages are persisted elsewhere before they reach the relay.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;

pub use error::RelayError;
pub use router::{RelayHandle, RelayHub, RelayOptions, RelayStats};
pub use server::RelayServer;
