//! Server side of the chat relay
//!
//! - [`registry`]: who is in which room
//! - [`broadcaster`]: fan-out of lines to a room
//! - [`session`]: per-connection handshake / chat / teardown state machine
//! - [`chat_server`]: accept loop that spawns one session per connection

pub mod broadcaster;
pub mod chat_server;
pub mod registry;
pub mod session;

pub use broadcaster::{Broadcaster, Delivery};
pub use chat_server::{ChatServer, ServerStats};
pub use registry::{Membership, Occupant, Registry};
pub use session::{CloseReason, Session, SessionConfig, SessionState};
