//! Transport layer: connection handles over TCP (or any async byte stream)

pub mod connection;

pub use connection::{Connection, ConnectionId, ConnectionSender};
