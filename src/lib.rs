//! Line-oriented TCP chat relay with named rooms
//!
//! Clients connect, pick a display name, join (or create) a room by name and
//! then exchange newline-delimited messages with everyone else in that room.
//! Rooms exist only while they have occupants.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ChatClient, ChatClientConfig, ClientEvent};
pub use error::{ChatError, Result};
pub use server::{Broadcaster, ChatServer, Registry, ServerStats, Session};

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::server::session::SessionConfig;

/// Default port the relay listens on
pub const DEFAULT_PORT: u16 = 12345;

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Chat server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Server listen address
    pub bind_addr: SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Maximum line length in bytes
    pub max_line_length: usize,
    /// Close sessions that stay silent this long (seconds)
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 1000,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            idle_timeout_secs: None,
        }
    }
}

impl ChatConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ChatError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ChatError::config("max_connections must be at least 1"));
        }
        if self.max_line_length == 0 {
            return Err(ChatError::config("max_line_length must be at least 1"));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ChatError::config("idle_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: self.idle_timeout(),
        }
    }
}
