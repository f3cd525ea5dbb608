//! Error handling for the chat relay

use std::fmt;
use std::io;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat relay error types
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Network-related errors
    Network(String),
    /// Peer went away (reset, broken pipe, unexpected EOF)
    Disconnected(String),
    /// Protocol errors
    Protocol(String),
    /// Invalid line received from a client
    InvalidMessage(String),
    /// Connection errors
    Connection(String),
    /// Configuration error
    Config(String),
    /// Resource limit exceeded
    ResourceLimit(String),
    /// Timeout error
    Timeout(String),
    /// Internal error
    Internal(String),
}

impl ChatError {
    /// Whether this error means the peer is simply gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChatError::Disconnected(_))
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create a disconnected error
    pub fn disconnected<T: Into<String>>(msg: T) -> Self {
        ChatError::Disconnected(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message<T: Into<String>>(msg: T) -> Self {
        ChatError::InvalidMessage(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        ChatError::Connection(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create a resource limit error
    pub fn resource_limit<T: Into<String>>(msg: T) -> Self {
        ChatError::ResourceLimit(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Network(msg) => write!(f, "Network error: {}", msg),
            ChatError::Disconnected(msg) => write!(f, "Peer disconnected: {}", msg),
            ChatError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ChatError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ChatError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ChatError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ChatError::ResourceLimit(msg) => write!(f, "Resource limit exceeded: {}", msg),
            ChatError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ChatError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<io::Error> for ChatError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ChatError::Disconnected(err.to_string()),
            _ => ChatError::Network(format!("IO error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Config(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_reset_maps_to_disconnect() {
        let err: ChatError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_disconnect());

        let err: ChatError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(!err.is_disconnect());
        assert!(matches!(err, ChatError::Network(_)));
    }

    #[test]
    fn test_display() {
        let err = ChatError::protocol("line too long");
        assert_eq!(err.to_string(), "Protocol error: line too long");
    }
}
