//! TCP chat client
//!
//! Thin wrapper used by the `client` command: server lines come out of an event
//! channel, user lines go in through [`ChatClient::send_line`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{ChatError, Result};
use crate::protocol::codec::LineCodec;
use crate::protocol::messages::EXIT_COMMAND;
use crate::DEFAULT_PORT;

/// Chat client configuration
#[derive(Clone, Debug)]
pub struct ChatClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            connect_timeout_secs: 10,
        }
    }
}

/// Events that the client can receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A line from the server
    Line(String),
    /// The server closed the connection
    Disconnected(String),
}

/// TCP chat client
pub struct ChatClient {
    config: ChatClientConfig,
    writer: Option<OwnedWriteHalf>,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Self {
        Self {
            config,
            writer: None,
        }
    }

    /// Connect and start receiving server lines
    pub async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        info!("Connecting to chat server at {}", self.config.server_addr);

        let stream = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            TcpStream::connect(self.config.server_addr),
        )
        .await
        .map_err(|_| ChatError::timeout("Connection timeout"))?
        .map_err(|e| ChatError::connection(format!("Failed to connect: {}", e)))?;

        let (reader, writer) = stream.into_split();
        self.writer = Some(writer);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if event_tx.send(ClientEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "connection closed by server".to_string(),
                    Err(e) => break format!("connection lost: {}", e),
                }
            };
            debug!("Receiver stopped: {}", reason);
            let _ = event_tx.send(ClientEvent::Disconnected(reason));
        });

        Ok(event_rx)
    }

    /// Send one line to the server
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ChatError::connection("Not connected to server"))?;
        writer.write_all(&LineCodec::encode(line)).await?;
        Ok(())
    }

    /// Leave gracefully: send `exit` and close our side
    pub async fn exit(&mut self) -> Result<()> {
        if self.writer.is_some() {
            self.send_line(EXIT_COMMAND).await?;
        }
        self.disconnect().await
    }

    /// Close our side of the connection without saying goodbye
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
            info!("Disconnected from chat server");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}
