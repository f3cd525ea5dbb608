//! TCP chat server
//!
//! Accepts connections and runs one [`Session`] task per client. All sessions
//! share one [`Registry`]; nothing a session does can take the accept loop down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::server::broadcaster::Broadcaster;
use crate::server::registry::Registry;
use crate::server::session::{depart, Session};
use crate::transport::connection::Connection;
use crate::ChatConfig;

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    /// Live sessions, joined or still in the handshake
    pub active_connections: usize,
    /// Sessions registered in a room
    pub joined_connections: usize,
    pub rooms: usize,
    pub total_accepted: u64,
    /// Connections dropped because of the connection limit
    pub rejected: u64,
    pub uptime_secs: u64,
}

/// Room-partitioned chat server
#[derive(Clone)]
pub struct ChatServer {
    config: Arc<ChatConfig>,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    active: Arc<AtomicUsize>,
    total_accepted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ChatServer {
    /// Create a new chat server with the given configuration
    pub fn new(config: ChatConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            active: Arc::new(AtomicUsize::new(0)),
            total_accepted: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Get the shared registry
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Bind the configured address and serve until [`ChatServer::shutdown`]
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            ChatError::network(format!("Failed to bind {}: {}", self.config.bind_addr, e))
        })?;

        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Chat server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Chat server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting new connections. Live sessions run to completion.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);

        let active = self.active.fetch_add(1, Ordering::SeqCst);
        if active >= self.config.max_connections {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Connection limit reached ({}), rejecting {}",
                self.config.max_connections, addr
            );
            return;
        }

        let server = self.clone();
        tokio::spawn(async move {
            server.handle_connection(stream, addr).await;
            let remaining = server.active.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!("{} gone, {} connections remain", addr, remaining);
        });
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let connection = match Connection::from_tcp(stream, self.config.max_line_length) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to set up connection from {}: {}", addr, e);
                return;
            }
        };
        let id = connection.id();

        info!("New connection from {}", addr);

        let session = Session::new(
            connection,
            Arc::clone(&self.registry),
            self.broadcaster.clone(),
            self.config.session_config(),
        );

        // Run the session in its own task so a panic inside it still lets us
        // clear its registry entry here
        match tokio::spawn(session.run()).await {
            Ok(reason) => debug!("Session {} for {} finished: {}", id, addr, reason),
            Err(e) => {
                error!("Session {} for {} failed: {}", id, addr, e);
                if let Some(membership) = depart(&self.registry, &self.broadcaster, id).await {
                    warn!(
                        "Removed {} from room '{}' after session failure",
                        membership.name, membership.room
                    );
                }
            }
        }

        info!("Connection from {} closed", addr);
    }

    /// Get server statistics
    pub async fn get_stats(&self) -> ServerStats {
        ServerStats {
            active_connections: self.active.load(Ordering::SeqCst),
            joined_connections: self.registry.connection_count().await,
            rooms: self.registry.room_count().await,
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            uptime_secs: self.registry.uptime().as_secs(),
        }
    }
}
