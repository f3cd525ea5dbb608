//! Connection handle over one client's duplex byte stream
//!
//! The read half stays with the owning session. The write half is moved into a
//! dedicated writer task fed by a bounded queue, so any number of
//! [`ConnectionSender`] clones (the broadcaster writing on behalf of other
//! sessions) can send while the owner is blocked in [`Connection::read_line`].
//! When the writer stops, the owner's next read fails with a disconnect.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::protocol::codec::LineCodec;

/// Read buffer size per connection
const READ_CHUNK_SIZE: usize = 1024;

/// Lines that may wait for a slow peer before further sends are refused
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// How long `close` waits for queued output to drain
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque identity of a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Items queued for the writer task
#[derive(Debug)]
enum Outbound {
    Line(Bytes),
    Close,
}

/// Cloneable write capability of a connection
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    id: ConnectionId,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionSender {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a line for delivery. Fails once the writer has stopped or when
    /// the peer has fallen [`OUTBOUND_QUEUE_CAPACITY`] lines behind.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.tx
            .try_send(Outbound::Line(LineCodec::encode(line)))
            .map_err(|e| match e {
                TrySendError::Full(_) => ChatError::resource_limit(format!(
                    "Outbound queue of connection {} ({}) is full",
                    self.id, self.peer_addr
                )),
                TrySendError::Closed(_) => ChatError::disconnected(format!(
                    "Connection {} ({}) is closed",
                    self.id, self.peer_addr
                )),
            })
    }

    /// Whether the writer task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A client connection owned by its session
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    codec: LineCodec,
    read_buf: Vec<u8>,
    sender: ConnectionSender,
    writer_task: JoinHandle<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap an accepted TCP stream
    pub fn from_tcp(stream: TcpStream, max_line_length: usize) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, peer_addr, max_line_length))
    }

    /// Wrap any pair of read/write halves. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, peer_addr: SocketAddr, max_line_length: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let writer_task = tokio::spawn(write_loop(id, writer, rx));

        Self {
            id,
            peer_addr,
            reader: Box::new(reader),
            codec: LineCodec::new(max_line_length),
            read_buf: vec![0u8; READ_CHUNK_SIZE],
            sender: ConnectionSender {
                id,
                peer_addr,
                tx,
            },
            writer_task,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get a write handle that can be shared with other tasks
    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    /// Queue a line to this connection's own peer
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.sender.send_line(line)
    }

    /// Read the next line.
    /// Returns Ok(None) at end-of-stream and a disconnect error as soon as the
    /// write side has failed. Cancel-safe: buffered bytes survive.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.codec.decode_next()? {
                return Ok(Some(line));
            }

            let n = tokio::select! {
                read = self.reader.read(&mut self.read_buf) => read?,
                _ = self.sender.tx.closed() => {
                    return Err(ChatError::disconnected(format!(
                        "Write side of connection {} ({}) failed",
                        self.id, self.peer_addr
                    )));
                }
            };
            if n == 0 {
                return self.codec.finish();
            }
            self.codec.feed(&self.read_buf[..n]);
        }
    }

    /// Close the connection: pending output is flushed first, then the write
    /// half is shut down. A peer that does not drain its output within
    /// [`CLOSE_FLUSH_TIMEOUT`] is dropped without the flush. Consumes the
    /// handle so it can only happen once.
    pub async fn close(self) {
        let Connection {
            id,
            peer_addr,
            reader,
            sender,
            mut writer_task,
            ..
        } = self;

        drop(reader);
        // A full queue ends the writer once the last sender is dropped
        let _ = sender.tx.try_send(Outbound::Close);
        drop(sender);

        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Writer task for {} ({}) failed: {}", id, peer_addr, e),
            Err(_) => {
                warn!(
                    "Connection {} ({}) did not drain its output within {:?}, dropping it",
                    id, peer_addr, CLOSE_FLUSH_TIMEOUT
                );
                writer_task.abort();
            }
        }
        debug!("Connection {} ({}) closed", id, peer_addr);
    }
}

async fn write_loop<W>(id: ConnectionId, mut writer: W, mut rx: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Line(bytes) => {
                let result = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;

                if let Err(e) = result {
                    debug!("Write to connection {} failed: {}", id, e);
                    return;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of connection {} failed: {}", id, e);
    }
}
