//! Per-connection session state machine
//!
//! `Handshake -> Joined -> Closed`. Every way out of the first two states
//! (empty input, EOF, `exit`, transport error, idle timeout) funnels into one
//! teardown that leaves the registry, announces the departure and closes the
//! connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::messages::{self, ClientLine};
use crate::server::broadcaster::Broadcaster;
use crate::server::registry::{Membership, Registry};
use crate::transport::connection::{Connection, ConnectionId};

/// Lifecycle of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Negotiating display name and room
    Handshake,
    /// Registered in a room and relaying lines
    Joined(Membership),
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Handshake, SessionState::Joined(_))
                | (SessionState::Handshake, SessionState::Closed)
                | (SessionState::Joined(_), SessionState::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Handshake => write!(f, "Handshake"),
            SessionState::Joined(m) => write!(f, "Joined({} in '{}')", m.name, m.room),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// EOF or empty input before the handshake completed
    HandshakeAborted,
    /// Client sent `exit`
    Exit,
    /// EOF while joined
    Disconnected,
    /// No input within the configured idle timeout
    IdleTimeout,
    /// Transport or protocol failure
    Error(ChatError),
}

impl CloseReason {
    fn from_error(err: ChatError) -> Self {
        match err {
            ChatError::Timeout(_) => CloseReason::IdleTimeout,
            other => CloseReason::Error(other),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HandshakeAborted => write!(f, "handshake aborted"),
            CloseReason::Exit => write!(f, "exit"),
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Per-session settings
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Close the session if no line arrives within this long
    pub idle_timeout: Option<Duration>,
}

/// One client's walk through the chat protocol
pub struct Session {
    connection: Connection,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    config: SessionConfig,
    state: SessionState,
}

impl Session {
    pub fn new(
        connection: Connection,
        registry: Arc<Registry>,
        broadcaster: Broadcaster,
        config: SessionConfig,
    ) -> Self {
        Self {
            connection,
            registry,
            broadcaster,
            config,
            state: SessionState::Handshake,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drive the session to completion
    pub async fn run(mut self) -> CloseReason {
        debug!(
            "Session {} started for {}",
            self.connection.id(),
            self.connection.peer_addr()
        );

        let reason = match self.handshake().await {
            Ok(Some(membership)) => {
                self.transition(SessionState::Joined(membership.clone()));
                self.chat_loop(&membership).await
            }
            Ok(None) => CloseReason::HandshakeAborted,
            Err(e) => CloseReason::from_error(e),
        };

        self.transition(SessionState::Closed);
        self.teardown(&reason).await;
        reason
    }

    /// Name and room negotiation. Ok(None) means the client bailed out.
    async fn handshake(&mut self) -> Result<Option<Membership>> {
        self.connection.send_line(messages::WELCOME)?;

        let Some(name) = self.read_field().await? else {
            return Ok(None);
        };

        let rooms = self.registry.room_names().await;
        self.connection.send_line(messages::JOIN_PROMPT)?;
        self.connection.send_line(&messages::room_list(&rooms))?;

        let Some(room) = self.read_field().await? else {
            return Ok(None);
        };

        if !self
            .registry
            .join(self.connection.sender(), &name, &room)
            .await
        {
            return Err(ChatError::internal(format!(
                "Connection {} joined twice",
                self.connection.id()
            )));
        }

        info!(
            "{} joined room '{}' from {}",
            name,
            room,
            self.connection.peer_addr()
        );
        self.broadcaster
            .announce(&room, &name, &messages::joined_notice(&name), None)
            .await;

        Ok(Some(Membership { name, room }))
    }

    async fn chat_loop(&mut self, membership: &Membership) -> CloseReason {
        loop {
            let line = match self.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return CloseReason::Disconnected,
                Err(e) => return CloseReason::from_error(e),
            };

            match ClientLine::parse(&line) {
                ClientLine::Exit => return CloseReason::Exit,
                ClientLine::Empty => continue,
                ClientLine::Text(body) => {
                    debug!("Message from {} in '{}': {}", membership.name, membership.room, body);
                    self.broadcaster
                        .send(&membership.room, self.connection.id(), &membership.name, body)
                        .await;
                }
            }
        }
    }

    /// One trimmed handshake answer; empty input counts as a bail-out
    async fn read_field(&mut self) -> Result<Option<String>> {
        Ok(self.next_line().await?.and_then(|line| {
            let value = line.trim();
            (!value.is_empty()).then(|| value.to_string())
        }))
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.connection.read_line())
                .await
                .map_err(|_| ChatError::timeout(format!("No input for {:?}", limit)))?,
            None => self.connection.read_line().await,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                "Session {}: illegal transition {} -> {}",
                self.connection.id(),
                self.state,
                next
            );
            return;
        }
        debug!("Session {}: {} -> {}", self.connection.id(), self.state, next);
        self.state = next;
    }

    async fn teardown(self, reason: &CloseReason) {
        let Session {
            connection,
            registry,
            broadcaster,
            ..
        } = self;

        match depart(&registry, &broadcaster, connection.id()).await {
            Some(membership) => match reason {
                CloseReason::Error(e) if !e.is_disconnect() => warn!(
                    "{} left room '{}' after error: {}",
                    membership.name, membership.room, e
                ),
                _ => info!(
                    "{} left room '{}' ({})",
                    membership.name, membership.room, reason
                ),
            },
            None => debug!(
                "Connection from {} ended before joining ({})",
                connection.peer_addr(),
                reason
            ),
        }

        connection.close().await;
    }
}

/// Remove a connection from the registry and tell its room it left.
/// No-op for connections that never joined.
pub async fn depart(
    registry: &Registry,
    broadcaster: &Broadcaster,
    id: ConnectionId,
) -> Option<Membership> {
    let membership = registry.leave(id).await?;
    broadcaster
        .announce(
            &membership.room,
            &membership.name,
            &messages::left_notice(&membership.name),
            None,
        )
        .await;
    Some(membership)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{
        AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
        WriteHalf,
    };
    use tokio::task::JoinHandle;

    /// Swallows output until `broken` is set, then fails every write
    struct SwitchableWriter {
        broken: Arc<AtomicBool>,
    }

    impl AsyncWrite for SwitchableWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.broken.load(Ordering::SeqCst) {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
            } else {
                Poll::Ready(Ok(buf.len()))
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct TestClient {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for line")
                .unwrap()
        }

        async fn expect(&mut self, expected: &str) {
            assert_eq!(self.recv().await.as_deref(), Some(expected));
        }

        async fn finish_handshake(&mut self, name: &str, room: &str, rooms: &str) {
            self.expect(messages::WELCOME).await;
            self.send(name).await;
            self.expect(messages::JOIN_PROMPT).await;
            self.expect(rooms).await;
            self.send(room).await;
        }
    }

    fn spawn_session(
        registry: &Arc<Registry>,
        config: SessionConfig,
    ) -> (JoinHandle<CloseReason>, TestClient) {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(server_side);
        let connection = Connection::new(r, w, "127.0.0.1:9000".parse().unwrap(), 1024);
        let session = Session::new(
            connection,
            Arc::clone(registry),
            Broadcaster::new(Arc::clone(registry)),
            config,
        );
        assert_eq!(session.state(), &SessionState::Handshake);

        let (client_read, client_write) = tokio::io::split(client_side);
        let client = TestClient {
            lines: BufReader::new(client_read).lines(),
            writer: client_write,
        };
        (tokio::spawn(session.run()), client)
    }

    #[test]
    fn test_state_transitions() {
        let joined = SessionState::Joined(Membership {
            name: "a".to_string(),
            room: "r".to_string(),
        });

        assert!(SessionState::Handshake.can_transition_to(&joined));
        assert!(SessionState::Handshake.can_transition_to(&SessionState::Closed));
        assert!(joined.can_transition_to(&SessionState::Closed));
        assert!(!joined.can_transition_to(&SessionState::Handshake));
        assert!(!SessionState::Closed.can_transition_to(&SessionState::Handshake));
        assert!(!SessionState::Closed.can_transition_to(&joined));
    }

    #[tokio::test]
    async fn test_eof_before_name_aborts() {
        let registry = Arc::new(Registry::new());
        let (task, mut client) = spawn_session(&registry, SessionConfig::default());

        client.expect(messages::WELCOME).await;
        client.writer.shutdown().await.unwrap();

        assert!(matches!(task.await.unwrap(), CloseReason::HandshakeAborted));
        assert!(client.recv().await.is_none());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_room_aborts_without_joining() {
        let registry = Arc::new(Registry::new());
        let (task, mut client) = spawn_session(&registry, SessionConfig::default());

        client.finish_handshake("alice", "   ", "Room list: None").await;

        assert!(matches!(task.await.unwrap(), CloseReason::HandshakeAborted));
        assert!(client.recv().await.is_none());
        assert!(registry.room_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_join_chat_and_exit() {
        let registry = Arc::new(Registry::new());

        let (alice_task, mut alice) = spawn_session(&registry, SessionConfig::default());
        alice.finish_handshake("alice", "lobby", "Room list: None").await;
        alice.expect("[alice] alice joined.").await;

        let (bob_task, mut bob) = spawn_session(&registry, SessionConfig::default());
        bob.finish_handshake("bob", "lobby", "Room list: lobby").await;
        bob.expect("[bob] bob joined.").await;
        alice.expect("[bob] bob joined.").await;

        bob.send("hi").await;
        alice.expect("[bob] hi").await;

        // Blank lines are ignored, surrounding whitespace is trimmed
        alice.send("").await;
        alice.send("  hello bob  ").await;
        bob.expect("[alice] hello bob").await;

        alice.send("exit").await;
        assert!(matches!(alice_task.await.unwrap(), CloseReason::Exit));
        assert!(alice.recv().await.is_none());
        bob.expect("[alice] alice left.").await;
        assert_eq!(registry.occupant_count("lobby").await, 1);
        registry.assert_consistent().await;

        bob.writer.shutdown().await.unwrap();
        assert!(matches!(bob_task.await.unwrap(), CloseReason::Disconnected));
        assert!(registry.room_names().await.is_empty());
        registry.assert_consistent().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_session() {
        let registry = Arc::new(Registry::new());
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_secs(30)),
        };
        let (task, mut client) = spawn_session(&registry, config);

        client.finish_handshake("alice", "lobby", "Room list: None").await;
        client.expect("[alice] alice joined.").await;

        assert!(matches!(task.await.unwrap(), CloseReason::IdleTimeout));
        assert!(registry.room_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_error_still_cleans_up() {
        let registry = Arc::new(Registry::new());
        let (task, mut client) = spawn_session(&registry, SessionConfig::default());

        client.finish_handshake("alice", "lobby", "Room list: None").await;
        client.expect("[alice] alice joined.").await;

        let oversized = "x".repeat(2048);
        client.send(&oversized).await;

        match task.await.unwrap() {
            CloseReason::Error(ChatError::Protocol(_)) => {}
            other => panic!("unexpected close reason: {:?}", other),
        }
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_write_failure_closes_joined_session() {
        let registry = Arc::new(Registry::new());
        let broken = Arc::new(AtomicBool::new(false));

        let (server_side, mut alice_input) = tokio::io::duplex(4096);
        let connection = Connection::new(
            server_side,
            SwitchableWriter {
                broken: Arc::clone(&broken),
            },
            "127.0.0.1:9001".parse().unwrap(),
            1024,
        );
        let alice_task = tokio::spawn(
            Session::new(
                connection,
                Arc::clone(&registry),
                Broadcaster::new(Arc::clone(&registry)),
                SessionConfig::default(),
            )
            .run(),
        );
        alice_input.write_all(b"alice\nlobby\n").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.occupant_count("lobby").await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("alice never joined");

        let (_bob_task, mut bob) = spawn_session(&registry, SessionConfig::default());
        bob.finish_handshake("bob", "lobby", "Room list: lobby").await;
        bob.expect("[bob] bob joined.").await;

        // Alice's socket dies; the next broadcast to her is what notices
        broken.store(true, Ordering::SeqCst);
        bob.send("anyone there?").await;

        bob.expect("[alice] alice left.").await;
        match alice_task.await.unwrap() {
            CloseReason::Error(e) if e.is_disconnect() => {}
            other => panic!("unexpected close reason: {:?}", other),
        }
        assert_eq!(registry.occupant_count("lobby").await, 1);
        registry.assert_consistent().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_that_stops_reading_is_released() {
        let registry = Arc::new(Registry::new());

        let (_alice_task, mut alice) = spawn_session(&registry, SessionConfig::default());
        alice.finish_handshake("alice", "lobby", "Room list: None").await;
        alice.expect("[alice] alice joined.").await;

        let (bob_task, mut bob) = spawn_session(&registry, SessionConfig::default());
        bob.finish_handshake("bob", "lobby", "Room list: lobby").await;
        bob.expect("[bob] bob joined.").await;
        alice.expect("[bob] bob joined.").await;

        // Bob stops reading: his pipe fills, then his queue, then sends to him fail
        let body = "y".repeat(200);
        for _ in 0..(crate::transport::connection::OUTBOUND_QUEUE_CAPACITY + 50) {
            alice.send(&body).await;
        }

        bob.send("exit").await;
        alice.expect("[bob] bob left.").await;

        let reason = tokio::time::timeout(Duration::from_secs(60), bob_task)
            .await
            .expect("session stuck flushing to a stalled peer")
            .unwrap();
        assert!(matches!(reason, CloseReason::Exit));
        assert_eq!(registry.occupant_count("lobby").await, 1);
        registry.assert_consistent().await;
    }
}
