//! Room registry for the chat relay
//!
//! Tracks which connection sits in which room under one lock, so the
//! connection → membership map and the room → occupants map can never be seen
//! out of step with each other.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;

use crate::current_timestamp;
use crate::transport::connection::{ConnectionId, ConnectionSender};

/// A (display name, connection) pair registered in a room
#[derive(Debug, Clone)]
pub struct Occupant {
    /// Display name chosen during the handshake
    pub name: String,
    /// Write handle onto the occupant's connection
    pub sender: ConnectionSender,
    /// When the occupant joined (ms since UNIX epoch)
    pub joined_at: u64,
    /// Registry-wide join order, used for deterministic iteration
    seq: u64,
}

impl Occupant {
    pub fn id(&self) -> ConnectionId {
        self.sender.id()
    }
}

/// Where a connection is registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub name: String,
    pub room: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Membership>,
    rooms: HashMap<String, HashMap<ConnectionId, Occupant>>,
    next_seq: u64,
}

/// Shared authoritative mapping of connections to rooms and rooms to occupants
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    created_at: Instant,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            created_at: Instant::now(),
        }
    }

    /// Register a connection under `name` in `room`, creating the room if needed.
    /// Returns false (and changes nothing) if the connection is already joined.
    pub async fn join(&self, sender: ConnectionSender, name: &str, room: &str) -> bool {
        let id = sender.id();
        let mut state = self.state.write().await;

        if state.connections.contains_key(&id) {
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        state.connections.insert(
            id,
            Membership {
                name: name.to_string(),
                room: room.to_string(),
            },
        );

        let occupants = state.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!("Room '{}' created", room);
            HashMap::new()
        });
        occupants.insert(
            id,
            Occupant {
                name: name.to_string(),
                sender,
                joined_at: current_timestamp(),
                seq,
            },
        );

        true
    }

    /// Remove a connection from its room, deleting the room if it empties.
    /// Safe to call for connections that never joined or already left.
    pub async fn leave(&self, id: ConnectionId) -> Option<Membership> {
        let mut state = self.state.write().await;

        let membership = state.connections.remove(&id)?;

        let emptied = match state.rooms.get_mut(&membership.room) {
            Some(occupants) => {
                if let Some(occupant) = occupants.remove(&id) {
                    debug!(
                        "{} left room '{}' after {} ms",
                        occupant.name,
                        membership.room,
                        current_timestamp().saturating_sub(occupant.joined_at)
                    );
                }
                occupants.is_empty()
            }
            None => false,
        };

        if emptied {
            state.rooms.remove(&membership.room);
            debug!("Room '{}' is empty and was removed", membership.room);
        }

        Some(membership)
    }

    /// Point-in-time copy of a room's occupants, in join order
    pub async fn snapshot(&self, room: &str) -> Vec<Occupant> {
        let state = self.state.read().await;
        let mut occupants: Vec<Occupant> = state
            .rooms
            .get(room)
            .map(|occupants| occupants.values().cloned().collect())
            .unwrap_or_default();
        occupants.sort_by_key(|o| o.seq);
        occupants
    }

    /// Names of all rooms, sorted
    pub async fn room_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connection registered under a display name.
    /// With duplicate names the earliest joiner wins.
    pub async fn find_handle_by_name(&self, name: &str) -> Option<ConnectionSender> {
        let state = self.state.read().await;
        state
            .rooms
            .values()
            .flat_map(|occupants| occupants.values())
            .filter(|o| o.name == name)
            .min_by_key(|o| o.seq)
            .map(|o| o.sender.clone())
    }

    /// Membership of a single connection
    pub async fn membership(&self, id: ConnectionId) -> Option<Membership> {
        let state = self.state.read().await;
        state.connections.get(&id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Number of connections that completed the handshake
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn occupant_count(&self, room: &str) -> usize {
        let state = self.state.read().await;
        state.rooms.get(room).map(HashMap::len).unwrap_or(0)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    #[cfg(test)]
    pub(crate) async fn assert_consistent(&self) {
        let state = self.state.read().await;
        for (room, occupants) in &state.rooms {
            assert!(!occupants.is_empty(), "room '{}' is empty", room);
            for (id, occupant) in occupants {
                let membership = state
                    .connections
                    .get(id)
                    .unwrap_or_else(|| panic!("occupant {} missing from connections", id));
                assert_eq!(&membership.room, room);
                assert_eq!(membership.name, occupant.name);
            }
        }
        for (id, membership) in &state.connections {
            let in_room = state
                .rooms
                .get(&membership.room)
                .map(|occupants| occupants.contains_key(id))
                .unwrap_or(false);
            assert!(in_room, "connection {} missing from room '{}'", id, membership.room);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::Connection;

    fn connection() -> Connection {
        let (server_side, _client_side) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(server_side);
        Connection::new(r, w, "127.0.0.1:9000".parse().unwrap(), 1024)
    }

    #[tokio::test]
    async fn test_join_creates_room() {
        let registry = Registry::new();
        let alice = connection();

        assert!(registry.room_names().await.is_empty());
        assert!(registry.join(alice.sender(), "alice", "lobby").await);

        assert_eq!(registry.room_names().await, vec!["lobby".to_string()]);
        assert_eq!(registry.occupant_count("lobby").await, 1);
        assert_eq!(
            registry.membership(alice.id()).await,
            Some(Membership {
                name: "alice".to_string(),
                room: "lobby".to_string()
            })
        );
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_second_join_is_ignored() {
        let registry = Registry::new();
        let alice = connection();

        assert!(registry.join(alice.sender(), "alice", "lobby").await);
        assert!(!registry.join(alice.sender(), "alice", "dev").await);

        assert_eq!(registry.room_names().await, vec!["lobby".to_string()]);
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_leave_removes_empty_room() {
        let registry = Registry::new();
        let alice = connection();
        let bob = connection();

        registry.join(alice.sender(), "alice", "lobby").await;
        registry.join(bob.sender(), "bob", "lobby").await;

        let left = registry.leave(alice.id()).await.unwrap();
        assert_eq!(left.name, "alice");
        assert_eq!(left.room, "lobby");
        assert_eq!(registry.room_names().await, vec!["lobby".to_string()]);

        registry.leave(bob.id()).await;
        assert!(registry.room_names().await.is_empty());
        assert_eq!(registry.room_count().await, 0);
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let registry = Registry::new();
        let alice = connection();
        let never_joined = connection();

        assert!(registry.leave(never_joined.id()).await.is_none());

        registry.join(alice.sender(), "alice", "lobby").await;
        assert!(registry.leave(alice.id()).await.is_some());
        assert!(registry.leave(alice.id()).await.is_none());
        registry.assert_consistent().await;
    }

    #[tokio::test]
    async fn test_snapshot_in_join_order() {
        let registry = Registry::new();
        let conns: Vec<Connection> = (0..4).map(|_| connection()).collect();

        for (i, conn) in conns.iter().enumerate() {
            registry
                .join(conn.sender(), &format!("user{}", i), "lobby")
                .await;
        }

        let names: Vec<String> = registry
            .snapshot("lobby")
            .await
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["user0", "user1", "user2", "user3"]);
        assert!(registry.snapshot("nowhere").await.is_empty());
    }

    #[tokio::test]
    async fn test_find_handle_by_name_prefers_earliest() {
        let registry = Registry::new();
        let first = connection();
        let second = connection();

        registry.join(first.sender(), "sam", "a").await;
        registry.join(second.sender(), "sam", "b").await;

        let found = registry.find_handle_by_name("sam").await.unwrap();
        assert_eq!(found.id(), first.id());
        assert!(registry.find_handle_by_name("nobody").await.is_none());

        registry.leave(first.id()).await;
        let found = registry.find_handle_by_name("sam").await.unwrap();
        assert_eq!(found.id(), second.id());
    }

    #[tokio::test]
    async fn test_random_join_leave_stays_consistent() {
        let registry = Registry::new();
        let conns: Vec<Connection> = (0..12).map(|_| connection()).collect();
        let rooms = ["lobby", "dev", "ops"];

        // Small LCG keeps the sequence reproducible
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let conn = &conns[(seed >> 33) as usize % conns.len()];
            let room = rooms[(seed >> 17) as usize % rooms.len()];

            if (seed >> 40) & 1 == 0 {
                registry.join(conn.sender(), "user", room).await;
            } else {
                registry.leave(conn.id()).await;
            }

            registry.assert_consistent().await;
            for name in registry.room_names().await {
                assert!(registry.occupant_count(&name).await > 0);
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_joins_and_leaves() {
        let registry = std::sync::Arc::new(Registry::new());
        let mut tasks = Vec::new();

        for i in 0..32 {
            let registry = std::sync::Arc::clone(&registry);
            let conn = connection();
            tasks.push(tokio::spawn(async move {
                let room = if i % 2 == 0 { "even" } else { "odd" };
                registry.join(conn.sender(), &format!("u{}", i), room).await;
                tokio::task::yield_now().await;
                registry.leave(conn.id()).await;
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        registry.assert_consistent().await;
        assert_eq!(registry.connection_count().await, 0);
        assert!(registry.room_names().await.is_empty());
    }
}
