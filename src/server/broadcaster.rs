//! Fan-out of room messages to every occupant's connection
//!
//! Each recipient is an independent edge: a failed write to one occupant is
//! logged and counted, and delivery to the rest carries on.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::messages;
use crate::server::registry::Registry;
use crate::transport::connection::ConnectionId;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients the line was queued for
    pub delivered: usize,
    /// Recipients whose connection was gone or too far behind
    pub failed: usize,
}

/// Delivers lines to the occupants of a room
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Send a chat line from `sender` to everyone else in `room`
    pub async fn send(
        &self,
        room: &str,
        sender: ConnectionId,
        sender_name: &str,
        body: &str,
    ) -> Delivery {
        let line = messages::tagged(sender_name, body);
        self.fan_out(room, &line, Some(sender)).await
    }

    /// Send a notice (join/leave) tagged with `name` to the room
    pub async fn announce(
        &self,
        room: &str,
        name: &str,
        text: &str,
        exclude: Option<ConnectionId>,
    ) -> Delivery {
        let line = messages::tagged(name, text);
        self.fan_out(room, &line, exclude).await
    }

    async fn fan_out(&self, room: &str, line: &str, exclude: Option<ConnectionId>) -> Delivery {
        let mut delivery = Delivery::default();

        for occupant in self.registry.snapshot(room).await {
            if Some(occupant.id()) == exclude {
                continue;
            }

            match occupant.sender.send_line(line) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    delivery.failed += 1;
                    warn!(
                        "Failed to deliver to {} ({}) in room '{}': {}",
                        occupant.name,
                        occupant.sender.peer_addr(),
                        room,
                        e
                    );
                }
            }
        }

        debug!(
            "Room '{}': delivered to {}, failed {}",
            room, delivery.delivered, delivery.failed
        );
        delivery
    }
}
