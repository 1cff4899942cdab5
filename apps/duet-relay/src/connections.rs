use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use duet_protocol::{ParticipantDescriptor, RoomId, ServerMessage};
use metrics::gauge;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Identifies one live transport session. A reconnecting participant gets a new one.
pub type ConnectionId = Uuid;

struct ConnectionEntry {
    participant: ParticipantDescriptor,
    tx: mpsc::UnboundedSender<ServerMessage>,
    attached_room: Option<RoomId>,
    last_seen: Instant,
}

/// Outbound queues for every live connection, plus the room each one is
/// attached to at the transport level.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    entries: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        connection_id: ConnectionId,
        participant: ParticipantDescriptor,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.insert(
            connection_id,
            ConnectionEntry {
                participant,
                tx,
                attached_room: None,
                last_seen: Instant::now(),
            },
        );
        gauge!("duet_relay_connections_active", self.entries.len() as f64);
        rx
    }

    /// Drop the connection's queue. Returns its participant and attached room.
    pub fn unregister(
        &self,
        connection_id: ConnectionId,
    ) -> Option<(ParticipantDescriptor, Option<RoomId>)> {
        let removed = self
            .entries
            .remove(&connection_id)
            .map(|(_, entry)| (entry.participant, entry.attached_room));
        gauge!("duet_relay_connections_active", self.entries.len() as f64);
        removed
    }

    pub fn participant(&self, connection_id: ConnectionId) -> Option<ParticipantDescriptor> {
        self.entries
            .get(&connection_id)
            .map(|entry| entry.participant.clone())
    }

    pub fn attached_room(&self, connection_id: ConnectionId) -> Option<RoomId> {
        self.entries
            .get(&connection_id)
            .and_then(|entry| entry.attached_room.clone())
    }

    pub fn attach(&self, connection_id: ConnectionId, room_id: &RoomId) {
        if let Some(mut entry) = self.entries.get_mut(&connection_id) {
            entry.attached_room = Some(room_id.clone());
        }
    }

    /// Stop routing room traffic to this connection. Only detaches from `room_id`.
    pub fn detach(&self, connection_id: ConnectionId, room_id: &RoomId) -> bool {
        match self.entries.get_mut(&connection_id) {
            Some(mut entry) if entry.attached_room.as_ref() == Some(room_id) => {
                entry.attached_room = None;
                true
            }
            _ => false,
        }
    }

    /// Room-scoped delivery: dropped unless the connection is attached to `room_id`.
    pub fn deliver(
        &self,
        connection_id: ConnectionId,
        room_id: &RoomId,
        message: ServerMessage,
    ) -> bool {
        let Some(entry) = self.entries.get(&connection_id) else {
            return false;
        };
        if entry.attached_room.as_ref() != Some(room_id) {
            trace!(
                connection_id = %connection_id,
                room_id = %room_id,
                kind = message.kind(),
                "connection not attached to room; dropping"
            );
            return false;
        }
        entry.tx.send(message).is_ok()
    }

    /// Deliver to the connection regardless of room (errors, acknowledgements).
    pub fn send_direct(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        self.entries
            .get(&connection_id)
            .map(|entry| entry.tx.send(message).is_ok())
            .unwrap_or(false)
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(mut entry) = self.entries.get_mut(&connection_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Connections with no inbound traffic for longer than `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|entry| entry.last_seen.elapsed() > timeout)
            .map(|entry| *entry.key())
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "found stale connections");
        }
        stale
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_scoped_to_the_attached_room() {
        let hub = ConnectionHub::new();
        let id = Uuid::new_v4();
        let mut rx = hub.register(id, ParticipantDescriptor::new("alice", "Alice"));
        let room = RoomId::from("r-1");
        let other = RoomId::from("r-2");

        assert!(!hub.deliver(id, &room, ServerMessage::Pong));
        hub.attach(id, &room);
        assert!(!hub.deliver(id, &other, ServerMessage::Pong));
        assert!(hub.deliver(id, &room, ServerMessage::Pong));
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));

        assert!(!hub.detach(id, &other));
        assert!(hub.detach(id, &room));
        assert!(!hub.deliver(id, &room, ServerMessage::Pong));
        assert!(hub.send_direct(id, ServerMessage::Pong));
    }

    #[tokio::test]
    async fn unregister_closes_the_outbound_queue() {
        let hub = ConnectionHub::new();
        let id = Uuid::new_v4();
        let mut rx = hub.register(id, ParticipantDescriptor::new("alice", "Alice"));
        hub.attach(id, &RoomId::from("r-1"));

        let (participant, room) = hub.unregister(id).unwrap();
        assert_eq!(participant.participant_id.as_str(), "alice");
        assert_eq!(room, Some(RoomId::from("r-1")));
        assert_eq!(rx.recv().await, None);
        assert!(hub.unregister(id).is_none());
    }
}
