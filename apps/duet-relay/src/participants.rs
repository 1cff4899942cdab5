use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use duet_protocol::{ParticipantDescriptor, ParticipantId, RoomId};
use tracing::debug;

use crate::connections::ConnectionId;

/// Presence record for a connected participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub room_id: Option<RoomId>,
    pub connected_at: DateTime<Utc>,
}

/// Which connection currently speaks for each participant, and which room
/// they are in. At most one record per participant.
#[derive(Clone, Default)]
pub struct ParticipantDirectory {
    records: Arc<DashMap<ParticipantId, ParticipantRecord>>,
}

impl ParticipantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh connection. A previous record is replaced wholesale,
    /// including its room; the previous record is returned.
    pub fn connect(
        &self,
        participant: &ParticipantDescriptor,
        connection_id: ConnectionId,
    ) -> Option<ParticipantRecord> {
        let record = ParticipantRecord {
            participant_id: participant.participant_id.clone(),
            connection_id,
            display_name: participant.display_name.clone(),
            room_id: None,
            connected_at: Utc::now(),
        };
        let previous = self
            .records
            .insert(participant.participant_id.clone(), record);
        if let Some(prev) = &previous {
            debug!(
                participant_id = %participant.participant_id,
                previous_connection = %prev.connection_id,
                connection_id = %connection_id,
                "participant record replaced by new connection"
            );
        }
        previous
    }

    /// Remove the record, but only if it still belongs to `connection_id`.
    pub fn disconnect(
        &self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
    ) -> Option<ParticipantRecord> {
        self.records
            .remove_if(participant_id, |_, record| {
                record.connection_id == connection_id
            })
            .map(|(_, record)| record)
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<ParticipantRecord> {
        self.records.get(participant_id).map(|r| r.value().clone())
    }

    pub fn current_room(&self, participant_id: &ParticipantId) -> Option<RoomId> {
        self.records
            .get(participant_id)
            .and_then(|r| r.room_id.clone())
    }

    /// Whether `connection_id` is the one currently speaking for the participant.
    pub fn is_current(&self, participant_id: &ParticipantId, connection_id: ConnectionId) -> bool {
        self.records
            .get(participant_id)
            .map(|r| r.connection_id == connection_id)
            .unwrap_or(false)
    }

    /// Set the room for the record owned by `connection_id`. Returns false if
    /// a newer connection has taken over.
    pub fn set_room(
        &self,
        participant_id: &ParticipantId,
        connection_id: ConnectionId,
        room_id: &RoomId,
    ) -> bool {
        match self.records.entry(participant_id.clone()) {
            Entry::Occupied(mut entry) if entry.get().connection_id == connection_id => {
                entry.get_mut().room_id = Some(room_id.clone());
                true
            }
            _ => false,
        }
    }

    /// Clear the room field only while it still names `room_id`.
    pub fn clear_room(&self, participant_id: &ParticipantId, room_id: &RoomId) -> bool {
        match self.records.get_mut(participant_id) {
            Some(mut record) if record.room_id.as_ref() == Some(room_id) => {
                record.room_id = None;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
