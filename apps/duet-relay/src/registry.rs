use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use duet_protocol::{ErrorCode, ParticipantDescriptor, ParticipantId, RoomId};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connections::ConnectionId;

/// A room never holds more than this many members.
pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
    #[error("participant is already a member of this room")]
    AlreadyMember,
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::RoomNotFound => ErrorCode::RoomNotFound,
            RegistryError::RoomFull => ErrorCode::RoomFull,
            RegistryError::AlreadyMember => ErrorCode::AlreadyMember,
        }
    }

    fn metric_label(&self) -> &'static str {
        self.code().as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(participant: &ParticipantDescriptor, connection_id: ConnectionId) -> Self {
        Self {
            participant_id: participant.participant_id.clone(),
            connection_id,
            display_name: participant.display_name.clone(),
            joined_at: Utc::now(),
        }
    }

    pub fn descriptor(&self) -> ParticipantDescriptor {
        ParticipantDescriptor {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub created_by: ParticipantId,
    pub created_at: DateTime<Utc>,
    members: Vec<Member>,
    // Set once the room has been removed from the table; a guard acquired
    // just before removal must not resurrect it.
    closed: bool,
}

impl Room {
    fn new(id: RoomId, created_by: ParticipantId) -> Self {
        Self {
            id,
            created_by,
            created_at: Utc::now(),
            members: Vec::with_capacity(ROOM_CAPACITY),
            closed: false,
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, participant_id: &ParticipantId) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| &m.participant_id == participant_id)
    }
}

/// Result of `remove_member`. `previous` and `remaining` let the caller decide
/// whether anyone needs to hear about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub previous: usize,
    pub remaining: usize,
    pub removed: Option<Member>,
    pub room_deleted: bool,
}

impl RemovalOutcome {
    fn absent() -> Self {
        Self {
            previous: 0,
            remaining: 0,
            removed: None,
            room_deleted: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.removed.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub created_by: ParticipantId,
    pub created_at: DateTime<Utc>,
    pub members: Vec<Member>,
}

/// In-memory authority over rooms. Each room sits behind its own lock so
/// unrelated rooms never contend.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<RoomId, Arc<Mutex<Room>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_room(&self, creator: &ParticipantId) -> RoomId {
        loop {
            let id = RoomId::generate();
            if let Entry::Vacant(entry) = self.rooms.entry(id.clone()) {
                entry.insert(Arc::new(Mutex::new(Room::new(id.clone(), creator.clone()))));
                counter!("duet_relay_rooms_created_total", 1);
                gauge!("duet_relay_rooms_active", self.rooms.len() as f64);
                info!(room_id = %id, created_by = %creator, "room created");
                return id;
            }
        }
    }

    /// Acquire exclusive access to one room.
    pub async fn lock(&self, room_id: &RoomId) -> Result<RoomGuard, RegistryError> {
        let slot = self
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::RoomNotFound)?;
        let room = Arc::clone(&slot).lock_owned().await;
        if room.closed {
            return Err(RegistryError::RoomNotFound);
        }
        Ok(RoomGuard {
            rooms: Arc::clone(&self.rooms),
            slot,
            room,
        })
    }

    pub async fn validate_join(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<(), RegistryError> {
        let guard = self.lock(room_id).await?;
        guard.validate_join(participant_id)
    }

    pub async fn add_member(&self, room_id: &RoomId, member: Member) -> Result<usize, RegistryError> {
        let mut guard = self.lock(room_id).await?;
        guard.add_member(member)
    }

    pub async fn remove_member(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> RemovalOutcome {
        match self.lock(room_id).await {
            Ok(mut guard) => guard.remove_member(participant_id),
            Err(_) => RemovalOutcome::absent(),
        }
    }

    pub async fn snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        let guard = self.lock(room_id).await.ok()?;
        Some(guard.snapshot())
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Delete empty rooms older than `max_age`. Returns how many were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        self.sweep_stale_at(Utc::now(), max_age)
    }

    fn sweep_stale_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let ids: Vec<RoomId> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        let mut swept = 0usize;
        for id in ids {
            let Some(slot) = self.rooms.get(&id).map(|entry| Arc::clone(entry.value())) else {
                continue;
            };
            // A busy room is in use; it will be checked on the next pass.
            let Ok(mut room) = Arc::clone(&slot).try_lock_owned() else {
                continue;
            };
            if room.closed || !room.members.is_empty() || now - room.created_at <= max_age {
                continue;
            }
            room.closed = true;
            if self
                .rooms
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &slot))
                .is_some()
            {
                swept += 1;
                counter!("duet_relay_rooms_deleted_total", 1, "reason" => "stale");
                debug!(room_id = %id, "swept stale room");
            }
        }
        if swept > 0 {
            gauge!("duet_relay_rooms_active", self.rooms.len() as f64);
            info!(swept, "stale room sweep finished");
        }
        swept
    }

    pub fn spawn_sweeper(&self, every: StdDuration, max_age: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(every);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                registry.sweep_stale(max_age);
            }
        })
    }
}

/// Exclusive handle on a single room. Dropping it releases the room lock.
pub struct RoomGuard {
    rooms: Arc<DashMap<RoomId, Arc<Mutex<Room>>>>,
    slot: Arc<Mutex<Room>>,
    room: OwnedMutexGuard<Room>,
}

impl RoomGuard {
    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn validate_join(&self, participant_id: &ParticipantId) -> Result<(), RegistryError> {
        let result = if self.room.member(participant_id).is_some() {
            Err(RegistryError::AlreadyMember)
        } else if self.room.members.len() >= ROOM_CAPACITY {
            Err(RegistryError::RoomFull)
        } else {
            Ok(())
        };
        if let Err(err) = &result {
            counter!("duet_relay_joins_rejected_total", 1, "reason" => err.metric_label());
        }
        result
    }

    /// Append a member that already passed `validate_join`. The checks are
    /// repeated so the capacity bound holds even for a careless caller.
    pub fn add_member(&mut self, member: Member) -> Result<usize, RegistryError> {
        self.validate_join(&member.participant_id)?;
        debug!(
            room_id = %self.room.id,
            participant_id = %member.participant_id,
            connection_id = %member.connection_id,
            "member added"
        );
        self.room.members.push(member);
        Ok(self.room.members.len())
    }

    /// Filter the participant out; an emptied room is deleted immediately.
    pub fn remove_member(&mut self, participant_id: &ParticipantId) -> RemovalOutcome {
        let previous = self.room.members.len();
        let removed = self
            .room
            .members
            .iter()
            .position(|m| &m.participant_id == participant_id)
            .map(|idx| self.room.members.remove(idx));
        let remaining = self.room.members.len();

        let mut room_deleted = false;
        if removed.is_some() && remaining == 0 {
            self.room.closed = true;
            let slot = &self.slot;
            room_deleted = self
                .rooms
                .remove_if(&self.room.id, |_, current| Arc::ptr_eq(current, slot))
                .is_some();
            if room_deleted {
                counter!("duet_relay_rooms_deleted_total", 1, "reason" => "empty");
                gauge!("duet_relay_rooms_active", self.rooms.len() as f64);
                info!(room_id = %self.room.id, "last member left; room deleted");
            }
        }

        RemovalOutcome {
            previous,
            remaining,
            removed,
            room_deleted,
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.room.id.clone(),
            created_by: self.room.created_by.clone(),
            created_at: self.room.created_at,
            members: self.room.members.clone(),
        }
    }
}
