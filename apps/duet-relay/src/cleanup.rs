use std::sync::Arc;

use dashmap::DashSet;
use duet_protocol::{ParticipantId, RoomId};

/// In-progress leave markers keyed by (participant, room). A second leave for
/// the same pair while the first is running is a no-op.
#[derive(Clone, Default)]
pub struct CleanupMarkers {
    active: Arc<DashSet<(ParticipantId, RoomId)>>,
}

impl CleanupMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, participant_id: &ParticipantId, room_id: &RoomId) -> Option<CleanupGuard> {
        let key = (participant_id.clone(), room_id.clone());
        if self.active.insert(key.clone()) {
            Some(CleanupGuard {
                active: Arc::clone(&self.active),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_active(&self, participant_id: &ParticipantId, room_id: &RoomId) -> bool {
        self.active
            .contains(&(participant_id.clone(), room_id.clone()))
    }
}

/// Releases the marker on drop, whichever way the cleanup exits.
pub struct CleanupGuard {
    active: Arc<DashSet<(ParticipantId, RoomId)>>,
    key: (ParticipantId, RoomId),
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}
