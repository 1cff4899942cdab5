use std::time::Duration;

use duet_protocol::{
    ClientMessage, ErrorCode, LeaveReason, ParticipantDescriptor, ParticipantId, RoomId,
    ServerMessage,
};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cleanup::CleanupMarkers;
use crate::connections::{ConnectionHub, ConnectionId};
use crate::participants::ParticipantDirectory;
use crate::registry::{Member, RegistryError, RoomRegistry};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("sender is not a member of any room")]
    NotInRoom,
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection superseded by a newer session for this participant")]
    Superseded,
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Registry(err) => err.code(),
            RelayError::NotInRoom => ErrorCode::NotInRoom,
            RelayError::UnknownConnection | RelayError::Superseded => ErrorCode::Unauthorized,
        }
    }
}

/// A freshly registered transport session. `outbound` yields everything the
/// relay wants delivered to this connection.
pub struct Connection {
    pub connection_id: ConnectionId,
    pub participant: ParticipantDescriptor,
    pub outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Another leave for the same participant and room was already running.
    pub skipped: bool,
    /// The registry membership actually changed.
    pub removed: bool,
    pub notified: usize,
    pub room_deleted: bool,
}

/// Server-side coordinator: room registry, presence, connection fan-out and
/// the idempotent leave path.
#[derive(Clone, Default)]
pub struct SignalingRelay {
    registry: RoomRegistry,
    participants: ParticipantDirectory,
    connections: ConnectionHub,
    cleanup: CleanupMarkers,
}

impl SignalingRelay {
    pub fn new(registry: RoomRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn participants(&self) -> &ParticipantDirectory {
        &self.participants
    }

    pub fn connections(&self) -> &ConnectionHub {
        &self.connections
    }

    /// Register a new transport session for an authenticated participant.
    pub fn connect(&self, participant: ParticipantDescriptor) -> Connection {
        let connection_id = Uuid::new_v4();
        let outbound = self
            .connections
            .register(connection_id, participant.clone());
        self.participants.connect(&participant, connection_id);
        info!(
            participant_id = %participant.participant_id,
            connection_id = %connection_id,
            "participant connected"
        );
        Connection {
            connection_id,
            participant,
            outbound,
        }
    }

    /// Dispatch one inbound message. Failures are reported to the sender only.
    pub async fn handle(&self, connection_id: ConnectionId, message: ClientMessage) {
        self.connections.touch(connection_id);
        let Some(participant) = self.connections.participant(connection_id) else {
            debug!(connection_id = %connection_id, "message from unregistered connection");
            return;
        };
        let kind = message.kind();

        let result = match message {
            ClientMessage::Join { room_id } => self
                .join(connection_id, &participant, &room_id)
                .await
                .map(|_| ()),
            ClientMessage::Leave { room_id } => {
                self.leave_connection(
                    &room_id,
                    &participant.participant_id,
                    LeaveReason::Left,
                    Some(connection_id),
                )
                .await;
                Ok(())
            }
            ClientMessage::Offer { sdp } => {
                self.forward(connection_id, &participant, |from| ServerMessage::Offer {
                    sdp,
                    from,
                })
                .await
            }
            ClientMessage::Answer { sdp } => {
                self.forward(connection_id, &participant, |from| ServerMessage::Answer {
                    sdp,
                    from,
                })
                .await
            }
            ClientMessage::Candidate { candidate } => {
                self.forward(connection_id, &participant, |from| {
                    ServerMessage::Candidate { candidate, from }
                })
                .await
            }
            ClientMessage::MediaToggle { kind, enabled } => {
                self.forward(connection_id, &participant, |from| {
                    ServerMessage::MediaToggle {
                        kind,
                        enabled,
                        from,
                    }
                })
                .await
            }
            ClientMessage::Ping => {
                self.connections
                    .send_direct(connection_id, ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(err) = result {
            debug!(
                connection_id = %connection_id,
                participant_id = %participant.participant_id,
                kind,
                error = %err,
                "request rejected"
            );
            self.connections.send_direct(
                connection_id,
                ServerMessage::error(err.code(), err.to_string()),
            );
        }
    }

    /// Enter a room. Returns the member count after the join.
    ///
    /// Validation, insertion and both notifications happen under the room
    /// lock, so the two members always observe each other consistently.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        participant: &ParticipantDescriptor,
        room_id: &RoomId,
    ) -> Result<usize, RelayError> {
        let participant_id = &participant.participant_id;
        // Membership stays with the connection that joined. A reconnect
        // waits for the old socket's teardown instead of taking the slot.
        if !self.participants.is_current(participant_id, connection_id) {
            return Err(RelayError::Superseded);
        }

        if let Some(previous) = self.participants.current_room(participant_id) {
            if &previous != room_id {
                // A rejected switch keeps the participant where they are.
                // The check takes and releases the target lock, so two rooms
                // are never held at once.
                self.registry.validate_join(room_id, participant_id).await?;
                self.leave_connection(
                    &previous,
                    participant_id,
                    LeaveReason::SwitchRoom,
                    Some(connection_id),
                )
                .await;
            }
        }

        let mut guard = self.registry.lock(room_id).await?;
        guard.validate_join(participant_id)?;
        let existing: Vec<Member> = guard.room().members().to_vec();
        let count = guard.add_member(Member::new(participant, connection_id))?;

        self.connections.attach(connection_id, room_id);
        self.participants
            .set_room(participant_id, connection_id, room_id);

        for member in &existing {
            self.connections.deliver(
                member.connection_id,
                room_id,
                ServerMessage::member_joined(participant),
            );
        }
        let members = existing
            .iter()
            .filter(|member| &member.participant_id != participant_id)
            .map(Member::descriptor)
            .collect();
        self.connections.deliver(
            connection_id,
            room_id,
            ServerMessage::ExistingMembers {
                room_id: room_id.clone(),
                members,
            },
        );
        drop(guard);

        counter!("duet_relay_joins_total", 1);
        info!(
            room_id = %room_id,
            participant_id = %participant_id,
            members = count,
            "participant joined room"
        );
        Ok(count)
    }

    /// Relay a negotiation message to the other member(s) of the sender's room,
    /// stamped with the sender's authenticated identity.
    async fn forward<F>(
        &self,
        connection_id: ConnectionId,
        sender: &ParticipantDescriptor,
        build: F,
    ) -> Result<(), RelayError>
    where
        F: FnOnce(ParticipantDescriptor) -> ServerMessage,
    {
        let room_id = self
            .connections
            .attached_room(connection_id)
            .ok_or(RelayError::NotInRoom)?;
        let guard = self
            .registry
            .lock(&room_id)
            .await
            .map_err(|_| RelayError::NotInRoom)?;
        let is_member = guard
            .room()
            .member(&sender.participant_id)
            .map(|member| member.connection_id == connection_id)
            .unwrap_or(false);
        if !is_member {
            return Err(RelayError::NotInRoom);
        }

        let message = build(sender.clone());
        let kind = message.kind();
        let mut delivered = 0usize;
        for member in guard
            .room()
            .members()
            .iter()
            .filter(|member| member.participant_id != sender.participant_id)
        {
            if self
                .connections
                .deliver(member.connection_id, &room_id, message.clone())
            {
                delivered += 1;
            }
        }
        counter!("duet_relay_messages_relayed_total", 1, "kind" => kind);
        debug!(
            room_id = %room_id,
            from = %sender.participant_id,
            kind,
            delivered,
            "relayed message"
        );
        Ok(())
    }

    /// Idempotent leave for a participant and room.
    pub async fn leave(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
        reason: LeaveReason,
    ) -> LeaveOutcome {
        let connection_id = self
            .participants
            .get(participant_id)
            .map(|record| record.connection_id);
        self.leave_connection(room_id, participant_id, reason, connection_id)
            .await
    }

    /// Leave on behalf of a specific connection. When `connection_id` is set,
    /// membership held by a different connection of the same participant is
    /// left alone.
    async fn leave_connection(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
        reason: LeaveReason,
        connection_id: Option<ConnectionId>,
    ) -> LeaveOutcome {
        let Some(_marker) = self.cleanup.try_acquire(participant_id, room_id) else {
            debug!(
                room_id = %room_id,
                participant_id = %participant_id,
                reason = %reason,
                "leave already in progress"
            );
            return LeaveOutcome {
                skipped: true,
                ..LeaveOutcome::default()
            };
        };
        let mut outcome = LeaveOutcome::default();

        // 1. detach from room transport
        if let Some(connection_id) = connection_id {
            self.connections.detach(connection_id, room_id);
        }

        // 2. registry update and peer notification
        match self.registry.lock(room_id).await {
            Ok(mut guard) => {
                let held_by = guard
                    .room()
                    .member(participant_id)
                    .map(|member| member.connection_id);
                let owned = match (held_by, connection_id) {
                    (Some(holder), Some(requester)) => holder == requester,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if owned {
                    let removal = guard.remove_member(participant_id);
                    outcome.removed = removal.changed();
                    outcome.room_deleted = removal.room_deleted;
                    if let Some(departed) = removal.removed.as_ref().map(Member::descriptor) {
                        for member in guard.room().members() {
                            if self.connections.deliver(
                                member.connection_id,
                                room_id,
                                ServerMessage::member_left(&departed, reason),
                            ) {
                                outcome.notified += 1;
                            }
                        }
                    }
                } else if held_by.is_some() {
                    debug!(
                        room_id = %room_id,
                        participant_id = %participant_id,
                        "membership held by a newer connection; not removing"
                    );
                }
            }
            Err(err) => {
                debug!(
                    room_id = %room_id,
                    participant_id = %participant_id,
                    error = %err,
                    "leave for room that no longer exists"
                );
            }
        }

        // 3. clear the presence record's room
        self.participants.clear_room(participant_id, room_id);

        if outcome.removed {
            counter!("duet_relay_leaves_total", 1, "reason" => reason.as_str());
            info!(
                room_id = %room_id,
                participant_id = %participant_id,
                reason = %reason,
                notified = outcome.notified,
                room_deleted = outcome.room_deleted,
                "participant left room"
            );
        }
        outcome
    }

    /// Transport for `connection_id` is gone. Routed through the same leave path.
    pub async fn disconnect(&self, connection_id: ConnectionId, reason: LeaveReason) -> bool {
        let Some(participant) = self.connections.participant(connection_id) else {
            return false;
        };
        let participant_id = participant.participant_id.clone();
        let room = self.connections.attached_room(connection_id).or_else(|| {
            self.participants
                .get(&participant_id)
                .filter(|record| record.connection_id == connection_id)
                .and_then(|record| record.room_id)
        });

        if let Some(room_id) = room {
            self.leave_connection(&room_id, &participant_id, reason, Some(connection_id))
                .await;
        }
        self.connections.unregister(connection_id);
        self.participants.disconnect(&participant_id, connection_id);
        info!(
            participant_id = %participant_id,
            connection_id = %connection_id,
            reason = %reason,
            "participant disconnected"
        );
        true
    }

    /// Treat connections that have been silent past `timeout` as lost.
    pub async fn evict_stale(&self, timeout: Duration) -> usize {
        let stale = self.connections.stale(timeout);
        let mut evicted = 0usize;
        for connection_id in stale {
            warn!(connection_id = %connection_id, "heartbeat timeout; dropping connection");
            if self
                .disconnect(connection_id, LeaveReason::HeartbeatTimeout)
                .await
            {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn spawn_heartbeat_monitor(&self, timeout: Duration) -> JoinHandle<()> {
        let relay = self.clone();
        let period = (timeout / 3).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                relay.evict_stale(timeout).await;
            }
        })
    }

    /// Leave every room on behalf of every connection.
    pub async fn shutdown(&self) -> usize {
        let ids = self.connections.ids();
        let mut closed = 0usize;
        for connection_id in ids {
            if self.disconnect(connection_id, LeaveReason::Shutdown).await {
                closed += 1;
            }
        }
        info!(closed, "relay connections drained");
        closed
    }
}
