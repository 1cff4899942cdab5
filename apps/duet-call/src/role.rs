use duet_protocol::{ParticipantDescriptor, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Unset,
    /// Was in the room first; drives negotiation.
    Caller,
    /// Arrived second; waits for the offer.
    Joiner,
}

/// What the session should do after the resolver processed an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleDecision {
    /// Become the caller and send an offer to this participant.
    StartOffer(ParticipantDescriptor),
    /// Become the joiner and wait for an offer from this participant.
    AwaitOffer(ParticipantDescriptor),
    /// Alone in the room.
    Waiting,
    /// The counterpart is gone; roles and identity were reset.
    CounterpartLeft(ParticipantDescriptor),
    Ignored,
}

/// Caller/joiner assignment and the one-way remote identity lock.
///
/// The local participant can never become the remote identity; every
/// assignment path goes through `assign`.
#[derive(Debug, Clone)]
pub struct RoleResolver {
    local: ParticipantId,
    role: Role,
    remote: Option<ParticipantDescriptor>,
    locked: bool,
}

impl RoleResolver {
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            role: Role::Unset,
            remote: None,
            locked: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> Option<&ParticipantDescriptor> {
        self.remote.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn assign(&mut self, candidate: &ParticipantDescriptor) -> bool {
        if candidate.participant_id == self.local {
            tracing::error!(
                target = "duet::role",
                participant_id = %candidate.participant_id,
                "refusing to adopt own identity as remote participant"
            );
            return false;
        }
        self.remote = Some(candidate.clone());
        self.locked = true;
        true
    }

    /// Someone entered after us: we are the caller.
    pub fn on_member_joined(&mut self, arrival: &ParticipantDescriptor) -> RoleDecision {
        if self.locked {
            tracing::debug!(
                target = "duet::role",
                participant_id = %arrival.participant_id,
                "member-joined while identity locked; ignoring"
            );
            return RoleDecision::Ignored;
        }
        if !self.assign(arrival) {
            return RoleDecision::Ignored;
        }
        self.role = Role::Caller;
        tracing::info!(
            target = "duet::role",
            remote = %arrival.participant_id,
            "role resolved: caller"
        );
        RoleDecision::StartOffer(arrival.clone())
    }

    /// The join acknowledgement: a non-empty list makes us the joiner.
    pub fn on_existing_members(&mut self, members: &[ParticipantDescriptor]) -> RoleDecision {
        let Some(first) = members.first() else {
            return RoleDecision::Waiting;
        };
        if self.locked {
            return RoleDecision::Ignored;
        }
        if !self.assign(first) {
            return RoleDecision::Ignored;
        }
        self.role = Role::Joiner;
        tracing::info!(
            target = "duet::role",
            remote = %first.participant_id,
            "role resolved: joiner"
        );
        RoleDecision::AwaitOffer(first.clone())
    }

    /// Fallback identity source when an offer or answer arrives before any
    /// locking event. Returns true when the identity was adopted.
    pub fn on_negotiation_sender(&mut self, sender: &ParticipantDescriptor, is_offer: bool) -> bool {
        if self.locked {
            return false;
        }
        if !self.assign(sender) {
            return false;
        }
        if self.role == Role::Unset {
            self.role = if is_offer { Role::Joiner } else { Role::Caller };
        }
        tracing::debug!(
            target = "duet::role",
            remote = %sender.participant_id,
            role = ?self.role,
            "remote identity adopted from negotiation sender"
        );
        true
    }

    /// Counterpart departure: the only event that unlocks the identity.
    pub fn on_member_left(&mut self, departed: &ParticipantId) -> RoleDecision {
        match &self.remote {
            Some(remote) if &remote.participant_id != departed => RoleDecision::Ignored,
            _ => {
                let previous = self.remote.take();
                self.locked = false;
                self.role = Role::Unset;
                match previous {
                    Some(remote) => RoleDecision::CounterpartLeft(remote),
                    None => RoleDecision::Ignored,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.role = Role::Unset;
        self.remote = None;
        self.locked = false;
    }
}
