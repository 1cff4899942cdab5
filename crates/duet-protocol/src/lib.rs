//! Wire vocabulary shared by the duet relay and call clients.
//! Keeping this in a dedicated crate lets both sides (and any non-Rust
//! client) agree on a single JSON schema without pulling in runtime code.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated identity of a participant, issued by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque room token. Generated ids are UUID v4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDescriptor {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

impl ParticipantDescriptor {
    pub fn new(participant_id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// One network-path candidate in the shape browsers call `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Why a member left a room. Carried on `member-left` for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// Explicit `leave` from the participant.
    Left,
    /// The transport session ended.
    Disconnect,
    /// The participant joined another room.
    SwitchRoom,
    /// No traffic within the liveness window.
    HeartbeatTimeout,
    /// The relay is shutting down.
    Shutdown,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Left => "left",
            LeaveReason::Disconnect => "disconnect",
            LeaveReason::SwitchRoom => "switch-room",
            LeaveReason::HeartbeatTimeout => "heartbeat-timeout",
            LeaveReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    AlreadyMember,
    NotInRoom,
    InvalidMessage,
    Unauthorized,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "room-not-found",
            ErrorCode::RoomFull => "room-full",
            ErrorCode::AlreadyMember => "already-member",
            ErrorCode::NotInRoom => "not-in-room",
            ErrorCode::InvalidMessage => "invalid-message",
            ErrorCode::Unauthorized => "unauthorized",
        }
    }
}

/// Messages sent from a participant to the relay.
///
/// Relayed kinds carry no sender field: the relay stamps the authenticated
/// identity of the connection, and any `from` a client adds is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Join { room_id: RoomId },
    Leave { room_id: RoomId },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: CandidateInit },
    MediaToggle { kind: MediaKind, enabled: bool },
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Candidate { .. } => "candidate",
            ClientMessage::MediaToggle { .. } => "media-toggle",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Sent to members already present when someone new enters.
    MemberJoined {
        participant_id: ParticipantId,
        display_name: String,
    },
    /// Sent to the new arrival only; never lists the recipient itself.
    ExistingMembers {
        room_id: RoomId,
        members: Vec<ParticipantDescriptor>,
    },
    Offer {
        sdp: String,
        from: ParticipantDescriptor,
    },
    Answer {
        sdp: String,
        from: ParticipantDescriptor,
    },
    Candidate {
        candidate: CandidateInit,
        from: ParticipantDescriptor,
    },
    MediaToggle {
        kind: MediaKind,
        enabled: bool,
        from: ParticipantDescriptor,
    },
    MemberLeft {
        participant_id: ParticipantId,
        display_name: String,
        reason: LeaveReason,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn member_joined(member: &ParticipantDescriptor) -> Self {
        ServerMessage::MemberJoined {
            participant_id: member.participant_id.clone(),
            display_name: member.display_name.clone(),
        }
    }

    pub fn member_left(member: &ParticipantDescriptor, reason: LeaveReason) -> Self {
        ServerMessage::MemberLeft {
            participant_id: member.participant_id.clone(),
            display_name: member.display_name.clone(),
            reason,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::MemberJoined { .. } => "member-joined",
            ServerMessage::ExistingMembers { .. } => "existing-members",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Candidate { .. } => "candidate",
            ServerMessage::MediaToggle { .. } => "media-toggle",
            ServerMessage::MemberLeft { .. } => "member-left",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_left_uses_kebab_case_tag_and_reason() {
        let member = ParticipantDescriptor::new("bob", "Bob");
        let value = serde_json::to_value(ServerMessage::member_left(
            &member,
            LeaveReason::Disconnect,
        ))
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "member-left",
                "participantId": "bob",
                "displayName": "Bob",
                "reason": "disconnect",
            })
        );
    }

    #[test]
    fn client_supplied_sender_is_dropped_on_parse() {
        let raw = json!({
            "type": "offer",
            "sdp": "v=0",
            "from": { "participantId": "mallory", "displayName": "Mallory" },
        });
        let parsed: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Offer {
                sdp: "v=0".into()
            }
        );
    }

    #[test]
    fn candidate_init_matches_browser_field_names() {
        let raw = json!({
            "type": "candidate",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            },
        });
        let parsed: ClientMessage = serde_json::from_value(raw).unwrap();
        let ClientMessage::Candidate { candidate } = parsed else {
            panic!("expected candidate message");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn join_and_media_toggle_parse_camel_case_fields() {
        let join: ClientMessage =
            serde_json::from_value(json!({ "type": "join", "roomId": "r-1" })).unwrap();
        assert_eq!(join.kind(), "join");

        let toggle: ClientMessage = serde_json::from_value(json!({
            "type": "media-toggle",
            "kind": "video",
            "enabled": false,
        }))
        .unwrap();
        assert_eq!(
            toggle,
            ClientMessage::MediaToggle {
                kind: MediaKind::Video,
                enabled: false
            }
        );
    }

    #[test]
    fn generated_room_ids_are_distinct_uuids() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
