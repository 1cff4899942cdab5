//! Seams between the call core and whatever actually captures media and
//! runs the peer connection. The core only ever talks to these traits.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_protocol::{CandidateInit, MediaKind};
use tokio::sync::mpsc;

use crate::error::{CandidateError, MediaError, PeerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Coarse connection status derived from the backend's transport signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed | ConnectionStatus::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::New => "new",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the backend pushes to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(CandidateInit),
    Status(ConnectionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// One sample of outbound video transport statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportStats {
    pub round_trip_time: Option<Duration>,
    /// Cumulative since the session started.
    pub packets_sent: u64,
    /// Cumulative since the session started.
    pub packets_lost: u64,
    /// The selected path goes through a relay server.
    pub relayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingParameters {
    pub max_bitrate_bps: u64,
    /// `None` removes any frame-rate cap.
    pub max_framerate: Option<f64>,
}

/// Captured local tracks. Dropping the last handle does not stop capture;
/// call `stop`.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;
    fn set_enabled(&self, kind: MediaKind, enabled: bool);
    fn stop(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, audio: bool, video: bool) -> Result<Arc<dyn LocalMedia>, MediaError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), CandidateError>;
    async fn sample_stats(&self) -> Result<TransportStats, PeerError>;
    async fn apply_encoding(&self, parameters: EncodingParameters) -> Result<(), PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a peer connection carrying `media`. Backend events go to `events`.
    async fn create(
        &self,
        media: Arc<dyn LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
