use thiserror::Error;

/// Failure reported by the underlying media-session backend.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("peer connection closed")]
    Closed,
    #[error("peer backend error: {0}")]
    Backend(String),
}

/// Why a remote candidate could not be applied.
#[derive(Debug, Clone, Error)]
pub enum CandidateError {
    /// The path was torn down before the candidate arrived. Expected race.
    #[error("network path already closed")]
    PathClosed,
    #[error("candidate rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A negotiation step was attempted without local media. This is a defect
    /// in the caller, not a user-facing condition.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl NegotiationError {
    pub fn is_defect(&self) -> bool {
        matches!(self, NegotiationError::Precondition(_))
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported signaling url scheme: {0}")]
    Scheme(String),
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("signaling channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("call session has shut down")]
    SessionClosed,
}
