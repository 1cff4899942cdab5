use std::fmt;
use std::sync::Arc;

use duet_protocol::CandidateInit;

use crate::candidates::{CandidateBuffer, CandidateDisposition};
use crate::error::NegotiationError;
use crate::media::{ConnectionStatus, LocalMedia, PeerConnection, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    /// Caller sent its offer and waits for the answer.
    HaveLocalOffer,
    /// Caller applied the answer; waiting for the path to come up.
    HaveRemoteAnswer,
    /// Joiner applied the offer and sent its answer.
    HaveLocalAnswer,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteAnswer => "have-remote-answer",
            NegotiationState::HaveLocalAnswer => "have-local-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns one peer connection for one counterpart, plus its candidate buffer.
pub struct Negotiator {
    peer: Arc<dyn PeerConnection>,
    media: Arc<dyn LocalMedia>,
    state: NegotiationState,
    status: ConnectionStatus,
    candidates: CandidateBuffer,
}

impl Negotiator {
    /// Refuses to build without captured local tracks.
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        media: Arc<dyn LocalMedia>,
    ) -> Result<Self, NegotiationError> {
        if media.tracks().is_empty() {
            return Err(NegotiationError::Precondition(
                "negotiation requires captured local media",
            ));
        }
        Ok(Self {
            peer,
            media,
            state: NegotiationState::Idle,
            status: ConnectionStatus::New,
            candidates: CandidateBuffer::new(),
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn peer(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.peer)
    }

    fn invalid(&self, operation: &'static str) -> NegotiationError {
        NegotiationError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    fn require_media(&self) -> Result<(), NegotiationError> {
        if self.media.tracks().is_empty() {
            return Err(NegotiationError::Precondition(
                "local media was released before negotiation",
            ));
        }
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(self.invalid("create_offer"));
        }
        self.require_media()?;
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.state = NegotiationState::HaveLocalOffer;
        tracing::debug!(target = "duet::negotiation", "local offer set");
        Ok(offer)
    }

    /// Joiner path: apply the offer, flush buffered candidates, answer.
    pub async fn apply_remote_offer(
        &mut self,
        sdp: String,
    ) -> Result<SessionDescription, NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(self.invalid("apply_remote_offer"));
        }
        self.require_media()?;
        self.peer
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.candidates.mark_remote_description_set();
        self.candidates.flush(self.peer.as_ref()).await;

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.state = NegotiationState::HaveLocalAnswer;
        tracing::debug!(target = "duet::negotiation", "remote offer applied; answer set");
        Ok(answer)
    }

    /// Caller path. Returns `false` when the answer was ignored because no
    /// offer is outstanding (duplicate or stray delivery).
    pub async fn apply_remote_answer(&mut self, sdp: String) -> Result<bool, NegotiationError> {
        if self.state != NegotiationState::HaveLocalOffer {
            tracing::debug!(
                target = "duet::negotiation",
                state = %self.state,
                "ignoring answer with no outstanding offer"
            );
            return Ok(false);
        }
        self.peer
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.state = NegotiationState::HaveRemoteAnswer;
        self.candidates.mark_remote_description_set();
        self.candidates.flush(self.peer.as_ref()).await;
        tracing::debug!(target = "duet::negotiation", "remote answer applied");
        Ok(true)
    }

    pub async fn add_remote_candidate(&mut self, candidate: CandidateInit) -> CandidateDisposition {
        if self.state.is_terminal() {
            return CandidateDisposition::Dropped;
        }
        self.candidates
            .enqueue_or_apply(self.peer.as_ref(), candidate)
            .await
    }

    /// Fold a backend status change into the negotiation state. Returns true
    /// when the status is terminal for this negotiation.
    pub fn observe(&mut self, status: ConnectionStatus) -> bool {
        if self.state.is_terminal() {
            return true;
        }
        self.status = status;
        match status {
            ConnectionStatus::Connected => {
                if matches!(
                    self.state,
                    NegotiationState::HaveRemoteAnswer | NegotiationState::HaveLocalAnswer
                ) {
                    self.state = NegotiationState::Connected;
                    tracing::info!(target = "duet::negotiation", "peer path connected");
                }
                false
            }
            ConnectionStatus::Failed => {
                self.state = NegotiationState::Failed;
                true
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Closed => {
                self.state = NegotiationState::Closed;
                true
            }
            ConnectionStatus::New | ConnectionStatus::Connecting => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiationState::Connected
    }

    /// Close the peer connection and drop buffered candidates.
    pub async fn close(&mut self) {
        self.peer.close().await;
        self.candidates.clear();
        if !self.state.is_terminal() {
            self.state = NegotiationState::Closed;
        }
        self.status = ConnectionStatus::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackMedia, LoopbackPeer, LoopbackPeerFactory, PeerOp};
    use crate::media::{PeerConnectionFactory, SdpKind};
    use tokio::sync::mpsc;

    async fn negotiator() -> (Negotiator, Arc<LoopbackPeer>, Arc<LoopbackMedia>) {
        let factory = LoopbackPeerFactory::manual("neg");
        let media = Arc::new(LoopbackMedia::audio_and_video());
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = factory.create(media.clone(), tx).await.unwrap();
        let negotiator = Negotiator::new(peer, media.clone()).unwrap();
        (negotiator, factory.latest().unwrap(), media)
    }

    #[tokio::test]
    async fn construction_without_tracks_is_a_precondition_failure() {
        let factory = LoopbackPeerFactory::manual("neg");
        let media = Arc::new(LoopbackMedia::audio_and_video());
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = factory.create(media.clone(), tx).await.unwrap();

        let empty = Arc::new(LoopbackMedia::new(Vec::new()));
        let err = Negotiator::new(peer, empty).err().unwrap();
        assert!(err.is_defect());
    }

    #[tokio::test]
    async fn offer_after_media_release_is_a_precondition_failure() {
        let (mut negotiator, _peer, media) = negotiator().await;
        media.stop();
        let err = negotiator.create_offer().await.unwrap_err();
        assert!(matches!(err, NegotiationError::Precondition(_)));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn caller_flow_reaches_connected() {
        let (mut negotiator, peer, _media) = negotiator().await;
        negotiator.create_offer().await.unwrap();
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalOffer);
        assert!(negotiator.create_offer().await.is_err());

        negotiator
            .add_remote_candidate(CandidateInit::new("candidate:early"))
            .await;
        assert_eq!(negotiator.pending_candidates(), 1);

        assert!(negotiator.apply_remote_answer("v=0 answer".into()).await.unwrap());
        assert_eq!(negotiator.state(), NegotiationState::HaveRemoteAnswer);
        assert_eq!(peer.applied_candidates(), vec!["candidate:early"]);

        assert!(!negotiator.observe(ConnectionStatus::Connecting));
        assert!(!negotiator.observe(ConnectionStatus::Connected));
        assert!(negotiator.is_connected());
    }

    #[tokio::test]
    async fn duplicate_or_unsolicited_answer_is_ignored() {
        let (mut negotiator, peer, _media) = negotiator().await;
        assert!(!negotiator.apply_remote_answer("v=0".into()).await.unwrap());
        assert_eq!(negotiator.state(), NegotiationState::Idle);

        negotiator.create_offer().await.unwrap();
        assert!(negotiator.apply_remote_answer("v=0".into()).await.unwrap());
        assert!(!negotiator.apply_remote_answer("v=0".into()).await.unwrap());
        let remote_sets = peer
            .ops()
            .into_iter()
            .filter(|op| matches!(op, PeerOp::SetRemote(_)))
            .count();
        assert_eq!(remote_sets, 1);
    }

    #[tokio::test]
    async fn joiner_applies_offer_flushes_then_answers() {
        let (mut negotiator, peer, _media) = negotiator().await;
        for n in 1..=3 {
            negotiator
                .add_remote_candidate(CandidateInit::new(format!("candidate:{n}")))
                .await;
        }
        let answer = negotiator.apply_remote_offer("v=0 offer".into()).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalAnswer);

        let ops = peer.ops();
        assert_eq!(ops[0], PeerOp::SetRemote(SdpKind::Offer));
        assert_eq!(
            &ops[1..4],
            &[
                PeerOp::AddCandidate("candidate:1".into()),
                PeerOp::AddCandidate("candidate:2".into()),
                PeerOp::AddCandidate("candidate:3".into()),
            ]
        );
        assert_eq!(ops[4], PeerOp::CreateAnswer);
    }

    #[tokio::test]
    async fn transport_loss_is_terminal_but_not_fatal() {
        let (mut negotiator, _peer, _media) = negotiator().await;
        negotiator.create_offer().await.unwrap();
        assert!(negotiator.observe(ConnectionStatus::Failed));
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        negotiator.close().await;
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        assert_eq!(
            negotiator
                .add_remote_candidate(CandidateInit::new("late"))
                .await,
            CandidateDisposition::Dropped
        );
    }
}
