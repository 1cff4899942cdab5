use std::collections::VecDeque;

use duet_protocol::CandidateInit;

use crate::error::CandidateError;
use crate::media::PeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Queued,
    Applied,
    /// Path already closed; silently discarded.
    Dropped,
    /// Backend refused it; logged as a warning.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Holds remote candidates until a remote description exists, then applies
/// them in arrival order.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<CandidateInit>,
    remote_description_set: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    pub async fn enqueue_or_apply(
        &mut self,
        peer: &dyn PeerConnection,
        candidate: CandidateInit,
    ) -> CandidateDisposition {
        if !self.remote_description_set {
            self.pending.push_back(candidate);
            tracing::trace!(
                target = "duet::candidates",
                queued = self.pending.len(),
                "queued remote candidate until description is set"
            );
            return CandidateDisposition::Queued;
        }
        apply(peer, candidate).await
    }

    /// Apply everything queued, oldest first. The queue is taken before the
    /// first apply so anything enqueued meanwhile waits for the next flush.
    pub async fn flush(&mut self, peer: &dyn PeerConnection) -> FlushReport {
        let batch = std::mem::take(&mut self.pending);
        let mut report = FlushReport::default();
        for candidate in batch {
            match apply(peer, candidate).await {
                CandidateDisposition::Applied => report.applied += 1,
                CandidateDisposition::Dropped => report.dropped += 1,
                CandidateDisposition::Failed => report.failed += 1,
                CandidateDisposition::Queued => {}
            }
        }
        if report != FlushReport::default() {
            tracing::debug!(
                target = "duet::candidates",
                applied = report.applied,
                dropped = report.dropped,
                failed = report.failed,
                "flushed buffered candidates"
            );
        }
        report
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.remote_description_set = false;
    }
}

async fn apply(peer: &dyn PeerConnection, candidate: CandidateInit) -> CandidateDisposition {
    match peer.add_candidate(candidate).await {
        Ok(()) => CandidateDisposition::Applied,
        Err(CandidateError::PathClosed) => {
            tracing::trace!(target = "duet::candidates", "candidate arrived after path closed");
            CandidateDisposition::Dropped
        }
        Err(err @ CandidateError::Rejected(_)) => {
            tracing::warn!(
                target = "duet::candidates",
                error = %err,
                "failed to apply remote candidate"
            );
            CandidateDisposition::Failed
        }
    }
}
