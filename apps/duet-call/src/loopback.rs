//! In-process media backend. Produces synthetic descriptions and candidates,
//! records every call, and reports `connected` once both descriptions are in
//! place. Used for tests and for exercising the session without real media.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use duet_protocol::{CandidateInit, MediaKind};
use tokio::sync::{mpsc, watch};

use crate::error::{CandidateError, MediaError, PeerError};
use crate::media::{
    ConnectionStatus, EncodingParameters, LocalMedia, LocalTrack, MediaDevices, PeerConnection,
    PeerConnectionFactory, PeerEvent, SdpKind, SessionDescription, TransportStats,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LoopbackMedia {
    tracks: Vec<LocalTrack>,
    audio: AtomicBool,
    video: AtomicBool,
    stopped: AtomicBool,
}

impl LoopbackMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn audio_and_video() -> Self {
        Self::new(vec![
            LocalTrack {
                id: "loopback-audio".into(),
                kind: MediaKind::Audio,
            },
            LocalTrack {
                id: "loopback-video".into(),
                kind: MediaKind::Video,
            },
        ])
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio.load(Ordering::SeqCst),
            MediaKind::Video => self.video.load(Ordering::SeqCst),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMedia for LoopbackMedia {
    fn tracks(&self) -> Vec<LocalTrack> {
        if self.is_stopped() {
            return Vec::new();
        }
        self.tracks.clone()
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio.store(enabled, Ordering::SeqCst),
            MediaKind::Video => self.video.store(enabled, Ordering::SeqCst),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hands out `LoopbackMedia`, or fails when built with `denied`.
#[derive(Default)]
pub struct LoopbackDevices {
    deny: bool,
    acquired: Mutex<Vec<Arc<LoopbackMedia>>>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> Vec<Arc<LoopbackMedia>> {
        lock(&self.acquired).clone()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn acquire(&self, audio: bool, video: bool) -> Result<Arc<dyn LocalMedia>, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        let media = LoopbackMedia::audio_and_video();
        media.set_enabled(MediaKind::Audio, audio);
        media.set_enabled(MediaKind::Video, video);
        let media = Arc::new(media);
        lock(&self.acquired).push(Arc::clone(&media));
        Ok(media)
    }
}

/// Every operation a `LoopbackPeer` has seen, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    ApplyEncoding(EncodingParameters),
    Close,
}

pub struct LoopbackPeer {
    label: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    ops: Mutex<Vec<PeerOp>>,
    stats: Mutex<TransportStats>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
    auto_connect: bool,
    reject_candidates: AtomicBool,
    sdp_counter: AtomicU64,
    /// Offer and answer creation wait until this reads `true`.
    gate: watch::Sender<bool>,
}

impl LoopbackPeer {
    fn new(
        label: String,
        events: mpsc::UnboundedSender<PeerEvent>,
        auto_connect: bool,
        held: bool,
    ) -> Self {
        Self {
            label,
            events,
            ops: Mutex::new(Vec::new()),
            stats: Mutex::new(TransportStats::default()),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auto_connect,
            reject_candidates: AtomicBool::new(false),
            sdp_counter: AtomicU64::new(0),
            gate: watch::Sender::new(!held),
        }
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        lock(&self.ops).clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *lock(&self.stats) = stats;
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.reject_candidates.store(reject, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Let held offer and answer creation proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Some negotiation step is parked on the gate.
    pub fn is_waiting(&self) -> bool {
        self.gate.receiver_count() > 0
    }

    async fn pass_gate(&self) {
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }

    /// Push a backend event as if the transport produced it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, op: PeerOp) {
        lock(&self.ops).push(op);
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn next_sdp(&self, kind: &str) -> String {
        let n = self.sdp_counter.fetch_add(1, Ordering::SeqCst);
        format!("v=0 o={} {} {}", self.label, kind, n)
    }

    fn maybe_connect(&self) {
        if self.auto_connect
            && self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
        {
            self.emit(PeerEvent::Status(ConnectionStatus::Connecting));
            self.emit(PeerEvent::Status(ConnectionStatus::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.pass_gate().await;
        self.ensure_open()?;
        self.record(PeerOp::CreateOffer);
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.pass_gate().await;
        self.ensure_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::Backend("answer requires a remote offer".into()));
        }
        self.record(PeerOp::CreateAnswer);
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::SetLocal(description.kind));
        self.local_set.store(true, Ordering::SeqCst);
        self.emit(PeerEvent::LocalCandidate(CandidateInit {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host", self.label),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::SetRemote(description.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_candidate(&self, candidate: CandidateInit) -> Result<(), CandidateError> {
        if self.is_closed() {
            return Err(CandidateError::PathClosed);
        }
        if self.reject_candidates.load(Ordering::SeqCst) {
            return Err(CandidateError::Rejected(candidate.candidate));
        }
        self.record(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn sample_stats(&self) -> Result<TransportStats, PeerError> {
        self.ensure_open()?;
        Ok(*lock(&self.stats))
    }

    async fn apply_encoding(&self, parameters: EncodingParameters) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.record(PeerOp::ApplyEncoding(parameters));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(PeerOp::Close);
            self.emit(PeerEvent::Status(ConnectionStatus::Closed));
        }
    }
}

/// Builds `LoopbackPeer`s and keeps them for inspection.
pub struct LoopbackPeerFactory {
    label: String,
    auto_connect: bool,
    held: bool,
    created: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl LoopbackPeerFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            auto_connect: true,
            held: false,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Peers never report `connected` on their own; tests drive status via `emit`.
    pub fn manual(label: impl Into<String>) -> Self {
        Self {
            auto_connect: false,
            ..Self::new(label)
        }
    }

    /// Offer and answer creation stall until the peer's `release` is called.
    pub fn held(label: impl Into<String>) -> Self {
        Self {
            held: true,
            ..Self::new(label)
        }
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        lock(&self.created).clone()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackPeer>> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        media: Arc<dyn LocalMedia>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if media.tracks().is_empty() {
            return Err(PeerError::Backend("no local tracks to send".into()));
        }
        let mut created = lock(&self.created);
        let label = format!("{}-{}", self.label, created.len());
        let peer = Arc::new(LoopbackPeer::new(
            label,
            events,
            self.auto_connect,
            self.held,
        ));
        created.push(Arc::clone(&peer));
        Ok(peer)
    }
}
