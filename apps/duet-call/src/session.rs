//! The call session actor. One task owns every piece of mutable call state;
//! callers talk to it through `CallHandle` and watch `CallSnapshot`s.

use std::sync::{Arc, Mutex};

use duet_protocol::{
    ClientMessage, ErrorCode, MediaKind, ParticipantDescriptor, RoomId, ServerMessage,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bitrate::{spawn_controller, BitratePolicy};
use crate::error::{CallError, NegotiationError, SignalingError};
use crate::media::{ConnectionStatus, LocalMedia, MediaDevices, PeerConnectionFactory, PeerEvent};
use crate::negotiation::{NegotiationState, Negotiator};
use crate::role::{Role, RoleDecision, RoleResolver};
use crate::signaling::SignalingChannel;

/// Everything a session needs besides its signaling channel.
pub struct CallDeps {
    pub local: ParticipantDescriptor,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub bitrate: BitratePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFlags {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaFlags {
    fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio = enabled,
            MediaKind::Video => self.video = enabled,
        }
    }
}

/// Read-only view of the session, republished after every event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSnapshot {
    pub epoch: u64,
    pub room_id: Option<RoomId>,
    pub joined: bool,
    pub role: Role,
    pub remote: Option<ParticipantDescriptor>,
    pub identity_locked: bool,
    pub negotiation: NegotiationState,
    pub connection: ConnectionStatus,
    pub pending_candidates: usize,
    pub local_media: MediaFlags,
    pub remote_media: MediaFlags,
    pub bitrate_active: bool,
    pub last_error: Option<String>,
}

enum Command {
    Join {
        room_id: RoomId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    SetMedia {
        kind: MediaKind,
        enabled: bool,
    },
    /// Leave was already queued on the signaling channel by `teardown_now`.
    Teardown,
}

struct PeerInput {
    epoch: u64,
    event: PeerEvent,
}

/// One peer connection's lifetime. Replaced whenever the counterpart or the
/// path goes away.
struct Epoch {
    id: u64,
    negotiator: Negotiator,
    cancel: CancellationToken,
    bitrate: Option<(CancellationToken, JoinHandle<()>)>,
    forwarder: JoinHandle<()>,
}

impl Epoch {
    fn stop_bitrate(&mut self) {
        if let Some((cancel, handle)) = self.bitrate.take() {
            cancel.cancel();
            handle.abort();
        }
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        self.stop_bitrate();
        self.forwarder.abort();
        self.negotiator.close().await;
    }
}

struct ActiveCall {
    room_id: RoomId,
    joined: bool,
    media: Arc<dyn LocalMedia>,
    epoch: Option<Epoch>,
}

pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    signaling: mpsc::UnboundedSender<ClientMessage>,
    current: Arc<Mutex<CancellationToken>>,
}

/// Start the session task for `deps.local` over `channel`.
pub fn spawn_call(deps: CallDeps, channel: SignalingChannel) -> CallHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
    let current = Arc::new(Mutex::new(CancellationToken::new()));

    let actor = CallActor {
        resolver: RoleResolver::new(deps.local.participant_id.clone()),
        deps,
        outbound: channel.outbound.clone(),
        active: None,
        next_epoch: 0,
        local_media: MediaFlags::default(),
        remote_media: MediaFlags::default(),
        last_error: None,
        snapshot: snapshot_tx,
        current: Arc::clone(&current),
        peer_tx,
    };
    tokio::spawn(actor.run(commands_rx, channel.inbound, peer_rx));

    CallHandle {
        commands: commands_tx,
        snapshot: snapshot_rx,
        signaling: channel.outbound,
        current,
    }
}

impl CallHandle {
    pub async fn join(&self, room_id: RoomId) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join { room_id, reply })
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Leave the room and release media. In-flight negotiation is abandoned.
    pub async fn leave(&self) -> Result<(), CallError> {
        self.cancel_current();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave { reply })
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    pub fn set_media(&self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        self.commands
            .send(Command::SetMedia { kind, enabled })
            .map_err(|_| CallError::SessionClosed)
    }

    /// Best-effort teardown for process exit: queues `leave` and cancels work
    /// without waiting for anything.
    pub fn teardown_now(&self) {
        self.cancel_current();
        let room = self.snapshot.borrow().room_id.clone();
        if let Some(room_id) = room {
            let _ = self.signaling.send(ClientMessage::Leave { room_id });
        }
        let _ = self.commands.send(Command::Teardown);
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_until<F>(&self, predicate: F) -> Result<CallSnapshot, CallError>
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| CallError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    fn cancel_current(&self) {
        if let Ok(token) = self.current.lock() {
            token.cancel();
        }
    }
}

struct CallActor {
    deps: CallDeps,
    resolver: RoleResolver,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    active: Option<ActiveCall>,
    next_epoch: u64,
    local_media: MediaFlags,
    remote_media: MediaFlags,
    last_error: Option<String>,
    snapshot: watch::Sender<CallSnapshot>,
    current: Arc<Mutex<CancellationToken>>,
    peer_tx: mpsc::UnboundedSender<PeerInput>,
}

impl CallActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
        mut peer_events: mpsc::UnboundedReceiver<PeerInput>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown(true).await;
                        break;
                    }
                },
                message = inbound.recv() => match message {
                    Some(message) => self.on_server_message(message).await,
                    None => {
                        tracing::warn!(target = "duet::session", "signaling channel closed");
                        self.last_error = Some(SignalingError::Closed.to_string());
                        self.teardown(false).await;
                        self.publish();
                        break;
                    }
                },
                Some(input) = peer_events.recv() => self.on_peer_event(input).await,
            }
            self.publish();
        }
        tracing::debug!(target = "duet::session", "call session stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join { room_id, reply } => {
                let result = self.join(room_id).await;
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                self.teardown(true).await;
                let _ = reply.send(());
            }
            Command::SetMedia { kind, enabled } => self.set_media(kind, enabled),
            Command::Teardown => self.teardown(false).await,
        }
    }

    async fn join(&mut self, room_id: RoomId) -> Result<(), CallError> {
        if let Some(active) = &self.active {
            if active.room_id == room_id {
                return Ok(());
            }
            tracing::info!(
                target = "duet::session",
                from = %active.room_id,
                to = %room_id,
                "switching rooms"
            );
            self.teardown(true).await;
        }
        self.last_error = None;

        let media = self.deps.devices.acquire(true, true).await?;
        media.set_enabled(MediaKind::Audio, self.local_media.audio);
        media.set_enabled(MediaKind::Video, self.local_media.video);

        let epoch = match self.open_epoch(Arc::clone(&media)).await {
            Ok(epoch) => epoch,
            Err(err) => {
                media.stop();
                return Err(err);
            }
        };
        if self
            .outbound
            .send(ClientMessage::Join {
                room_id: room_id.clone(),
            })
            .is_err()
        {
            epoch.shutdown().await;
            media.stop();
            return Err(SignalingError::Closed.into());
        }
        tracing::info!(target = "duet::session", room_id = %room_id, "joining room");
        self.active = Some(ActiveCall {
            room_id,
            joined: false,
            media,
            epoch: Some(epoch),
        });
        Ok(())
    }

    /// Fresh peer connection, negotiator and cancellation scope.
    async fn open_epoch(&mut self, media: Arc<dyn LocalMedia>) -> Result<Epoch, CallError> {
        self.next_epoch += 1;
        let id = self.next_epoch;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let peer_tx = self.peer_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if peer_tx.send(PeerInput { epoch: id, event }).is_err() {
                    break;
                }
            }
        });

        let peer = match self.deps.peers.create(Arc::clone(&media), events_tx).await {
            Ok(peer) => peer,
            Err(err) => {
                forwarder.abort();
                return Err(err.into());
            }
        };
        let negotiator = match Negotiator::new(Arc::clone(&peer), media) {
            Ok(negotiator) => negotiator,
            Err(err) => {
                forwarder.abort();
                peer.close().await;
                return Err(err.into());
            }
        };

        let cancel = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = cancel.clone();
        }
        tracing::debug!(target = "duet::session", epoch = id, "opened peer epoch");
        Ok(Epoch {
            id,
            negotiator,
            cancel,
            bitrate: None,
            forwarder,
        })
    }

    /// Replace the current peer connection, keeping room and media.
    async fn renew_epoch(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(old) = active.epoch.take() {
            old.shutdown().await;
        }
        let media = Arc::clone(&active.media);
        match self.open_epoch(media).await {
            Ok(epoch) => {
                if let Some(active) = self.active.as_mut() {
                    active.epoch = Some(epoch);
                }
            }
            Err(err) => self.record_error(&err),
        }
    }

    /// Leave the room (optionally telling the relay) and return to a clean
    /// state: peer closed, candidates dropped, capture stopped, roles reset.
    async fn teardown(&mut self, notify_relay: bool) {
        if let Some(active) = self.active.take() {
            if notify_relay {
                let _ = self.outbound.send(ClientMessage::Leave {
                    room_id: active.room_id.clone(),
                });
            }
            if let Some(epoch) = active.epoch {
                epoch.shutdown().await;
            }
            active.media.stop();
            tracing::info!(target = "duet::session", room_id = %active.room_id, "left room");
        }
        self.resolver.reset();
        self.remote_media = MediaFlags::default();
    }

    fn set_media(&mut self, kind: MediaKind, enabled: bool) {
        self.local_media.set(kind, enabled);
        let Some(active) = &self.active else {
            return;
        };
        active.media.set_enabled(kind, enabled);
        if active.joined {
            let _ = self
                .outbound
                .send(ClientMessage::MediaToggle { kind, enabled });
        }
    }

    fn record_error(&mut self, err: &CallError) {
        match err {
            CallError::Negotiation(inner) if inner.is_defect() => {
                tracing::error!(target = "duet::session", error = %err, "negotiation defect");
            }
            _ => tracing::warn!(target = "duet::session", error = %err, "call operation failed"),
        }
        self.last_error = Some(err.to_string());
    }

    fn live_epoch(&mut self) -> Option<&mut Epoch> {
        self.active
            .as_mut()
            .and_then(|active| active.epoch.as_mut())
            .filter(|epoch| !epoch.cancel.is_cancelled())
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        if self.active.is_none() {
            if let ServerMessage::Error { code, message } = &message {
                tracing::warn!(target = "duet::session", code = code.as_str(), %message, "relay error");
            }
            return;
        }
        match message {
            ServerMessage::ExistingMembers { room_id, members } => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.room_id != room_id {
                    return;
                }
                active.joined = true;
                if let RoleDecision::AwaitOffer(remote) = self.resolver.on_existing_members(&members)
                {
                    tracing::debug!(
                        target = "duet::session",
                        remote = %remote.participant_id,
                        "waiting for offer"
                    );
                }
                // Relay the current media flags so the counterpart starts in sync.
                let flags = self.local_media;
                for (kind, enabled) in [(MediaKind::Audio, flags.audio), (MediaKind::Video, flags.video)] {
                    if !enabled {
                        let _ = self
                            .outbound
                            .send(ClientMessage::MediaToggle { kind, enabled });
                    }
                }
            }
            ServerMessage::MemberJoined {
                participant_id,
                display_name,
            } => {
                let arrival = ParticipantDescriptor::new(participant_id, display_name);
                if let RoleDecision::StartOffer(_) = self.resolver.on_member_joined(&arrival) {
                    let fresh = self
                        .live_epoch()
                        .map(|epoch| epoch.negotiator.state() == NegotiationState::Idle)
                        .unwrap_or(false);
                    if !fresh {
                        self.renew_epoch().await;
                    }
                    self.send_offer().await;
                }
            }
            ServerMessage::Offer { sdp, from } => {
                self.resolver.on_negotiation_sender(&from, true);
                let idle = self
                    .live_epoch()
                    .map(|epoch| epoch.negotiator.state() == NegotiationState::Idle);
                if idle == Some(false) {
                    // Counterpart restarted negotiation; answer on a fresh peer.
                    self.renew_epoch().await;
                }
                self.answer_offer(sdp).await;
            }
            ServerMessage::Answer { sdp, from } => {
                self.resolver.on_negotiation_sender(&from, false);
                let Some(epoch) = self.live_epoch() else {
                    return;
                };
                let cancel = epoch.cancel.clone();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = epoch.negotiator.apply_remote_answer(sdp) => Some(result),
                };
                match result {
                    Some(Ok(_)) => {}
                    Some(Err(err)) => self.record_error(&err.into()),
                    None => tracing::debug!(target = "duet::session", "answer abandoned"),
                }
            }
            ServerMessage::Candidate { candidate, .. } => {
                if let Some(epoch) = self.live_epoch() {
                    epoch.negotiator.add_remote_candidate(candidate).await;
                }
            }
            ServerMessage::MediaToggle { kind, enabled, from } => {
                tracing::debug!(
                    target = "duet::session",
                    from = %from.participant_id,
                    ?kind,
                    enabled,
                    "remote media toggled"
                );
                self.remote_media.set(kind, enabled);
            }
            ServerMessage::MemberLeft {
                participant_id,
                reason,
                ..
            } => {
                if let RoleDecision::CounterpartLeft(remote) =
                    self.resolver.on_member_left(&participant_id)
                {
                    tracing::info!(
                        target = "duet::session",
                        remote = %remote.participant_id,
                        reason = %reason,
                        "counterpart left"
                    );
                    self.remote_media = MediaFlags::default();
                    self.renew_epoch().await;
                }
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!(target = "duet::session", code = code.as_str(), %message, "relay error");
                self.last_error = Some(format!("{}: {}", code.as_str(), message));
                let joined = self.active.as_ref().map(|a| a.joined).unwrap_or(true);
                let join_rejected = matches!(
                    code,
                    ErrorCode::RoomFull | ErrorCode::RoomNotFound | ErrorCode::AlreadyMember
                );
                if join_rejected && !joined {
                    self.teardown(false).await;
                }
            }
            ServerMessage::Pong => {}
        }
    }

    async fn send_offer(&mut self) {
        let Some(epoch) = self.live_epoch() else {
            return;
        };
        let cancel = epoch.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = epoch.negotiator.create_offer() => Some(result),
        };
        match result {
            Some(Ok(offer)) => {
                let _ = self.outbound.send(ClientMessage::Offer { sdp: offer.sdp });
            }
            Some(Err(err)) => self.record_error(&err.into()),
            None => tracing::debug!(target = "duet::session", "offer abandoned"),
        }
    }

    async fn answer_offer(&mut self, sdp: String) {
        let Some(epoch) = self.live_epoch() else {
            return;
        };
        let cancel = epoch.cancel.clone();
        let result: Option<Result<_, NegotiationError>> = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = epoch.negotiator.apply_remote_offer(sdp) => Some(result),
        };
        match result {
            Some(Ok(answer)) => {
                let _ = self.outbound.send(ClientMessage::Answer { sdp: answer.sdp });
            }
            Some(Err(err)) => self.record_error(&err.into()),
            None => tracing::debug!(target = "duet::session", "offer handling abandoned"),
        }
    }

    async fn on_peer_event(&mut self, input: PeerInput) {
        let policy = self.deps.bitrate.clone();
        let Some(epoch) = self.live_epoch() else {
            return;
        };
        if epoch.id != input.epoch {
            tracing::trace!(
                target = "duet::session",
                stale = input.epoch,
                current = epoch.id,
                "dropping event from previous peer"
            );
            return;
        }
        match input.event {
            PeerEvent::LocalCandidate(candidate) => {
                let _ = self.outbound.send(ClientMessage::Candidate { candidate });
            }
            PeerEvent::Status(status) => {
                let terminal = epoch.negotiator.observe(status);
                if epoch.negotiator.is_connected() && epoch.bitrate.is_none() {
                    let cancel = epoch.cancel.child_token();
                    let handle = spawn_controller(epoch.negotiator.peer(), policy, cancel.clone());
                    epoch.bitrate = Some((cancel, handle));
                    tracing::debug!(target = "duet::session", "bitrate controller started");
                }
                if terminal {
                    epoch.stop_bitrate();
                    tracing::info!(
                        target = "duet::session",
                        status = %status,
                        "peer path lost"
                    );
                    self.renew_epoch().await;
                    let restart = self.resolver.role() == Role::Caller && self.resolver.is_locked();
                    if restart {
                        self.send_offer().await;
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let mut snapshot = CallSnapshot {
            epoch: self.next_epoch,
            role: self.resolver.role(),
            remote: self.resolver.remote().cloned(),
            identity_locked: self.resolver.is_locked(),
            local_media: self.local_media,
            remote_media: self.remote_media,
            last_error: self.last_error.clone(),
            ..CallSnapshot::default()
        };
        if let Some(active) = &self.active {
            snapshot.room_id = Some(active.room_id.clone());
            snapshot.joined = active.joined;
            if let Some(epoch) = &active.epoch {
                snapshot.epoch = epoch.id;
                snapshot.negotiation = epoch.negotiator.state();
                snapshot.connection = epoch.negotiator.status();
                snapshot.pending_candidates = epoch.negotiator.pending_candidates();
                snapshot.bitrate_active = epoch.bitrate.is_some();
            }
        }
        self.snapshot.send_replace(snapshot);
    }
}
