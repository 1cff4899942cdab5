use std::sync::Arc;
use std::time::Duration;

use duet_call_core::error::{CallError, MediaError};
use duet_call_core::loopback::{LoopbackDevices, LoopbackPeerFactory, PeerOp};
use duet_call_core::media::{ConnectionStatus, PeerEvent, SdpKind};
use duet_call_core::{
    spawn_call, BitratePolicy, CallDeps, CallHandle, NegotiationState, Role, SignalingChannel,
};
use duet_protocol::{
    CandidateInit, ClientMessage, ErrorCode, LeaveReason, MediaKind, ParticipantDescriptor,
    RoomId, ServerMessage,
};
use duet_relay::relay::SignalingRelay;
use tokio::task::JoinHandle;

struct Party {
    handle: CallHandle,
    devices: Arc<LoopbackDevices>,
    peers: Arc<LoopbackPeerFactory>,
    _pumps: Vec<JoinHandle<()>>,
}

fn fast_policy() -> BitratePolicy {
    BitratePolicy {
        sample_interval_ms: 20,
        ..BitratePolicy::default()
    }
}

/// A call session whose signaling runs through an in-process relay.
fn attach(relay: &SignalingRelay, id: &str, name: &str) -> Party {
    let (channel, mut client_out, server_in) = SignalingChannel::pair();
    let mut connection = relay.connect(ParticipantDescriptor::new(id, name));
    let connection_id = connection.connection_id;

    let upstream = relay.clone();
    let up = tokio::spawn(async move {
        while let Some(message) = client_out.recv().await {
            upstream.handle(connection_id, message).await;
        }
        upstream
            .disconnect(connection_id, LeaveReason::Disconnect)
            .await;
    });
    let down = tokio::spawn(async move {
        while let Some(message) = connection.outbound.recv().await {
            if server_in.send(message).is_err() {
                break;
            }
        }
    });

    let devices = Arc::new(LoopbackDevices::new());
    let peers = Arc::new(LoopbackPeerFactory::new(id));
    let handle = spawn_call(
        CallDeps {
            local: ParticipantDescriptor::new(id, name),
            devices: devices.clone(),
            peers: peers.clone(),
            bitrate: fast_policy(),
        },
        channel,
    );
    Party {
        handle,
        devices,
        peers,
        _pumps: vec![up, down],
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn connected(party: &Party) {
    party
        .handle
        .wait_until(|s| s.negotiation == NegotiationState::Connected)
        .await
        .unwrap();
}

async fn connected_pair(relay: &SignalingRelay, room: &RoomId) -> (Party, Party) {
    let a = attach(relay, "a", "Ada");
    let b = attach(relay, "b", "Bo");
    a.handle.join(room.clone()).await.unwrap();
    a.handle.wait_until(|s| s.joined).await.unwrap();
    b.handle.join(room.clone()).await.unwrap();
    connected(&a).await;
    connected(&b).await;
    (a, b)
}

#[test_timeout::tokio_timeout_test(20)]
async fn first_member_offers_and_both_sides_connect() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (a, b) = connected_pair(&relay, &room).await;

    let caller = a.handle.snapshot();
    assert_eq!(caller.role, Role::Caller);
    assert_eq!(caller.remote, Some(ParticipantDescriptor::new("b", "Bo")));
    assert!(caller.identity_locked);

    let joiner = b.handle.snapshot();
    assert_eq!(joiner.role, Role::Joiner);
    assert_eq!(joiner.remote, Some(ParticipantDescriptor::new("a", "Ada")));
    assert!(joiner.identity_locked);

    let caller_peer = a.peers.latest().unwrap();
    let ops = caller_peer.ops();
    assert_eq!(
        &ops[..3],
        &[
            PeerOp::CreateOffer,
            PeerOp::SetLocal(SdpKind::Offer),
            PeerOp::SetRemote(SdpKind::Answer),
        ]
    );
    let joiner_peer = b.peers.latest().unwrap();
    assert_eq!(
        &joiner_peer.ops()[..3],
        &[
            PeerOp::SetRemote(SdpKind::Offer),
            PeerOp::CreateAnswer,
            PeerOp::SetLocal(SdpKind::Answer),
        ]
    );

    // Each side's local candidate reaches the other after descriptions are set.
    eventually(|| !caller_peer.applied_candidates().is_empty()).await;
    eventually(|| !joiner_peer.applied_candidates().is_empty()).await;
    assert!(caller_peer.applied_candidates()[0].starts_with("candidate:b-0"));
    assert!(joiner_peer.applied_candidates()[0].starts_with("candidate:a-0"));
}

#[test_timeout::tokio_timeout_test(20)]
async fn candidates_arriving_before_the_offer_are_applied_in_order() {
    let (channel, mut client_out, server_in) = SignalingChannel::pair();
    let peers = Arc::new(LoopbackPeerFactory::manual("b"));
    let handle = spawn_call(
        CallDeps {
            local: ParticipantDescriptor::new("b", "Bo"),
            devices: Arc::new(LoopbackDevices::new()),
            peers: peers.clone(),
            bitrate: BitratePolicy::default(),
        },
        channel,
    );
    let room = RoomId::new("room-1");
    let ada = ParticipantDescriptor::new("a", "Ada");

    handle.join(room.clone()).await.unwrap();
    assert_eq!(
        client_out.recv().await,
        Some(ClientMessage::Join { room_id: room.clone() })
    );
    server_in
        .send(ServerMessage::ExistingMembers {
            room_id: room.clone(),
            members: vec![ada.clone()],
        })
        .unwrap();
    for n in 1..=3 {
        server_in
            .send(ServerMessage::Candidate {
                candidate: CandidateInit::new(format!("cand-{n}")),
                from: ada.clone(),
            })
            .unwrap();
    }
    let queued = handle.wait_until(|s| s.pending_candidates == 3).await.unwrap();
    assert_eq!(queued.role, Role::Joiner);
    let peer = peers.latest().unwrap();
    assert!(peer.applied_candidates().is_empty());

    server_in
        .send(ServerMessage::Offer {
            sdp: "v=0 offer".into(),
            from: ada.clone(),
        })
        .unwrap();
    let answered = handle
        .wait_until(|s| s.negotiation == NegotiationState::HaveLocalAnswer)
        .await
        .unwrap();
    assert_eq!(answered.pending_candidates, 0);
    assert_eq!(peer.applied_candidates(), vec!["cand-1", "cand-2", "cand-3"]);
    let ops = peer.ops();
    assert_eq!(ops[0], PeerOp::SetRemote(SdpKind::Offer));
    assert_eq!(ops[1], PeerOp::AddCandidate("cand-1".into()));

    loop {
        match client_out.recv().await {
            Some(ClientMessage::Answer { .. }) => break,
            Some(_) => continue,
            None => panic!("session dropped its signaling channel"),
        }
    }

    // A candidate after the answer goes straight to the peer.
    server_in
        .send(ServerMessage::Candidate {
            candidate: CandidateInit::new("cand-4"),
            from: ada,
        })
        .unwrap();
    eventually(|| peer.applied_candidates().len() == 4).await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn leaving_stops_media_and_bitrate_and_resets_the_counterpart() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (a, b) = connected_pair(&relay, &room).await;

    a.handle.wait_until(|s| s.bitrate_active).await.unwrap();
    let caller_peer = a.peers.latest().unwrap();
    eventually(|| {
        caller_peer
            .ops()
            .iter()
            .any(|op| matches!(op, PeerOp::ApplyEncoding(_)))
    })
    .await;

    a.handle.leave().await.unwrap();
    let after = a.handle.snapshot();
    assert!(!after.bitrate_active);
    assert_eq!(after.room_id, None);
    assert_eq!(after.role, Role::Unset);
    assert!(caller_peer.is_closed());
    assert!(a.devices.acquired()[0].is_stopped());

    let applied = caller_peer.ops().len();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(caller_peer.ops().len(), applied);

    let reset = b
        .handle
        .wait_until(|s| !s.identity_locked)
        .await
        .unwrap();
    assert_eq!(reset.role, Role::Unset);
    assert_eq!(reset.remote, None);
    assert_eq!(reset.negotiation, NegotiationState::Idle);
    assert!(b.peers.peers()[0].is_closed());
    let remaining = relay.registry().snapshot(&room).await.unwrap();
    let ids: Vec<_> = remaining
        .members
        .iter()
        .map(|m| m.participant_id.as_str().to_string())
        .collect();
    assert_eq!(ids, vec!["b"]);
}

#[test_timeout::tokio_timeout_test(20)]
async fn next_arrival_after_departure_becomes_the_new_counterpart() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (a, b) = connected_pair(&relay, &room).await;

    b.handle.leave().await.unwrap();
    a.handle.wait_until(|s| !s.identity_locked).await.unwrap();

    let c = attach(&relay, "c", "Cy");
    c.handle.join(room.clone()).await.unwrap();
    connected(&c).await;
    let caller = a
        .handle
        .wait_until(|s| s.negotiation == NegotiationState::Connected)
        .await
        .unwrap();
    assert_eq!(caller.role, Role::Caller);
    assert_eq!(caller.remote, Some(ParticipantDescriptor::new("c", "Cy")));
    assert_eq!(c.handle.snapshot().role, Role::Joiner);
}

#[test_timeout::tokio_timeout_test(20)]
async fn media_toggles_reach_the_counterpart() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (a, b) = connected_pair(&relay, &room).await;

    b.handle.set_media(MediaKind::Video, false).unwrap();
    let seen = a
        .handle
        .wait_until(|s| !s.remote_media.video)
        .await
        .unwrap();
    assert!(seen.remote_media.audio);
    assert!(!b.devices.acquired()[0].is_enabled(MediaKind::Video));
    assert!(!b.handle.snapshot().local_media.video);
}

#[test_timeout::tokio_timeout_test(20)]
async fn lost_path_makes_the_caller_renegotiate_on_a_fresh_peer() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (a, b) = connected_pair(&relay, &room).await;
    let first_epoch = a.handle.snapshot().epoch;

    a.peers
        .latest()
        .unwrap()
        .emit(PeerEvent::Status(ConnectionStatus::Failed));

    let renewed = a
        .handle
        .wait_until(|s| s.epoch > first_epoch && s.negotiation == NegotiationState::Connected)
        .await
        .unwrap();
    assert!(renewed.identity_locked);
    assert_eq!(renewed.role, Role::Caller);
    assert_eq!(a.peers.peers().len(), 2);
    assert!(a.peers.peers()[0].is_closed());

    eventually(|| b.peers.peers().len() == 2).await;
    b.handle
        .wait_until(|s| s.negotiation == NegotiationState::Connected && s.epoch == 2)
        .await
        .unwrap();
}

#[test_timeout::tokio_timeout_test(20)]
async fn rejected_join_releases_media() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (_a, _b) = connected_pair(&relay, &room).await;

    let c = attach(&relay, "c", "Cy");
    c.handle.join(room.clone()).await.unwrap();
    let rejected = c
        .handle
        .wait_until(|s| s.last_error.is_some() && s.room_id.is_none())
        .await
        .unwrap();
    assert!(rejected
        .last_error
        .unwrap()
        .contains(ErrorCode::RoomFull.as_str()));
    assert!(c.devices.acquired()[0].is_stopped());
    assert!(c.peers.latest().unwrap().is_closed());
}

#[test_timeout::tokio_timeout_test(20)]
async fn denied_capture_fails_join_before_signaling() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (channel, mut client_out, _server_in) = SignalingChannel::pair();
    let handle = spawn_call(
        CallDeps {
            local: ParticipantDescriptor::new("a", "Ada"),
            devices: Arc::new(LoopbackDevices::denied()),
            peers: Arc::new(LoopbackPeerFactory::new("a")),
            bitrate: BitratePolicy::default(),
        },
        channel,
    );

    let err = handle.join(room).await.unwrap_err();
    assert!(matches!(err, CallError::Media(MediaError::PermissionDenied)));
    assert!(client_out.try_recv().is_err());
    assert_eq!(handle.snapshot().room_id, None);
}

#[test_timeout::tokio_timeout_test(20)]
async fn teardown_now_leaves_without_waiting() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let (a, b) = connected_pair(&relay, &room).await;

    a.handle.teardown_now();
    b.handle.wait_until(|s| !s.identity_locked).await.unwrap();
    eventually(|| a.devices.acquired()[0].is_stopped()).await;
    let after = a.handle.wait_until(|s| s.room_id.is_none()).await.unwrap();
    assert!(!after.bitrate_active);
}

#[test_timeout::tokio_timeout_test(20)]
async fn leave_while_creating_an_offer_sends_nothing_afterwards() {
    let (channel, mut client_out, server_in) = SignalingChannel::pair();
    let peers = Arc::new(LoopbackPeerFactory::held("b"));
    let handle = spawn_call(
        CallDeps {
            local: ParticipantDescriptor::new("b", "Bo"),
            devices: Arc::new(LoopbackDevices::new()),
            peers: peers.clone(),
            bitrate: BitratePolicy::default(),
        },
        channel,
    );
    let room = RoomId::new("room-1");

    handle.join(room.clone()).await.unwrap();
    assert_eq!(
        client_out.recv().await,
        Some(ClientMessage::Join { room_id: room.clone() })
    );
    server_in
        .send(ServerMessage::ExistingMembers {
            room_id: room.clone(),
            members: Vec::new(),
        })
        .unwrap();
    server_in
        .send(ServerMessage::member_joined(&ParticipantDescriptor::new("a", "Ada")))
        .unwrap();
    let peer = peers.latest().unwrap();
    eventually(|| peer.is_waiting()).await;

    handle.leave().await.unwrap();
    let after = handle.wait_until(|s| s.room_id.is_none()).await.unwrap();
    assert_eq!(after.role, Role::Unset);
    assert!(!after.identity_locked);
    assert!(peer.is_closed());

    peer.release();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut sent = Vec::new();
    while let Ok(message) = client_out.try_recv() {
        sent.push(message);
    }
    assert_eq!(sent, vec![ClientMessage::Leave { room_id: room }]);
    assert!(!peer.ops().contains(&PeerOp::CreateOffer));
    assert_eq!(peers.peers().len(), 1);
}
