use duet_protocol::{ClientMessage, ErrorCode, LeaveReason, ParticipantDescriptor, ServerMessage};
use duet_relay::relay::{Connection, SignalingRelay};

fn participant(id: &str, name: &str) -> ParticipantDescriptor {
    ParticipantDescriptor::new(id, name)
}

fn drain(conn: &mut Connection) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = conn.outbound.try_recv() {
        messages.push(message);
    }
    messages
}

#[test_timeout::tokio_timeout_test]
async fn second_arrival_sees_first_and_first_is_told_about_second() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let mut a = relay.connect(participant("a", "Ada"));
    let mut b = relay.connect(participant("b", "Bo"));

    relay
        .handle(a.connection_id, ClientMessage::Join { room_id: room.clone() })
        .await;
    assert_eq!(
        drain(&mut a),
        vec![ServerMessage::ExistingMembers {
            room_id: room.clone(),
            members: vec![],
        }]
    );

    relay
        .handle(b.connection_id, ClientMessage::Join { room_id: room.clone() })
        .await;
    assert_eq!(
        drain(&mut a),
        vec![ServerMessage::member_joined(&participant("b", "Bo"))]
    );
    assert_eq!(
        drain(&mut b),
        vec![ServerMessage::ExistingMembers {
            room_id: room.clone(),
            members: vec![participant("a", "Ada")],
        }]
    );

    relay
        .handle(a.connection_id, ClientMessage::Offer { sdp: "offer-sdp".into() })
        .await;
    relay
        .handle(b.connection_id, ClientMessage::Answer { sdp: "answer-sdp".into() })
        .await;
    assert_eq!(
        drain(&mut b),
        vec![ServerMessage::Offer {
            sdp: "offer-sdp".into(),
            from: participant("a", "Ada"),
        }]
    );
    assert_eq!(
        drain(&mut a),
        vec![ServerMessage::Answer {
            sdp: "answer-sdp".into(),
            from: participant("b", "Bo"),
        }]
    );
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_notifies_once_and_last_leave_deletes_room() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let mut a = relay.connect(participant("a", "Ada"));
    let b = relay.connect(participant("b", "Bo"));
    relay.join(a.connection_id, &a.participant.clone(), &room).await.unwrap();
    relay.join(b.connection_id, &b.participant.clone(), &room).await.unwrap();
    drain(&mut a);

    assert!(relay.disconnect(b.connection_id, LeaveReason::Disconnect).await);
    assert!(!relay.disconnect(b.connection_id, LeaveReason::Disconnect).await);
    let duplicate = relay.leave(&room, &"b".into(), LeaveReason::Left).await;
    assert!(!duplicate.removed);
    assert_eq!(duplicate.notified, 0);

    assert_eq!(
        drain(&mut a),
        vec![ServerMessage::member_left(
            &participant("b", "Bo"),
            LeaveReason::Disconnect
        )]
    );
    let snapshot = relay.registry().snapshot(&room).await.unwrap();
    assert_eq!(snapshot.members.len(), 1);

    let outcome = relay.leave(&room, &"a".into(), LeaveReason::Left).await;
    assert!(outcome.removed);
    assert!(outcome.room_deleted);
    assert!(!relay.registry().contains(&room));
    assert_eq!(relay.participants().current_room(&"a".into()), None);
}

#[test_timeout::tokio_timeout_test]
async fn full_and_missing_rooms_reject_without_mutation() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let a = relay.connect(participant("a", "Ada"));
    let b = relay.connect(participant("b", "Bo"));
    let mut c = relay.connect(participant("c", "Cy"));
    relay.join(a.connection_id, &a.participant.clone(), &room).await.unwrap();
    relay.join(b.connection_id, &b.participant.clone(), &room).await.unwrap();

    relay
        .handle(c.connection_id, ClientMessage::Join { room_id: room.clone() })
        .await;
    relay
        .handle(
            c.connection_id,
            ClientMessage::Join {
                room_id: "missing".into(),
            },
        )
        .await;

    let errors: Vec<ErrorCode> = drain(&mut c)
        .into_iter()
        .filter_map(|message| match message {
            ServerMessage::Error { code, .. } => Some(code),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ErrorCode::RoomFull, ErrorCode::RoomNotFound]);
    assert_eq!(relay.registry().room_count(), 1);
    let snapshot = relay.registry().snapshot(&room).await.unwrap();
    assert_eq!(snapshot.members.len(), 2);
    assert_eq!(relay.participants().current_room(&"c".into()), None);
}

#[test_timeout::tokio_timeout_test]
async fn rejected_switch_keeps_the_current_room() {
    let relay = SignalingRelay::default();
    let home = relay.registry().create_room(&"a".into());
    let full = relay.registry().create_room(&"c".into());
    let mut a = relay.connect(participant("a", "Ada"));
    let mut b = relay.connect(participant("b", "Bo"));
    let c = relay.connect(participant("c", "Cy"));
    let d = relay.connect(participant("d", "Di"));
    relay.join(a.connection_id, &a.participant.clone(), &home).await.unwrap();
    relay.join(b.connection_id, &b.participant.clone(), &home).await.unwrap();
    relay.join(c.connection_id, &c.participant.clone(), &full).await.unwrap();
    relay.join(d.connection_id, &d.participant.clone(), &full).await.unwrap();
    drain(&mut a);
    drain(&mut b);

    relay
        .handle(b.connection_id, ClientMessage::Join { room_id: full.clone() })
        .await;
    relay
        .handle(
            b.connection_id,
            ClientMessage::Join {
                room_id: "nowhere".into(),
            },
        )
        .await;

    let errors: Vec<ErrorCode> = drain(&mut b)
        .into_iter()
        .filter_map(|message| match message {
            ServerMessage::Error { code, .. } => Some(code),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ErrorCode::RoomFull, ErrorCode::RoomNotFound]);
    assert!(drain(&mut a).is_empty());
    assert_eq!(relay.participants().current_room(&"b".into()), Some(home.clone()));
    let home_members = relay.registry().snapshot(&home).await.unwrap().members;
    assert_eq!(home_members.len(), 2);
    let full_members = relay.registry().snapshot(&full).await.unwrap().members;
    assert_eq!(full_members.len(), 2);

    // Still routable: b's signaling reaches a.
    relay
        .handle(b.connection_id, ClientMessage::Offer { sdp: "v=0".into() })
        .await;
    assert_eq!(
        drain(&mut a),
        vec![ServerMessage::Offer {
            sdp: "v=0".into(),
            from: participant("b", "Bo"),
        }]
    );
}

#[test_timeout::tokio_timeout_test]
async fn rejoining_the_same_room_is_a_duplicate() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let mut a = relay.connect(participant("a", "Ada"));
    relay
        .handle(a.connection_id, ClientMessage::Join { room_id: room.clone() })
        .await;
    relay
        .handle(a.connection_id, ClientMessage::Join { room_id: room.clone() })
        .await;
    let messages = drain(&mut a);
    assert!(matches!(
        messages.last(),
        Some(ServerMessage::Error {
            code: ErrorCode::AlreadyMember,
            ..
        })
    ));
}

#[test_timeout::tokio_timeout_test]
async fn old_connection_teardown_does_not_evict_reconnected_participant() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let mut a = relay.connect(participant("a", "Ada"));
    let old_b = relay.connect(participant("b", "Bo"));
    relay.join(a.connection_id, &a.participant.clone(), &room).await.unwrap();
    relay.join(old_b.connection_id, &old_b.participant.clone(), &room).await.unwrap();

    // New transport replaces the presence record; the old one is superseded.
    let new_b = relay.connect(participant("b", "Bo"));
    let err = relay
        .join(old_b.connection_id, &old_b.participant.clone(), &room)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    // Old transport drops: its membership goes, the new record survives.
    relay.disconnect(old_b.connection_id, LeaveReason::Disconnect).await;
    let record = relay.participants().get(&"b".into()).unwrap();
    assert_eq!(record.connection_id, new_b.connection_id);

    drain(&mut a);
    relay.join(new_b.connection_id, &new_b.participant.clone(), &room).await.unwrap();
    assert_eq!(
        drain(&mut a),
        vec![ServerMessage::member_joined(&participant("b", "Bo"))]
    );
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_leaves_every_room() {
    let relay = SignalingRelay::default();
    let room = relay.registry().create_room(&"a".into());
    let a = relay.connect(participant("a", "Ada"));
    let b = relay.connect(participant("b", "Bo"));
    relay.join(a.connection_id, &a.participant.clone(), &room).await.unwrap();
    relay.join(b.connection_id, &b.participant.clone(), &room).await.unwrap();

    assert_eq!(relay.shutdown().await, 2);
    assert!(!relay.registry().contains(&room));
    assert!(relay.connections().is_empty());
    assert!(relay.participants().is_empty());
}
