use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use duet_protocol::{ClientMessage, ErrorCode, LeaveReason, ParticipantDescriptor, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Upgrade to the signaling channel. Refused outright without a valid identity.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(token) = query.token else {
        counter!("duet_relay_ws_rejected_total", 1, "reason" => "missing-token");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match state.identity.verify(&token) {
        Ok(participant) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, participant))
            .into_response(),
        Err(err) => {
            counter!("duet_relay_ws_rejected_total", 1, "reason" => "invalid-token");
            warn!(error = %err, "websocket identity rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, participant: ParticipantDescriptor) {
    let relay = state.relay.clone();
    let connection = relay.connect(participant);
    let connection_id = connection.connection_id;
    let participant_id = connection.participant.participant_id.clone();
    let mut outbound = connection.outbound;

    let (mut sender, mut receiver) = socket.split();

    // Writer: the hub drops the queue on unregister, which closes the socket.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    error!(error = %err, "failed to serialize server message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(frame) = receiver.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                relay.connections().touch(connection_id);
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "client closed websocket");
                break;
            }
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "websocket read error");
                break;
            }
        };

        match serde_json::from_slice::<ClientMessage>(&payload) {
            Ok(message) => relay.handle(connection_id, message).await,
            Err(err) => {
                relay.connections().touch(connection_id);
                warn!(
                    connection_id = %connection_id,
                    participant_id = %participant_id,
                    error = %err,
                    "unparseable client message"
                );
                relay.connections().send_direct(
                    connection_id,
                    ServerMessage::error(ErrorCode::InvalidMessage, err.to_string()),
                );
            }
        }
    }

    relay.disconnect(connection_id, LeaveReason::Disconnect).await;
    send_task.abort();
    info!(connection_id = %connection_id, participant_id = %participant_id, "websocket closed");
}
