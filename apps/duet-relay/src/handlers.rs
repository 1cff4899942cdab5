use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use duet_protocol::{ErrorCode, ParticipantDescriptor, RoomId};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::registry::RegistryError;
use crate::AppState;

/// JSON error body shared by every room route.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: ErrorCode::Unauthorized,
            message: message.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match err {
            RegistryError::RoomNotFound => StatusCode::NOT_FOUND,
            RegistryError::RoomFull | RegistryError::AlreadyMember => StatusCode::CONFLICT,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// Resolve the caller from an `Authorization: Bearer <token>` header.
pub fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ParticipantDescriptor, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    state.identity.verify(token.trim()).map_err(|err| {
        warn!(error = %err, "rejected identity token");
        ApiError::unauthorized(err.to_string())
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatusResponse {
    pub exists: bool,
    pub members: Vec<ParticipantDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CreateRoomResponse>), ApiError> {
    let caller = authenticate(&state, &headers)?;
    let room_id = state.relay.registry().create_room(&caller.participant_id);
    Ok((StatusCode::CREATED, Json(CreateRoomResponse { room_id })))
}

pub async fn room_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomStatusResponse>, ApiError> {
    authenticate(&state, &headers)?;
    let response = match state.relay.registry().snapshot(&RoomId::from(room_id)).await {
        Some(snapshot) => RoomStatusResponse {
            exists: true,
            members: snapshot.members.iter().map(|m| m.descriptor()).collect(),
            created_at: Some(snapshot.created_at),
        },
        None => RoomStatusResponse {
            exists: false,
            members: Vec::new(),
            created_at: None,
        },
    };
    Ok(Json(response))
}

/// Pre-check only: the real join happens on the signaling channel.
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let room_id = RoomId::from(room_id);
    state
        .relay
        .registry()
        .validate_join(&room_id, &caller.participant_id)
        .await?;
    debug!(room_id = %room_id, participant_id = %caller.participant_id, "join pre-check passed");
    Ok(Json(json!({ "ok": true })))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
