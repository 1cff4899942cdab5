//! Server side of duet: the room registry, the signaling relay and the
//! HTTP/WebSocket surface that exposes them.

pub mod cleanup;
pub mod config;
pub mod connections;
pub mod handlers;
pub mod identity;
pub mod participants;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::identity::IdentityVerifier;
use crate::relay::SignalingRelay;

pub struct AppState {
    pub relay: SignalingRelay,
    pub identity: IdentityVerifier,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(relay: SignalingRelay, identity: IdentityVerifier) -> Self {
        Self {
            relay,
            identity,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/rooms", post(handlers::create_room))
        .route("/rooms/:room_id", get(handlers::room_status))
        .route("/rooms/:room_id/join", post(handlers::join_room))
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
