//! HTTP status surface and bridge intake.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hearth_core::model::NewMessage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channel::HttpBridgeChannel;
use crate::queue::GroupQueue;
use crate::registry::GroupRegistry;

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub bind: String,
    pub orchestrator_enabled: bool,
    pub queue: Option<GroupQueue>,
    pub registry: Arc<GroupRegistry>,
    pub bridge: Option<Arc<HttpBridgeChannel>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    orchestrator_enabled: bool,
    bridge_enabled: bool,
    registered_groups: usize,
    active_sandboxes: usize,
}

/// Message posted by the bridge to `/v1/inbound`.
#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    pub id: String,
    #[serde(alias = "address")]
    pub chat_jid: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(alias = "text")]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_from_me: bool,
}

impl From<InboundRequest> for NewMessage {
    fn from(req: InboundRequest) -> Self {
        NewMessage {
            id: req.id,
            sender_name: req.sender_name.unwrap_or_else(|| req.sender.clone()),
            sender: req.sender,
            chat_jid: req.chat_jid,
            content: req.content,
            timestamp: req.timestamp.unwrap_or_default(),
            is_from_me: req.is_from_me,
            is_bot_message: false,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/queue", get(queue_snapshot))
        .route("/v1/inbound", post(inbound))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "hearthd",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let active_sandboxes = match &state.queue {
        Some(queue) => queue.active_count().await,
        None => 0,
    };
    Json(ReadyResponse {
        status: "ready",
        orchestrator_enabled: state.orchestrator_enabled,
        bridge_enabled: state.bridge.is_some(),
        registered_groups: state.registry.len(),
        active_sandboxes,
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn queue_snapshot(State(state): State<AppState>) -> Response {
    match &state.queue {
        Some(queue) => Json(queue.snapshot().await).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "orchestrator disabled"),
    }
}

async fn inbound(State(state): State<AppState>, Json(request): Json<InboundRequest>) -> Response {
    let Some(bridge) = &state.bridge else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "http bridge disabled");
    };
    let chat_jid = request.chat_jid.clone();
    match bridge.deliver(request.into()) {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "accepted" }))).into_response(),
        Err(err) => {
            warn!(chat_jid = %chat_jid, err = %err, "rejected inbound message");
            error_response(StatusCode::BAD_REQUEST, "inbound message rejected")
        }
    }
}
