use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use murmur_protocol::{AgentAddress, NodeInbox, PresenceMessage, WireEnvelope};

pub struct AppState {
    pub address: AgentAddress,
    pub token: Option<String>,
    pub inbox: NodeInbox,
    pub started_at: DateTime<Utc>,
}

/// HTTP surface of one node. `max_body` caps inbound request bodies a bit
/// above the substrate message size, leaving room for envelope framing.
pub fn create_router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/envelope", post(receive_envelope))
        .route("/presence", post(receive_presence))
        .route("/status", get(status))
        .layer(RequestBodyLimitLayer::new(max_body))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.token else {
        return Ok(());
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn receive_envelope(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(message): Json<WireEnvelope>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    if message.envelope.to.bare() != state.address {
        tracing::warn!(to = %message.envelope.to, "Envelope for another node rejected");
        return Err(StatusCode::MISDIRECTED_REQUEST);
    }
    state
        .inbox
        .deliver_envelope(message)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn receive_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(message): Json<PresenceMessage>,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    state
        .inbox
        .deliver_presence(message)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(json!({
        "address": state.address.to_string(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "status": "ok",
    })))
}
