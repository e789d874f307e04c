use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use flowbot_core::error::FlowbotError;
use flowbot_core::types::{ConversationKey, InboundMessage};

use crate::middleware::Authenticated;
use crate::state::AppState;

// GET /api/health: no auth required
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_available": state.ingress.available(),
    }))
}

#[derive(Deserialize)]
pub struct WebhookPayload {
    pub phone: String,
    pub device: String,
    pub message: String,
    #[serde(default)]
    pub name: Option<String>,
}

// POST /webhook: enqueue an inbound chat message
pub async fn webhook(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> (StatusCode, Json<Value>) {
    if payload.phone.trim().is_empty() || payload.device.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "phone and device are required" })),
        );
    }

    let key = ConversationKey::new(payload.phone.trim(), payload.device.trim());
    let mut message = InboundMessage::new(key, payload.message);
    message.display_name = payload.name.filter(|n| !n.trim().is_empty());

    match state.ingress.submit(message) {
        Ok(()) => {
            debug!(phone = %payload.phone, device = %payload.device, "Webhook accepted");
            (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
        }
        Err(FlowbotError::QueueFull) => {
            warn!(phone = %payload.phone, "Ingress queue full, rejecting webhook");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "queue full" })),
            )
        }
        Err(e) => {
            error!(error = %e, "Failed to enqueue webhook");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

// GET /api/executions/{device}/{phone}: active execution for a conversation
pub async fn execution(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((device, phone)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let key = ConversationKey::new(phone, device);
    match state.executions.get(&key).await {
        Ok(Some(execution)) => {
            serde_json::to_value(execution)
                .map(Json)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to load execution");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
