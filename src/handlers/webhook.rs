use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use log::warn;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use crate::webhook::{self, Ingested, WebhookEvent};

/// `POST /clerk-users-webhook`. Verification runs on the raw body before any
/// parsing; nothing is written unless it passes.
pub async fn clerk_users_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    if let Err(e) = state.webhook.verify(&headers, &body) {
        warn!("Rejected webhook delivery: {}", e);
        return Err(e.into());
    }
    let event = WebhookEvent::parse(&body).map_err(|e| {
        warn!("Rejected webhook payload: {}", e);
        ApiError::from(e)
    })?;

    let message = match webhook::ingest(&state.store, event).await? {
        Ingested::Processed => "Webhook event processed",
        Ingested::Ignored => "Webhook event type not supported",
    };
    Ok(Json(json!({ "message": message })))
}
