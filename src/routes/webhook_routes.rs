use std::sync::Arc;

use rocket::data::ToByteUnit;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Data, State, post};

use crate::models::AgentResponseWebhook;
use crate::webhooks::WebhookProcessor;

use super::LettaSignature;

/// Agent-completion sink. The signature covers the raw body, so the body
/// is read as bytes before JSON parsing.
#[post("/webhooks/letta/agent-response", data = "<data>")]
pub async fn agent_response(
    processor: &State<Arc<WebhookProcessor>>,
    signature: LettaSignature,
    data: Data<'_>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let raw = data
        .open(2.mebibytes())
        .into_bytes()
        .await
        .map_err(|e| {
            (
                Status::BadRequest,
                Json(serde_json::json!({"error": format!("body read failed: {e}")})),
            )
        })?
        .into_inner();

    if !processor.verify(signature.0.as_deref(), &raw) {
        eprintln!("🚫 Webhook signature mismatch");
        return Err((
            Status::Unauthorized,
            Json(serde_json::json!({"error": "invalid signature"})),
        ));
    }

    let hook: AgentResponseWebhook = serde_json::from_slice(&raw).map_err(|e| {
        (
            Status::BadRequest,
            Json(serde_json::json!({"error": format!("malformed payload: {e}")})),
        )
    })?;

    if hook.event_type != "agent.run.completed" {
        eprintln!("↩️ Unsupported webhook event type {}", hook.event_type);
        return Ok(Json(
            serde_json::json!({"status": "unsupported_event_type"}),
        ));
    }

    let status = processor
        .process_agent_response(
            &hook.agent_id,
            hook.data.run_id.as_deref(),
            &hook.data.messages,
        )
        .await;

    if status["status"] == "delivery_failed" {
        return Err((Status::InternalServerError, Json(status)));
    }
    Ok(Json(status))
}
