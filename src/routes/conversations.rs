use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use crate::agent_service::AgentServiceClient;
use crate::config::BridgeConfig;
use crate::conversations::ConversationTracker;
use crate::models::{ConversationResponse, StartConversation, ToolSelectorWebhook};
use crate::monitor::{MonitorRegistry, spawn_monitor};
use crate::webhooks::WebhookProcessor;

/// Begin tracking a conversation for a Matrix event that was routed
/// elsewhere (e.g. by an external bridge component).
#[post("/conversations/start", format = "json", data = "<body>")]
pub fn start_conversation(
    tracker: &State<Arc<ConversationTracker>>,
    body: Json<StartConversation>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    if body.matrix_event_id.trim().is_empty() || body.agent_id.trim().is_empty() {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "matrix_event_id and agent_id are required"})),
        ));
    }

    let conversation = tracker.start(
        &body.matrix_event_id,
        &body.matrix_room_id,
        &body.agent_id,
        body.original_query.clone(),
    );

    Ok(Json(serde_json::json!({
        "conversation_id": conversation.event_id,
        "agent_id": conversation.agent_id,
        "tracking": true,
    })))
}

/// Complete the newest active conversation for an agent with an
/// out-of-band response (the opencode path).
#[post("/conversations/response", format = "json", data = "<body>")]
pub async fn post_conversation_response(
    processor: &State<Arc<WebhookProcessor>>,
    body: Json<ConversationResponse>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    if body.response.trim().is_empty() {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "response must not be empty"})),
        ));
    }

    let text = match body.opencode_sender.as_deref() {
        Some(sender) if !sender.is_empty() => format!("{}: {}", sender, body.response),
        _ => body.response.clone(),
    };

    let status = processor.complete_with_text(&body.agent_id, &text).await;
    if status["status"] == "delivery_failed" {
        return Err((Status::InternalServerError, Json(status)));
    }
    Ok(Json(status))
}

/// Diagnostic listing of active conversations.
#[get("/conversations")]
pub fn get_conversations(tracker: &State<Arc<ConversationTracker>>) -> Json<serde_json::Value> {
    let active = tracker.list_active();
    Json(serde_json::json!({
        "count": active.len(),
        "conversations": active,
    }))
}

/// Tool-selection notification: a new run was triggered with tools
/// attached, so the eventual response belongs to a different run than the
/// one the user message spawned. Starts the fallback response monitor.
#[post("/webhook/tool-selector", format = "json", data = "<body>")]
pub async fn tool_selector(
    config: &State<BridgeConfig>,
    processor: &State<Arc<WebhookProcessor>>,
    monitors: &State<Arc<MonitorRegistry>>,
    agent_service: &State<Arc<AgentServiceClient>>,
    body: Json<ToolSelectorWebhook>,
) -> Json<serde_json::Value> {
    if body.event != "run_triggered" {
        return Json(serde_json::json!({"status": "unsupported_event"}));
    }

    let tracker = processor.tracker();
    let Some(conversation) = tracker.active_for_agent(&body.agent_id) else {
        return Json(serde_json::json!({"status": "no_active_conversation"}));
    };

    let run_id = body
        .new_run_id
        .clone()
        .unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4()));

    tracker.attach_tools(&conversation.event_id, &body.tools_attached);
    tracker.add_run(
        &conversation.event_id,
        &run_id,
        body.trigger_type.as_deref().unwrap_or("tool_attachment"),
        conversation.runs.last().map(|r| r.run_id.clone()),
    );

    let Some(cancel) = monitors.try_register(&conversation.event_id) else {
        // Soft cap reached; the run will be handled by polling next cycle.
        return Json(serde_json::json!({
            "status": "busy",
            "tracking": true,
            "monitoring": false,
            "conversation_id": conversation.event_id,
            "tools_attached": body.tools_attached.clone(),
        }));
    };

    spawn_monitor(
        monitors.inner().clone(),
        processor.inner().clone(),
        agent_service.inner().clone(),
        cancel,
        conversation.event_id.clone(),
        body.agent_id.clone(),
        conversation.room_id.clone(),
        run_id,
        config.monitor_poll_interval_sec,
        config.monitor_max_wait_sec,
    );

    println!(
        "🔍 Monitoring conversation {} for {} (tools: {:?})",
        conversation.event_id, body.agent_id, body.tools_attached
    );

    Json(serde_json::json!({
        "status": "tracking",
        "tracking": true,
        "monitoring": true,
        "conversation_id": conversation.event_id,
        "tools_attached": body.tools_attached.clone(),
    }))
}
