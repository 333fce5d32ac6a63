use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};

use crate::clients::ClientPool;
use crate::conversations::ConversationTracker;
use crate::storage::Storage;

// --- Health ---

#[get("/health")]
pub fn health(tracker: &State<Arc<ConversationTracker>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "matrix-agent-bridge",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": tracker.session_count(),
    }))
}

// --- Stats ---

#[get("/stats")]
pub async fn stats(
    storage: &State<Arc<Storage>>,
    pool: &State<Arc<ClientPool>>,
    tracker: &State<Arc<ConversationTracker>>,
) -> Json<serde_json::Value> {
    let identities = storage.list_identities().await.map(|i| i.len()).unwrap_or(0);
    let agent_rooms = storage
        .list_agent_mappings()
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let (total, active) = tracker.counts();
    Json(serde_json::json!({
        "identities": identities,
        "agent_rooms": agent_rooms,
        "clients": pool.len(),
        "conversations": total,
        "active_conversations": active,
        "dedup_cache": tracker.dedup_len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// --- 404 catcher ---

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}
