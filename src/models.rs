use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// --- Identities ---

/// How an identity's localpart is derived from its external key.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Letta,
    Opencode,
    Custom,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Letta => "letta",
            IdentityKind::Opencode => "opencode",
            IdentityKind::Custom => "custom",
        }
    }
}

/// A Matrix account owned by the bridge. `password` is retained so the
/// account can always be re-entered after token invalidation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Identity {
    pub id: String,
    pub mxid: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub access_token: String,
    pub password: String,
    pub kind: IdentityKind,
    pub created_at: String,
    pub last_used_at: String,
    #[serde(default)]
    pub deactivated: bool,
}

// --- Rooms ---

/// DM room record, keyed by the symmetric participant pair.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DmRoomMapping {
    pub room_id: String,
    pub participants: (String, String),
    pub created_at: String,
    pub last_activity_at: String,
}

/// Per-agent dedicated room. Field names match the on-disk
/// `agent_user_mappings.json` document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentRoomMapping {
    pub agent_id: String,
    pub agent_name: String,
    pub matrix_user_id: String,
    pub matrix_password: String,
    pub room_id: String,
    pub created: String,
    pub room_created: String,
    #[serde(default)]
    pub invitation_status: HashMap<String, String>,
}

/// Singleton parent-space record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpaceConfig {
    pub space_id: String,
    pub name: String,
    pub created_at: String,
}

/// Sync-loop resume state, one file per identity under `clients/`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SyncState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

// --- Conversations ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Active,
    Completed,
    Timeout,
}

impl ConversationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationStatus::Completed | ConversationStatus::Timeout)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationRun {
    pub run_id: String,
    pub triggered_by: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

/// Cross-run conversation record, keyed by the originating Matrix event id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub event_id: String,
    pub room_id: String,
    pub agent_id: String,
    pub status: ConversationStatus,
    pub runs: Vec<ConversationRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_attached: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_query: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// --- Webhook surface DTOs ---

/// `POST /webhooks/letta/agent-response` envelope.
#[derive(Debug, Deserialize)]
pub struct AgentResponseWebhook {
    pub event_type: String,
    pub agent_id: String,
    #[serde(default)]
    pub data: AgentResponseData,
}

#[derive(Debug, Deserialize, Default)]
pub struct AgentResponseData {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
}

/// One message from the agent service. `content` keeps its raw JSON shape:
/// a string, an array of typed parts, or an object with a `text` field.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentMessage {
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// `POST /webhook/tool-selector` body.
#[derive(Debug, Deserialize)]
pub struct ToolSelectorWebhook {
    pub event: String,
    pub agent_id: String,
    #[serde(default)]
    pub new_run_id: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub tools_attached: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `POST /conversations/start` body.
#[derive(Debug, Deserialize)]
pub struct StartConversation {
    pub matrix_event_id: String,
    pub matrix_room_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub original_query: Option<String>,
}

/// `POST /conversations/response` body.
#[derive(Debug, Deserialize)]
pub struct ConversationResponse {
    pub agent_id: String,
    pub response: String,
    #[serde(default)]
    pub opencode_sender: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_kind_serializes_lowercase() {
        let json = serde_json::to_string(&IdentityKind::Letta).unwrap();
        assert_eq!(json, "\"letta\"");
        let kind: IdentityKind = serde_json::from_str("\"opencode\"").unwrap();
        assert_eq!(kind, IdentityKind::Opencode);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ConversationStatus::Pending.is_terminal());
        assert!(!ConversationStatus::Active.is_terminal());
        assert!(ConversationStatus::Completed.is_terminal());
        assert!(ConversationStatus::Timeout.is_terminal());
    }

    #[test]
    fn agent_mapping_round_trips_disk_shape() {
        let json = r#"{
            "agent_id": "agent-597b5756-2915-4560-ba6b-91005f085166",
            "agent_name": "Meridian",
            "matrix_user_id": "@agent_597b5756_2915_4560_ba6b_91005f085166:example.com",
            "matrix_password": "MCP_0123456789abcdef01234567",
            "room_id": "!abc:example.com",
            "created": "2025-01-01T00:00:00Z",
            "room_created": "2025-01-01T00:00:01Z",
            "invitation_status": {"@admin:example.com": "invited"}
        }"#;
        let mapping: AgentRoomMapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.agent_name, "Meridian");
        assert_eq!(
            mapping.invitation_status.get("@admin:example.com").unwrap(),
            "invited"
        );
        let back = serde_json::to_value(&mapping).unwrap();
        assert_eq!(back["room_id"], "!abc:example.com");
    }

    #[test]
    fn webhook_envelope_parses_with_parts_content() {
        let json = r#"{
            "event_type": "agent.run.completed",
            "agent_id": "agent-1",
            "data": {
                "run_id": "run-9",
                "messages": [
                    {"message_type": "assistant_message",
                     "content": [{"type": "text", "text": "hi"}],
                     "run_id": "run-9"}
                ]
            }
        }"#;
        let hook: AgentResponseWebhook = serde_json::from_str(json).unwrap();
        assert_eq!(hook.data.run_id.as_deref(), Some("run-9"));
        assert!(hook.data.messages[0].content.as_ref().unwrap().is_array());
    }

    #[test]
    fn tool_selector_defaults_optional_fields() {
        let json = r#"{"event": "run_triggered", "agent_id": "agent-2"}"#;
        let hook: ToolSelectorWebhook = serde_json::from_str(json).unwrap();
        assert!(hook.tools_attached.is_empty());
        assert!(hook.new_run_id.is_none());
    }
}
