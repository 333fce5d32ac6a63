use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::clients::ClientPool;
use crate::config::BridgeConfig;
use crate::conversations::ConversationTracker;
use crate::error::{BridgeError, Result};
use crate::matrix::MatrixClient;
use crate::models::AgentMessage;
use crate::monitor::MonitorRegistry;
use crate::storage::Storage;

type HmacSha256 = Hmac<Sha256>;

/// Agent→room lookups are cached briefly; the mapping rarely changes.
const ROOM_CACHE_TTL_SECS: i64 = 60;

/// Audit posts are clipped to keep notices readable.
const AUDIT_MAX_CHARS: usize = 500;

/// Messages relayed between agents by other bridge paths; replying to them
/// would loop.
const RELAY_PREFIXES: [&str; 3] = [
    "[INTER-AGENT MESSAGE from",
    "[MESSAGE FROM OPENCODE USER]",
    "[FORWARDED FROM",
];

// --- Signature verification ---

/// Parse a `t=<unix>,v1=<hex>` signature header.
fn parse_signature_header(header: &str) -> Option<(String, String)> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t.to_string());
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signature = Some(v1.to_string());
        }
    }
    Some((timestamp?, signature?))
}

/// HMAC-SHA256 over `"<t>.<rawBody>"`, compared in constant time.
pub fn verify_signature(secret: &str, header: &str, raw_body: &[u8]) -> bool {
    let Some((timestamp, provided_hex)) = parse_signature_header(header) else {
        return false;
    };
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

// --- Content extraction ---

/// Flatten one message's `content` into text: a plain string, an array of
/// typed parts (text parts joined with newlines), or an object carrying a
/// `text` field.
pub fn content_to_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p["type"].as_str() == Some("text"))
                .filter_map(|p| p["text"].as_str())
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        Value::Object(map) => map.get("text").and_then(|t| t.as_str()).map(|s| s.to_string()),
        _ => None,
    }
}

/// The longest assistant message wins; tool chatter and heartbeats are
/// usually short.
pub fn extract_assistant_text(messages: &[AgentMessage]) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.message_type.as_deref() == Some("assistant_message"))
        .filter_map(|m| m.content.as_ref().and_then(content_to_text))
        .filter(|t| !t.trim().is_empty())
        .max_by_key(|t| t.len())
}

pub fn is_relay(text: &str) -> bool {
    RELAY_PREFIXES.iter().any(|p| text.starts_with(p))
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max).collect();
    format!("{clipped}…")
}

// --- Processor ---

/// Webhook sink and outbound delivery for the conversation core. Shared by
/// the HTTP surface and the response monitors.
pub struct WebhookProcessor {
    config: BridgeConfig,
    tracker: Arc<ConversationTracker>,
    pool: Arc<ClientPool>,
    storage: Arc<Storage>,
    monitors: Arc<MonitorRegistry>,
    room_cache: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl WebhookProcessor {
    pub fn new(
        config: BridgeConfig,
        tracker: Arc<ConversationTracker>,
        pool: Arc<ClientPool>,
        storage: Arc<Storage>,
        monitors: Arc<MonitorRegistry>,
    ) -> Self {
        WebhookProcessor {
            config,
            tracker,
            pool,
            storage,
            monitors,
            room_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<ConversationTracker> {
        &self.tracker
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Signature gate for the agent-response endpoint. The dev skip is the
    /// single authoritative switch.
    pub fn verify(&self, header: Option<&str>, raw_body: &[u8]) -> bool {
        if self.config.webhook_skip_verification {
            return true;
        }
        match header {
            Some(header) => verify_signature(&self.config.webhook_secret, header, raw_body),
            None => false,
        }
    }

    /// Handle one agent-completion webhook. Returns the structured status
    /// body; routing drops are statuses, not errors.
    pub async fn process_agent_response(
        &self,
        agent_id: &str,
        run_id: Option<&str>,
        messages: &[AgentMessage],
    ) -> Value {
        let Some(text) = extract_assistant_text(messages) else {
            return json!({"status": "no_assistant_content"});
        };
        if is_relay(&text) {
            eprintln!("↩️ Dropping inter-agent relay for {agent_id}");
            return json!({"status": "inter_agent_relay"});
        }

        let Some(room_id) = self.agent_room(agent_id).await else {
            eprintln!("↩️ No room mapped for agent {agent_id}");
            return json!({"status": "no_route"});
        };

        // Cross-run delivery: a tracked conversation that had tools
        // attached between runs gets a threaded reply.
        if let Some(conversation) = self.tracker.active_for_agent(agent_id)
            && conversation
                .tools_attached
                .as_ref()
                .is_some_and(|tools| !tools.is_empty())
        {
            if let Some(run_id) = run_id {
                self.tracker
                    .add_run(&conversation.event_id, run_id, "agent_response", None);
            }
            match self
                .deliver_reply(agent_id, &room_id, &conversation.event_id, &text)
                .await
            {
                Ok(sent_event) => {
                    self.tracker.complete(&conversation.event_id);
                    self.monitors.cancel(&conversation.event_id);
                    println!(
                        "✅ Cross-run reply {sent_event} delivered for {agent_id} → {}",
                        conversation.event_id
                    );
                    return json!({
                        "status": "delivered",
                        "conversation_id": conversation.event_id,
                        "event_id": sent_event,
                    });
                }
                Err(e) => {
                    // Conversation stays active; the monitor keeps trying.
                    eprintln!("⚠️ Reply delivery failed for {agent_id}: {e}");
                    return json!({"status": "delivery_failed", "error": e.to_string()});
                }
            }
        }

        if self.config.audit_non_matrix {
            let tag = if self.tracker.active_for_agent(agent_id).is_some() {
                "Direct"
            } else {
                "CLI/API"
            };
            match self.post_audit(agent_id, &room_id, &text, tag).await {
                Ok(_) => return json!({"status": "audited"}),
                Err(e) => {
                    eprintln!("⚠️ Audit post failed for {agent_id}: {e}");
                    return json!({"status": "delivery_failed", "error": e.to_string()});
                }
            }
        }

        json!({"status": "no_crossrun_conversation"})
    }

    /// Post an assistant response as a reply to the original Matrix event,
    /// attributed to the agent's own identity.
    pub async fn deliver_reply(
        &self,
        agent_id: &str,
        room_id: &str,
        reply_to_event: &str,
        text: &str,
    ) -> Result<String> {
        let matrix = self.sender_for(agent_id, room_id).await?;
        let content = json!({
            "msgtype": "m.text",
            "body": text,
            "m.relates_to": {
                "m.in_reply_to": {"event_id": reply_to_event}
            }
        });
        matrix.send_event(room_id, "m.room.message", &content).await
    }

    /// Quiet `m.notice` for responses with no Matrix conversation, tagged
    /// with their origin and clipped.
    async fn post_audit(
        &self,
        agent_id: &str,
        room_id: &str,
        text: &str,
        source_tag: &str,
    ) -> Result<String> {
        let matrix = self.sender_for(agent_id, room_id).await?;
        let clipped = truncate_chars(text, AUDIT_MAX_CHARS);
        let body = format!("🖥️ **[{source_tag}]**\n{clipped}");
        let formatted = format!(
            "🖥️ <strong>[{source_tag}]</strong><br/>{}",
            escape_html(&clipped)
        );
        let content = json!({
            "msgtype": "m.notice",
            "body": body,
            "format": "org.matrix.custom.html",
            "formatted_body": formatted,
        });
        matrix.send_event(room_id, "m.room.message", &content).await
    }

    /// Prefer the agent's own client; fall back to any pool client already
    /// in the target room.
    async fn sender_for(&self, agent_id: &str, room_id: &str) -> Result<MatrixClient> {
        let preferred_id = format!("letta_{agent_id}");
        if let Some(client) = self.pool.get(&preferred_id) {
            return Ok(client.matrix().await);
        }
        for candidate in self.pool.list() {
            let matrix = candidate.matrix().await;
            if let Ok(members) = matrix.joined_members(room_id).await
                && members.iter().any(|m| m == &candidate.mxid)
            {
                println!("📤 Falling back to {} for {agent_id}", candidate.mxid);
                return Ok(matrix);
            }
        }
        Err(BridgeError::RoomUnreachable(format!(
            "no pool client can post into {room_id}"
        )))
    }

    /// Room lookup through the short-lived cache, then storage.
    pub async fn agent_room(&self, agent_id: &str) -> Option<String> {
        {
            let cache = self.room_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((room_id, cached_at)) = cache.get(agent_id)
                && Utc::now() - *cached_at < Duration::seconds(ROOM_CACHE_TTL_SECS)
            {
                return Some(room_id.clone());
            }
        }
        let mapping = self.storage.get_agent_mapping(agent_id).await.ok()??;
        self.room_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), (mapping.room_id.clone(), Utc::now()));
        Some(mapping.room_id)
    }

    /// Complete the newest active conversation for an agent with an
    /// out-of-band response text (`POST /conversations/response`).
    pub async fn complete_with_text(&self, agent_id: &str, text: &str) -> Value {
        let Some(conversation) = self.tracker.active_for_agent(agent_id) else {
            return json!({"status": "no_active_conversation"});
        };
        // The reply must never land while the conversation is still pending.
        self.tracker.add_run(
            &conversation.event_id,
            &format!("external-{}", uuid::Uuid::new_v4()),
            "external_response",
            None,
        );
        match self
            .deliver_reply(agent_id, &conversation.room_id, &conversation.event_id, text)
            .await
        {
            Ok(sent_event) => {
                self.tracker.complete(&conversation.event_id);
                self.monitors.cancel(&conversation.event_id);
                json!({
                    "status": "completed",
                    "conversation_id": conversation.event_id,
                    "event_id": sent_event,
                })
            }
            Err(e) => json!({"status": "delivery_failed", "error": e.to_string()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"event_type":"agent.run.completed"}"#;
        let header = sign("whsec", "1700000000", body);
        assert!(verify_signature("whsec", &header, body));
    }

    #[test]
    fn signature_rejects_tampering() {
        let body = br#"{"event_type":"agent.run.completed"}"#;
        let header = sign("whsec", "1700000000", body);
        assert!(!verify_signature("whsec", &header, b"{}"));
        assert!(!verify_signature("other-secret", &header, body));
    }

    #[test]
    fn signature_rejects_malformed_headers() {
        let body = b"{}";
        assert!(!verify_signature("whsec", "", body));
        assert!(!verify_signature("whsec", "t=123", body));
        assert!(!verify_signature("whsec", "v1=abcd", body));
        assert!(!verify_signature("whsec", "t=123,v1=nothex", body));
    }

    fn assistant(content: Value) -> AgentMessage {
        AgentMessage {
            message_type: Some("assistant_message".to_string()),
            content: Some(content),
            date: None,
            run_id: None,
        }
    }

    #[test]
    fn extracts_string_content() {
        let messages = vec![assistant(json!("done"))];
        assert_eq!(extract_assistant_text(&messages).as_deref(), Some("done"));
    }

    #[test]
    fn extracts_text_parts_ignoring_other_types() {
        let messages = vec![assistant(json!([
            {"type": "text", "text": "hi"},
            {"type": "image", "url": "mxc://x"}
        ]))];
        assert_eq!(extract_assistant_text(&messages).as_deref(), Some("hi"));
    }

    #[test]
    fn concatenates_multiple_text_parts() {
        let messages = vec![assistant(json!([
            {"type": "text", "text": "line one"},
            {"type": "text", "text": "line two"}
        ]))];
        assert_eq!(
            extract_assistant_text(&messages).as_deref(),
            Some("line one\nline two")
        );
    }

    #[test]
    fn extracts_object_text_field() {
        let messages = vec![assistant(json!({"text": "hello"}))];
        assert_eq!(extract_assistant_text(&messages).as_deref(), Some("hello"));
    }

    #[test]
    fn longest_assistant_message_wins() {
        let messages = vec![
            assistant(json!("ok")),
            assistant(json!("a much longer final answer")),
            AgentMessage {
                message_type: Some("tool_call_message".to_string()),
                content: Some(json!("this one is even longer but not assistant")),
                date: None,
                run_id: None,
            },
        ];
        assert_eq!(
            extract_assistant_text(&messages).as_deref(),
            Some("a much longer final answer")
        );
    }

    #[test]
    fn no_assistant_content_cases() {
        assert!(extract_assistant_text(&[]).is_none());
        let messages = vec![assistant(json!(42)), assistant(json!("   "))];
        assert!(extract_assistant_text(&messages).is_none());
    }

    #[test]
    fn relay_prefixes_are_dropped() {
        assert!(is_relay("[INTER-AGENT MESSAGE from agent-2] hi"));
        assert!(is_relay("[MESSAGE FROM OPENCODE USER] build it"));
        assert!(is_relay("[FORWARDED FROM gossip] x"));
        assert!(!is_relay("normal response [FORWARDED FROM x]"));
    }

    #[test]
    fn html_escaping() {
        assert_eq!(
            escape_html(r#"<b>"x" & 'y'</b>"#),
            "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn truncation_clips_long_text() {
        let long = "x".repeat(600);
        let clipped = truncate_chars(&long, AUDIT_MAX_CHARS);
        assert_eq!(clipped.chars().count(), AUDIT_MAX_CHARS + 1);
        assert!(clipped.ends_with('…'));
        assert_eq!(truncate_chars("short", AUDIT_MAX_CHARS), "short");
    }
}
