use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::agent_service::AgentServiceClient;
use crate::models::AgentMessage;
use crate::webhooks::{WebhookProcessor, content_to_text, is_relay};

/// Posted when the monitor gives up waiting for the cross-run response.
const STILL_PROCESSING_REPLY: &str =
    "⏳ Still processing — the agent is taking longer than expected. \
     The response will arrive in this room when it completes.";

/// How many recent agent messages each poll inspects.
const POLL_FETCH_LIMIT: u32 = 20;

/// Live response monitors, one per tracked conversation, each owning a
/// cancellation handle. Webhook delivery cancels the matching monitor;
/// cancelling an absent or finished monitor is a no-op.
pub struct MonitorRegistry {
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    max_concurrent: usize,
}

impl MonitorRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        MonitorRegistry {
            cancels: Mutex::new(HashMap::new()),
            max_concurrent,
        }
    }

    /// Reserve a monitor slot for a conversation. Returns the cancel
    /// receiver, or `None` when the soft cap is reached (the caller answers
    /// `busy` and the run is picked up by a later cycle). A monitor already
    /// running for the same conversation is cancelled and replaced.
    pub fn try_register(&self, event_id: &str) -> Option<watch::Receiver<bool>> {
        let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = cancels.remove(event_id) {
            let _ = previous.send(true);
        } else if cancels.len() >= self.max_concurrent {
            return None;
        }
        let (tx, rx) = watch::channel(false);
        cancels.insert(event_id.to_string(), tx);
        Some(rx)
    }

    /// Cancel the monitor for a conversation, if one is live.
    pub fn cancel(&self, event_id: &str) {
        let removed = self
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(event_id);
        if let Some(tx) = removed {
            let _ = tx.send(true);
        }
    }

    /// Cancel everything (graceful shutdown).
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            cancels.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(true);
        }
    }

    fn finish(&self, event_id: &str) {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(event_id);
    }

    pub fn len(&self) -> usize {
        self.cancels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept only assistant text for the active run, authored strictly after
/// the conversation started, that is not inter-agent relay traffic.
fn acceptable_response(
    message: &AgentMessage,
    run_id: &str,
    conversation_created: DateTime<Utc>,
) -> Option<String> {
    if message.message_type.as_deref() != Some("assistant_message") {
        return None;
    }
    if message.run_id.as_deref() != Some(run_id) {
        return None;
    }
    let date = message
        .date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))?;
    if date <= conversation_created {
        return None;
    }
    let text = message.content.as_ref().and_then(content_to_text)?;
    if text.trim().is_empty() || is_relay(&text) {
        return None;
    }
    Some(text)
}

/// Poll the agent service until the cross-run response appears or the wait
/// budget runs out. Success goes through the same reply path as the
/// webhook branch; timeout posts a stock reply and marks the conversation.
#[allow(clippy::too_many_arguments)]
pub fn spawn_monitor(
    registry: Arc<MonitorRegistry>,
    processor: Arc<WebhookProcessor>,
    agent_service: Arc<AgentServiceClient>,
    mut cancel: watch::Receiver<bool>,
    event_id: String,
    agent_id: String,
    room_id: String,
    run_id: String,
    poll_interval_sec: u64,
    max_wait_sec: u64,
) {
    tokio::spawn(async move {
        let conversation_created = processor
            .tracker()
            .get(&event_id)
            .and_then(|c| DateTime::parse_from_rfc3339(&c.created_at).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let poll_interval = Duration::from_secs(poll_interval_sec.max(1));
        let max_polls = max_wait_sec / poll_interval_sec.max(1);

        for _ in 0..max_polls {
            tokio::select! {
                _ = cancel.changed() => {
                    println!("🛑 Monitor for {event_id} cancelled");
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
            if *cancel.borrow() {
                println!("🛑 Monitor for {event_id} cancelled");
                return;
            }

            let messages = match agent_service.list_messages(&agent_id, POLL_FETCH_LIMIT).await {
                Ok(messages) => messages,
                Err(e) => {
                    // Transient: keep polling until the budget runs out.
                    eprintln!("⚠️ Monitor poll failed for {agent_id}: {e}");
                    continue;
                }
            };

            let found = messages
                .iter()
                .find_map(|m| acceptable_response(m, &run_id, conversation_created));
            if let Some(text) = found {
                match processor
                    .deliver_reply(&agent_id, &room_id, &event_id, &text)
                    .await
                {
                    Ok(sent) => {
                        processor.tracker().complete(&event_id);
                        println!("✅ Monitor delivered {sent} for {event_id}");
                    }
                    Err(e) => eprintln!("⚠️ Monitor delivery failed for {event_id}: {e}"),
                }
                registry.finish(&event_id);
                return;
            }
        }

        // Budget exhausted: tell the room, close the conversation.
        if let Err(e) = processor
            .deliver_reply(&agent_id, &room_id, &event_id, STILL_PROCESSING_REPLY)
            .await
        {
            eprintln!("⚠️ Timeout notice failed for {event_id}: {e}");
        }
        processor.tracker().mark_timeout(&event_id);
        registry.finish(&event_id);
        println!("⌛ Monitor for {event_id} timed out");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_enforces_soft_cap() {
        let registry = MonitorRegistry::new(2);
        assert!(registry.try_register("$e1").is_some());
        assert!(registry.try_register("$e2").is_some());
        assert!(registry.try_register("$e3").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reregistering_replaces_and_cancels_previous() {
        let registry = MonitorRegistry::new(1);
        let rx1 = registry.try_register("$e1").unwrap();
        let rx2 = registry.try_register("$e1").unwrap();
        assert!(*rx1.borrow());
        assert!(!*rx2.borrow());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = MonitorRegistry::new(4);
        let rx = registry.try_register("$e1").unwrap();
        registry.cancel("$e1");
        assert!(*rx.borrow());
        registry.cancel("$e1");
        registry.cancel("$never-registered");
        assert!(registry.is_empty());
    }

    fn message(kind: &str, run: &str, date: &str, content: serde_json::Value) -> AgentMessage {
        AgentMessage {
            message_type: Some(kind.to_string()),
            content: Some(content),
            date: Some(date.to_string()),
            run_id: Some(run.to_string()),
        }
    }

    #[test]
    fn acceptance_filters_run_type_time_and_relay() {
        let created = DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let good = message("assistant_message", "run-2", "2025-06-01T12:00:05Z", json!("done"));
        assert_eq!(
            acceptable_response(&good, "run-2", created).as_deref(),
            Some("done")
        );

        let wrong_run = message("assistant_message", "run-1", "2025-06-01T12:00:05Z", json!("x"));
        assert!(acceptable_response(&wrong_run, "run-2", created).is_none());

        let too_early = message("assistant_message", "run-2", "2025-06-01T11:59:59Z", json!("x"));
        assert!(acceptable_response(&too_early, "run-2", created).is_none());

        let not_assistant = message("tool_call_message", "run-2", "2025-06-01T12:00:05Z", json!("x"));
        assert!(acceptable_response(&not_assistant, "run-2", created).is_none());

        let relay = message(
            "assistant_message",
            "run-2",
            "2025-06-01T12:00:05Z",
            json!("[INTER-AGENT MESSAGE from x] hi"),
        );
        assert!(acceptable_response(&relay, "run-2", created).is_none());

        let no_date = AgentMessage {
            message_type: Some("assistant_message".to_string()),
            content: Some(json!("x")),
            date: None,
            run_id: Some("run-2".to_string()),
        };
        assert!(acceptable_response(&no_date, "run-2", created).is_none());
    }

    #[test]
    fn boundary_timestamp_is_rejected() {
        // Strictly after: equal timestamps do not count.
        let created = DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let equal = message("assistant_message", "run-2", "2025-06-01T12:00:00Z", json!("x"));
        assert!(acceptable_response(&equal, "run-2", created).is_none());
    }
}
