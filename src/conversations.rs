use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::models::{Conversation, ConversationRun, ConversationStatus};

/// Shared in-memory state for the conversation core: conversation records,
/// their two lookup indexes, the event dedup cache, and the proxy session
/// map. Each map has its own lock; there is no global lock. Everything here
/// is lost on restart by design — storage holds only durable mappings.
pub struct ConversationTracker {
    max_age: Duration,
    dedup_ttl: Duration,
    session_ttl: Duration,

    conversations: Mutex<HashMap<String, Conversation>>,
    /// agent_id → event_id of the latest non-terminal conversation.
    agent_index: Mutex<HashMap<String, String>>,
    /// run_id → event_id.
    run_index: Mutex<HashMap<String, String>>,
    /// fingerprint → first-seen time.
    dedup: Mutex<HashMap<String, DateTime<Utc>>>,
    /// session_id → (agent_id, last-touched).
    sessions: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConversationTracker {
    pub fn new(max_age_sec: u64, dedup_ttl_sec: u64) -> Self {
        ConversationTracker {
            max_age: Duration::seconds(max_age_sec as i64),
            dedup_ttl: Duration::seconds(dedup_ttl_sec as i64),
            session_ttl: Duration::seconds(3600),
            conversations: Mutex::new(HashMap::new()),
            agent_index: Mutex::new(HashMap::new()),
            run_index: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // --- Dedup cache ---

    /// Admit a fingerprint at most once per TTL window. Returns false for
    /// duplicates.
    pub fn admit(&self, fingerprint: &str) -> bool {
        let mut dedup = lock(&self.dedup);
        let now = Utc::now();
        match dedup.get(fingerprint) {
            Some(seen) if now - *seen < self.dedup_ttl => false,
            _ => {
                dedup.insert(fingerprint.to_string(), now);
                true
            }
        }
    }

    /// Fingerprint for non-Matrix origins.
    pub fn origin_fingerprint(kind: &str, sender: &str, ts: &str, nonce: &str) -> String {
        format!("{kind}:{sender}:{ts}:{nonce}")
    }

    // --- Conversations ---

    /// Start tracking a conversation for an inbound user message. Any
    /// earlier non-terminal conversation for the same agent is evicted from
    /// the routing index — only the latest is routable.
    pub fn start(
        &self,
        event_id: &str,
        room_id: &str,
        agent_id: &str,
        original_query: Option<String>,
    ) -> Conversation {
        let now = Utc::now().to_rfc3339();
        let conversation = Conversation {
            event_id: event_id.to_string(),
            room_id: room_id.to_string(),
            agent_id: agent_id.to_string(),
            status: ConversationStatus::Pending,
            runs: Vec::new(),
            tools_attached: None,
            original_query,
            created_at: now.clone(),
            updated_at: now,
        };
        lock(&self.conversations).insert(event_id.to_string(), conversation.clone());
        lock(&self.agent_index).insert(agent_id.to_string(), event_id.to_string());
        conversation
    }

    pub fn get(&self, event_id: &str) -> Option<Conversation> {
        lock(&self.conversations).get(event_id).cloned()
    }

    pub fn by_run(&self, run_id: &str) -> Option<Conversation> {
        let event_id = lock(&self.run_index).get(run_id).cloned()?;
        self.get(&event_id)
    }

    /// The latest non-terminal conversation for an agent, if any.
    pub fn active_for_agent(&self, agent_id: &str) -> Option<Conversation> {
        let event_id = lock(&self.agent_index).get(agent_id).cloned()?;
        let conversations = lock(&self.conversations);
        conversations
            .get(&event_id)
            .filter(|c| !c.status.is_terminal())
            .cloned()
    }

    /// Record a new run. First run moves `pending → active`; any previously
    /// active run in the conversation is marked completed. Terminal
    /// conversations reject further runs.
    pub fn add_run(
        &self,
        event_id: &str,
        run_id: &str,
        triggered_by: &str,
        parent_run_id: Option<String>,
    ) -> bool {
        let mut conversations = lock(&self.conversations);
        let Some(conversation) = conversations.get_mut(event_id) else {
            return false;
        };
        if conversation.status.is_terminal() {
            return false;
        }
        for run in conversation.runs.iter_mut() {
            if run.status == "active" {
                run.status = "completed".to_string();
            }
        }
        conversation.runs.push(ConversationRun {
            run_id: run_id.to_string(),
            triggered_by: triggered_by.to_string(),
            status: "active".to_string(),
            parent_run_id,
        });
        conversation.status = ConversationStatus::Active;
        conversation.updated_at = Utc::now().to_rfc3339();
        drop(conversations);

        lock(&self.run_index).insert(run_id.to_string(), event_id.to_string());
        true
    }

    /// Record the tool attachment that makes this a cross-run conversation.
    pub fn attach_tools(&self, event_id: &str, tools: &[String]) -> bool {
        let mut conversations = lock(&self.conversations);
        let Some(conversation) = conversations.get_mut(event_id) else {
            return false;
        };
        if conversation.status.is_terminal() {
            return false;
        }
        conversation.tools_attached = Some(tools.to_vec());
        conversation.updated_at = Utc::now().to_rfc3339();
        true
    }

    /// Compare-and-set into `completed`. Returns false when the
    /// conversation is unknown or already terminal, so a second delivery
    /// can never produce a second send.
    pub fn complete(&self, event_id: &str) -> bool {
        self.finish(event_id, ConversationStatus::Completed)
    }

    /// Compare-and-set into `timeout`.
    pub fn mark_timeout(&self, event_id: &str) -> bool {
        self.finish(event_id, ConversationStatus::Timeout)
    }

    fn finish(&self, event_id: &str, status: ConversationStatus) -> bool {
        let mut conversations = lock(&self.conversations);
        let Some(conversation) = conversations.get_mut(event_id) else {
            return false;
        };
        if conversation.status.is_terminal() {
            return false;
        }
        conversation.status = status;
        conversation.updated_at = Utc::now().to_rfc3339();
        for run in conversation.runs.iter_mut() {
            if run.status == "active" {
                run.status = "completed".to_string();
            }
        }
        let agent_id = conversation.agent_id.clone();
        drop(conversations);

        // Un-route the agent if this was its current conversation.
        let mut agent_index = lock(&self.agent_index);
        if agent_index.get(&agent_id).map(|e| e.as_str()) == Some(event_id) {
            agent_index.remove(&agent_id);
        }
        true
    }

    pub fn list_active(&self) -> Vec<Conversation> {
        lock(&self.conversations)
            .values()
            .filter(|c| !c.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> (usize, usize) {
        let conversations = lock(&self.conversations);
        let active = conversations
            .values()
            .filter(|c| !c.status.is_terminal())
            .count();
        (conversations.len(), active)
    }

    pub fn dedup_len(&self) -> usize {
        lock(&self.dedup).len()
    }

    // --- Session map ---

    pub fn bind_session(&self, session_id: &str, agent_id: &str) {
        lock(&self.sessions).insert(session_id.to_string(), (agent_id.to_string(), Utc::now()));
    }

    /// Resolve the acting agent for a session, sliding its TTL forward.
    pub fn agent_for_session(&self, session_id: &str) -> Option<String> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions.get_mut(session_id)?;
        if Utc::now() - entry.1 > self.session_ttl {
            sessions.remove(session_id);
            return None;
        }
        entry.1 = Utc::now();
        Some(entry.0.clone())
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    // --- Sweep ---

    /// Enforce TTLs. Marks over-age conversations as timed out, drops
    /// terminal records past the GC window, prunes the dedup cache and the
    /// session map. Returns the event ids freshly timed out, so the caller
    /// can cancel their monitors.
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut timed_out = Vec::new();

        {
            let mut conversations = lock(&self.conversations);
            let mut expired_terminal = Vec::new();
            for (event_id, conversation) in conversations.iter_mut() {
                let created = DateTime::parse_from_rfc3339(&conversation.created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(now);
                let age = now - created;
                if !conversation.status.is_terminal() && age > self.max_age {
                    conversation.status = ConversationStatus::Timeout;
                    conversation.updated_at = now.to_rfc3339();
                    timed_out.push(event_id.clone());
                } else if conversation.status.is_terminal() && age > self.max_age * 2 {
                    expired_terminal.push(event_id.clone());
                }
            }
            for event_id in &expired_terminal {
                conversations.remove(event_id);
            }
        }

        if !timed_out.is_empty() {
            let mut agent_index = lock(&self.agent_index);
            agent_index.retain(|_, event_id| !timed_out.contains(event_id));
        }

        {
            let dedup_ttl = self.dedup_ttl;
            lock(&self.dedup).retain(|_, seen| now - *seen < dedup_ttl);
        }
        {
            let session_ttl = self.session_ttl;
            lock(&self.sessions).retain(|_, (_, touched)| now - *touched < session_ttl);
        }
        {
            let conversations = lock(&self.conversations);
            lock(&self.run_index).retain(|_, event_id| conversations.contains_key(event_id));
        }

        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ConversationTracker {
        ConversationTracker::new(300, 3600)
    }

    #[test]
    fn dedup_admits_once() {
        let t = tracker();
        assert!(t.admit("$event1"));
        assert!(!t.admit("$event1"));
        assert!(t.admit("$event2"));
    }

    #[test]
    fn dedup_expires_after_ttl() {
        let t = ConversationTracker::new(300, 0);
        assert!(t.admit("$event1"));
        // TTL of zero: the second admit re-enters immediately.
        assert!(t.admit("$event1"));
    }

    #[test]
    fn origin_fingerprint_shape() {
        assert_eq!(
            ConversationTracker::origin_fingerprint("gossip", "peer1", "17000", "abc"),
            "gossip:peer1:17000:abc"
        );
    }

    #[test]
    fn start_then_run_then_complete() {
        let t = tracker();
        let c = t.start("$e1", "!room:hs", "agent-1", Some("hello".into()));
        assert_eq!(c.status, ConversationStatus::Pending);

        assert!(t.add_run("$e1", "run-1", "user_message", None));
        let c = t.get("$e1").unwrap();
        assert_eq!(c.status, ConversationStatus::Active);
        assert_eq!(c.runs.len(), 1);

        assert!(t.complete("$e1"));
        let c = t.get("$e1").unwrap();
        assert_eq!(c.status, ConversationStatus::Completed);
        // Terminal: no second completion, no more runs.
        assert!(!t.complete("$e1"));
        assert!(!t.add_run("$e1", "run-2", "tool_attachment", None));
    }

    #[test]
    fn new_run_completes_previous_run() {
        let t = tracker();
        t.start("$e1", "!room:hs", "agent-1", None);
        t.add_run("$e1", "run-1", "user_message", None);
        t.add_run("$e1", "run-2", "tool_attachment", Some("run-1".into()));
        let c = t.get("$e1").unwrap();
        assert_eq!(c.runs[0].status, "completed");
        assert_eq!(c.runs[1].status, "active");
        assert_eq!(c.runs[1].parent_run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn run_index_resolves_conversation() {
        let t = tracker();
        t.start("$e1", "!room:hs", "agent-1", None);
        t.add_run("$e1", "run-1", "user_message", None);
        assert_eq!(t.by_run("run-1").unwrap().event_id, "$e1");
        assert!(t.by_run("run-unknown").is_none());
    }

    #[test]
    fn latest_conversation_wins_the_agent_index() {
        let t = tracker();
        t.start("$e1", "!room:hs", "agent-1", None);
        t.start("$e2", "!room:hs", "agent-1", None);
        assert_eq!(t.active_for_agent("agent-1").unwrap().event_id, "$e2");
        // $e1 still exists but is no longer routable.
        assert!(t.get("$e1").is_some());
    }

    #[test]
    fn completion_unroutes_the_agent() {
        let t = tracker();
        t.start("$e1", "!room:hs", "agent-1", None);
        assert!(t.active_for_agent("agent-1").is_some());
        t.complete("$e1");
        assert!(t.active_for_agent("agent-1").is_none());
    }

    #[test]
    fn attach_tools_marks_crossrun() {
        let t = tracker();
        t.start("$e1", "!room:hs", "agent-1", None);
        assert!(t.attach_tools("$e1", &["search".to_string()]));
        let c = t.get("$e1").unwrap();
        assert_eq!(c.tools_attached.unwrap(), vec!["search".to_string()]);
    }

    #[test]
    fn sweep_times_out_overage_conversations() {
        let t = ConversationTracker::new(0, 3600);
        t.start("$e1", "!room:hs", "agent-1", None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let timed_out = t.sweep();
        assert_eq!(timed_out, vec!["$e1".to_string()]);
        assert_eq!(t.get("$e1").unwrap().status, ConversationStatus::Timeout);
        assert!(t.active_for_agent("agent-1").is_none());
        // Already terminal: the next sweep reports nothing new.
        assert!(t.sweep().is_empty());
    }

    #[test]
    fn session_map_binds_and_expires() {
        let t = tracker();
        t.bind_session("sess-1", "agent-1");
        assert_eq!(t.agent_for_session("sess-1").as_deref(), Some("agent-1"));
        assert!(t.agent_for_session("sess-unknown").is_none());
        assert_eq!(t.session_count(), 1);
    }

    #[test]
    fn counts_track_active() {
        let t = tracker();
        t.start("$e1", "!r:hs", "agent-1", None);
        t.start("$e2", "!r:hs", "agent-2", None);
        t.complete("$e1");
        let (total, active) = t.counts();
        assert_eq!(total, 2);
        assert_eq!(active, 1);
    }
}
