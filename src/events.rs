use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;

/// Cap on buffered events per subscription; oldest events are dropped on
/// overflow.
const SUBSCRIPTION_BUFFER_CAP: usize = 100;

/// One event class per thing a sync loop can deliver upward.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    RoomMessage {
        identity_id: String,
        room_id: String,
        event_id: String,
        sender: String,
        msgtype: String,
        body: String,
        origin_server_ts: i64,
    },
    RoomInvite {
        identity_id: String,
        room_id: String,
        inviter: String,
    },
    Membership {
        identity_id: String,
        room_id: String,
        user_id: String,
        membership: String,
    },
    StateEvent {
        identity_id: String,
        room_id: String,
        event_type: String,
        state_key: String,
    },
}

impl BridgeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BridgeEvent::RoomMessage { .. } => "room.message",
            BridgeEvent::RoomInvite { .. } => "room.invite",
            BridgeEvent::Membership { .. } => "membership",
            BridgeEvent::StateEvent { .. } => "state",
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            BridgeEvent::RoomMessage { room_id, .. }
            | BridgeEvent::RoomInvite { room_id, .. }
            | BridgeEvent::Membership { room_id, .. }
            | BridgeEvent::StateEvent { room_id, .. } => room_id,
        }
    }
}

/// Process-wide fan-out from sync loops to consumers. Per-client ordering
/// is preserved by the broadcast channel; cross-client ordering is not
/// guaranteed anywhere.
pub struct EventBus {
    pub sender: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: BridgeEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }
}

// --- Subscriptions ---

/// In-memory, in-process subscription: a filtered, bounded buffer of
/// events for one consumer. Dropped on restart by construction.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub identity_id: String,
    pub rooms: Vec<String>,
    pub event_types: Vec<String>,
    pub created_at: String,
    pub event_count: u64,
    buffer: VecDeque<BridgeEvent>,
}

impl Subscription {
    fn matches(&self, event: &BridgeEvent) -> bool {
        let room_ok = self.rooms.is_empty() || self.rooms.iter().any(|r| r == event.room_id());
        let type_ok = self.event_types.is_empty()
            || self.event_types.iter().any(|t| t == event.event_type());
        room_ok && type_ok
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and return its id.
    pub fn create(
        &self,
        identity_id: &str,
        rooms: Vec<String>,
        event_types: Vec<String>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let subscription = Subscription {
            id: id.clone(),
            identity_id: identity_id.to_string(),
            rooms,
            event_types,
            created_at: chrono::Utc::now().to_rfc3339(),
            event_count: 0,
            buffer: VecDeque::new(),
        };
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), subscription);
        id
    }

    pub fn destroy(&self, id: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Offer an event to every matching subscription, dropping the oldest
    /// buffered event when a buffer is full.
    pub fn offer(&self, event: &BridgeEvent) {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for subscription in subs.values_mut() {
            if !subscription.matches(event) {
                continue;
            }
            if subscription.buffer.len() >= SUBSCRIPTION_BUFFER_CAP {
                subscription.buffer.pop_front();
            }
            subscription.buffer.push_back(event.clone());
            subscription.event_count += 1;
        }
    }

    /// Drain up to `limit` buffered events for a subscription.
    pub fn drain(&self, id: &str, limit: usize) -> Vec<BridgeEvent> {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subscription) = subs.get_mut(id) else {
            return Vec::new();
        };
        let take = limit.min(subscription.buffer.len());
        subscription.buffer.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(room_id: &str, event_id: &str) -> BridgeEvent {
        BridgeEvent::RoomMessage {
            identity_id: "letta_agent-1".to_string(),
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            sender: "@user:hs".to_string(),
            msgtype: "m.text".to_string(),
            body: "hello".to_string(),
            origin_server_ts: 0,
        }
    }

    #[test]
    fn subscription_filters_by_room_and_type() {
        let registry = SubscriptionRegistry::new();
        let id = registry.create(
            "letta_agent-1",
            vec!["!a:hs".to_string()],
            vec!["room.message".to_string()],
        );

        registry.offer(&message_event("!a:hs", "$1"));
        registry.offer(&message_event("!b:hs", "$2"));
        registry.offer(&BridgeEvent::RoomInvite {
            identity_id: "letta_agent-1".to_string(),
            room_id: "!a:hs".to_string(),
            inviter: "@x:hs".to_string(),
        });

        let drained = registry.drain(&id, 10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].room_id(), "!a:hs");
    }

    #[test]
    fn buffer_drops_oldest_past_cap() {
        let registry = SubscriptionRegistry::new();
        let id = registry.create("letta_agent-1", vec![], vec![]);

        for i in 0..(SUBSCRIPTION_BUFFER_CAP + 5) {
            registry.offer(&message_event("!a:hs", &format!("${i}")));
        }

        let drained = registry.drain(&id, usize::MAX);
        assert_eq!(drained.len(), SUBSCRIPTION_BUFFER_CAP);
        // The first five events were evicted.
        if let BridgeEvent::RoomMessage { event_id, .. } = &drained[0] {
            assert_eq!(event_id, "$5");
        } else {
            panic!("expected room message");
        }
    }

    #[test]
    fn destroy_removes_subscription() {
        let registry = SubscriptionRegistry::new();
        let id = registry.create("letta_agent-1", vec![], vec![]);
        assert_eq!(registry.len(), 1);
        assert!(registry.destroy(&id));
        assert!(registry.is_empty());
        assert!(registry.drain(&id, 10).is_empty());
    }

    #[test]
    fn bus_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(message_event("!a:hs", "$1"));
    }
}
