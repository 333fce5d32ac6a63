use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use crate::agent_service::AgentServiceClient;
use crate::conversations::ConversationTracker;
use crate::events::{BridgeEvent, EventBus, SubscriptionRegistry};
use crate::storage::Storage;

/// Room→agent resolutions are cached briefly to keep the hot path off
/// storage.
const ROUTE_CACHE_TTL_SECS: i64 = 60;

/// Single consumer of the sync event bus. Messages inside one room arrive
/// and are processed in sync order; the agent-service forward is spawned so
/// one slow agent cannot stall other rooms.
pub fn spawn_ingress(
    bus: &EventBus,
    tracker: Arc<ConversationTracker>,
    storage: Arc<Storage>,
    agent_service: Arc<AgentServiceClient>,
    subscriptions: Arc<SubscriptionRegistry>,
) {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        let route_cache: Mutex<HashMap<String, (Option<String>, DateTime<Utc>)>> =
            Mutex::new(HashMap::new());

        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("⚠️ Ingress lagged, missed {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    eprintln!("Ingress: event bus closed, exiting");
                    break;
                }
            };

            subscriptions.offer(&event);

            let BridgeEvent::RoomMessage {
                room_id,
                event_id,
                sender,
                body,
                ..
            } = event
            else {
                continue;
            };

            if event_id.is_empty() {
                continue;
            }

            // Dedup first: at most one side effect per fingerprint per TTL.
            if !tracker.admit(&event_id) {
                eprintln!("↩️ duplicate event {event_id}");
                continue;
            }

            let Some(agent_id) =
                resolve_agent(&route_cache, &storage, &room_id).await
            else {
                eprintln!("↩️ no_route for {event_id} in {room_id}");
                continue;
            };

            tracker.start(&event_id, &room_id, &agent_id, Some(body.clone()));
            println!("📥 Routed {event_id} from {sender} to agent {agent_id}");

            let agent_service = agent_service.clone();
            tokio::spawn(async move {
                if let Err(e) = agent_service.send_prompt(&agent_id, &sender, &body).await {
                    eprintln!("⚠️ Prompt forward failed for {agent_id}: {e}");
                }
            });
        }
    });
}

async fn resolve_agent(
    cache: &Mutex<HashMap<String, (Option<String>, DateTime<Utc>)>>,
    storage: &Arc<Storage>,
    room_id: &str,
) -> Option<String> {
    {
        let cache = cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((agent_id, cached_at)) = cache.get(room_id)
            && Utc::now() - *cached_at < Duration::seconds(ROUTE_CACHE_TTL_SECS)
        {
            return agent_id.clone();
        }
    }

    let resolved = match storage.list_agent_mappings().await {
        Ok(mappings) => mappings
            .into_iter()
            .find(|m| m.room_id == room_id)
            .map(|m| m.agent_id),
        Err(e) => {
            // Transient storage failure: do not cache the miss.
            eprintln!("⚠️ Route lookup failed for {room_id}: {e}");
            return None;
        }
    };

    cache
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(room_id.to_string(), (resolved.clone(), Utc::now()));
    resolved
}
