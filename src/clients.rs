use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{RwLock, watch};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::identity::IdentityManager;
use crate::matrix::{MatrixClient, SyncResponse, errcode};
use crate::models::{Identity, SyncState};
use crate::storage::Storage;

/// Sync retry backoff bounds (seconds). Retries are unlimited.
const BACKOFF_MIN_SECS: u64 = 1;
const BACKOFF_MAX_SECS: u64 = 60;

/// One logical Matrix client in the pool. The inner `MatrixClient` is
/// swapped in place when a re-login rotates the access token.
pub struct PoolClient {
    pub identity_id: String,
    pub mxid: String,
    matrix: RwLock<MatrixClient>,
    ready: AtomicBool,
    stop: watch::Sender<bool>,
}

impl PoolClient {
    /// Snapshot of the current authenticated client.
    pub async fn matrix(&self) -> MatrixClient {
        self.matrix.read().await.clone()
    }

    /// True after the first successful sync batch.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Everything a sync loop needs besides its own client.
#[derive(Clone)]
struct SyncLoopCtx {
    storage: Arc<Storage>,
    identities: Arc<IdentityManager>,
    bus: Arc<EventBus>,
}

/// One long-lived authenticated client per identity, each with an
/// independent sync loop. There is no global event ordering; per-room
/// ordering holds because each loop is a single producer.
pub struct ClientPool {
    config: BridgeConfig,
    storage: Arc<Storage>,
    identities: Arc<IdentityManager>,
    bus: Arc<EventBus>,
    clients: Mutex<HashMap<String, Arc<PoolClient>>>,
}

impl ClientPool {
    pub fn new(
        config: BridgeConfig,
        storage: Arc<Storage>,
        identities: Arc<IdentityManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        ClientPool {
            config,
            storage,
            identities,
            bus,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pool client for an identity, opening it on first use.
    /// Opening sets the profile if it drifted and starts the sync loop.
    pub async fn acquire(&self, identity: &Identity) -> Result<Arc<PoolClient>> {
        if let Some(existing) = self.get(&identity.id) {
            return Ok(existing);
        }

        let matrix = MatrixClient::new(
            &self.config.homeserver_url,
            &identity.access_token,
            &identity.mxid,
        );

        if !identity.display_name.is_empty() {
            match matrix.get_display_name(&identity.mxid).await {
                Ok(current) if current.as_deref() == Some(identity.display_name.as_str()) => {}
                Ok(_) => {
                    if let Err(e) = matrix
                        .set_display_name(&identity.mxid, &identity.display_name)
                        .await
                    {
                        eprintln!("⚠️ Profile update failed for {}: {e}", identity.mxid);
                    }
                }
                Err(e) => eprintln!("⚠️ Profile check failed for {}: {e}", identity.mxid),
            }
            if let Some(avatar) = identity.avatar_url.as_deref()
                && let Err(e) = matrix.set_avatar_url(&identity.mxid, avatar).await
            {
                eprintln!("⚠️ Avatar update failed for {}: {e}", identity.mxid);
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let client = Arc::new(PoolClient {
            identity_id: identity.id.clone(),
            mxid: identity.mxid.clone(),
            matrix: RwLock::new(matrix),
            ready: AtomicBool::new(false),
            stop: stop_tx,
        });

        {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            // Lost race: another caller opened this identity first.
            if let Some(existing) = clients.get(&identity.id) {
                client.signal_stop();
                return Ok(existing.clone());
            }
            clients.insert(identity.id.clone(), client.clone());
        }

        let ctx = SyncLoopCtx {
            storage: self.storage.clone(),
            identities: self.identities.clone(),
            bus: self.bus.clone(),
        };
        let entry = client.clone();
        tokio::spawn(async move {
            run_sync_loop(ctx, entry, stop_rx).await;
        });

        println!("🔄 Sync loop started for {}", identity.mxid);
        Ok(client)
    }

    pub fn get(&self, identity_id: &str) -> Option<Arc<PoolClient>> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<PoolClient>> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop one client and forget it.
    pub fn release(&self, identity_id: &str) {
        let removed = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity_id);
        if let Some(client) = removed {
            client.signal_stop();
            println!("⏹️ Released client {identity_id}");
        }
    }

    /// Rebuild a client after its token was refreshed out of band.
    pub async fn restart(&self, identity_id: &str) -> Result<Arc<PoolClient>> {
        self.release(identity_id);
        let identity = self
            .storage
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| BridgeError::IdentityUnrecoverable(identity_id.to_string()))?;
        self.acquire(&identity).await
    }

    /// Graceful shutdown: signal every sync loop to exit.
    pub fn stop_all(&self) {
        let clients: Vec<_> = {
            let mut map = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, c)| c).collect()
        };
        for client in &clients {
            client.signal_stop();
        }
        if !clients.is_empty() {
            println!("⏹️ Stopped {} sync loops", clients.len());
        }
    }
}

// --- Sync loop ---

async fn run_sync_loop(ctx: SyncLoopCtx, client: Arc<PoolClient>, mut stop: watch::Receiver<bool>) {
    let filter = MatrixClient::sync_filter();
    let mut since = ctx
        .storage
        .get_sync_state(&client.identity_id)
        .await
        .ok()
        .and_then(|s| s.next_batch);
    let mut backoff = BACKOFF_MIN_SECS;

    loop {
        if *stop.borrow() {
            break;
        }
        let matrix = client.matrix().await;
        let sync = tokio::select! {
            _ = stop.changed() => break,
            result = matrix.sync(since.as_deref(), Some(&filter)) => result,
        };

        match sync {
            Ok(batch) => {
                backoff = BACKOFF_MIN_SECS;
                let first_batch = since.is_none();
                since = Some(batch.next_batch.clone());
                persist_sync_token(&ctx, &client.identity_id, &batch.next_batch).await;

                // The initial batch replays history; deliver nothing from
                // it, just mark the client ready.
                if !first_batch {
                    dispatch_batch(&ctx, &client, &batch).await;
                }
                client.ready.store(true, Ordering::Relaxed);
            }
            Err(BridgeError::Homeserver { status, body })
                if status == 401 || errcode(&body).as_deref() == Some("M_UNKNOWN_TOKEN") =>
            {
                eprintln!("🔐 Token invalid for {}, re-logging in", client.mxid);
                match ctx.identities.refresh_token(&client.identity_id).await {
                    Ok(identity) => {
                        // Resume from the last known sync token with the
                        // fresh credentials.
                        let rebuilt = matrix.with_token(&identity.access_token);
                        *client.matrix.write().await = rebuilt;
                    }
                    Err(e) => {
                        eprintln!("⚠️ Re-login failed for {}: {e}", client.mxid);
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX_SECS);
                    }
                }
            }
            Err(e) => {
                eprintln!("⚠️ Sync error for {}: {e}", client.mxid);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(BACKOFF_MAX_SECS);
            }
        }
    }
}

async fn persist_sync_token(ctx: &SyncLoopCtx, identity_id: &str, next_batch: &str) {
    let state = SyncState {
        next_batch: Some(next_batch.to_string()),
        updated_at: Some(chrono::Utc::now().to_rfc3339()),
    };
    if let Err(e) = ctx.storage.put_sync_state(identity_id, &state).await {
        eprintln!("⚠️ Could not persist sync state for {identity_id}: {e}");
    }
}

/// Turn one sync batch into bus events; auto-join invites.
async fn dispatch_batch(ctx: &SyncLoopCtx, client: &Arc<PoolClient>, batch: &SyncResponse) {
    for (room_id, invited) in &batch.rooms.invite {
        let inviter = invited
            .invite_state
            .events
            .iter()
            .find(|e| {
                e.event_type == "m.room.member"
                    && e.state_key.as_deref() == Some(client.mxid.as_str())
            })
            .map(|e| e.sender.clone())
            .unwrap_or_default();

        let matrix = client.matrix().await;
        match matrix.join_room(room_id).await {
            Ok(_) => println!("🚪 {} auto-joined {room_id}", client.mxid),
            Err(e) => eprintln!("⚠️ Auto-join failed for {} in {room_id}: {e}", client.mxid),
        }
        ctx.bus.publish(BridgeEvent::RoomInvite {
            identity_id: client.identity_id.clone(),
            room_id: room_id.clone(),
            inviter,
        });
    }

    for (room_id, joined) in &batch.rooms.join {
        for event in &joined.timeline.events {
            match event.event_type.as_str() {
                "m.room.message" => {
                    // Own echoes would route straight back to the agent.
                    if event.sender == client.mxid {
                        continue;
                    }
                    let body = event.content["body"].as_str().unwrap_or_default();
                    if body.trim().is_empty() {
                        continue;
                    }
                    ctx.bus.publish(BridgeEvent::RoomMessage {
                        identity_id: client.identity_id.clone(),
                        room_id: room_id.clone(),
                        event_id: event.event_id.clone().unwrap_or_default(),
                        sender: event.sender.clone(),
                        msgtype: event.content["msgtype"]
                            .as_str()
                            .unwrap_or("m.text")
                            .to_string(),
                        body: body.to_string(),
                        origin_server_ts: event.origin_server_ts.unwrap_or_default(),
                    });
                }
                "m.room.member" => {
                    ctx.bus.publish(BridgeEvent::Membership {
                        identity_id: client.identity_id.clone(),
                        room_id: room_id.clone(),
                        user_id: event.state_key.clone().unwrap_or_default(),
                        membership: event.content["membership"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
                other if event.state_key.is_some() => {
                    ctx.bus.publish(BridgeEvent::StateEvent {
                        identity_id: client.identity_id.clone(),
                        room_id: room_id.clone(),
                        event_type: other.to_string(),
                        state_key: event.state_key.clone().unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }
    }
}
