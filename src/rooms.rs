use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::identity::IdentityManager;
use crate::matrix::{CreateRoomRequest, MatrixClient, errcode};
use crate::models::{AgentRoomMapping, DmRoomMapping, Identity, IdentityKind, SpaceConfig};
use crate::storage::{Storage, dm_key};

use crate::clients::ClientPool;

/// Room topology: DM rooms, dedicated agent rooms, and the parent space.
/// All membership policy lives here.
pub struct RoomOrchestrator {
    config: BridgeConfig,
    storage: Arc<Storage>,
    identities: Arc<IdentityManager>,
    pool: Arc<ClientPool>,
    // Space creation must be a singleton operation.
    space_lock: Mutex<()>,
}

impl RoomOrchestrator {
    pub fn new(
        config: BridgeConfig,
        storage: Arc<Storage>,
        identities: Arc<IdentityManager>,
        pool: Arc<ClientPool>,
    ) -> Self {
        RoomOrchestrator {
            config,
            storage,
            identities,
            pool,
            space_lock: Mutex::new(()),
        }
    }

    // --- DM rooms ---

    /// Return the DM room between two users, creating it from the `from`
    /// identity's client on first use. Symmetric and idempotent.
    pub async fn get_or_create_dm(&self, from: &Identity, to_mxid: &str) -> Result<String> {
        let key = dm_key(&from.mxid, to_mxid);
        if let Some(mut existing) = self.storage.get_dm(&key).await? {
            existing.last_activity_at = chrono::Utc::now().to_rfc3339();
            self.storage.put_dm(&key, &existing).await?;
            return Ok(existing.room_id);
        }

        let client = self.pool.get(&from.id).ok_or_else(|| {
            BridgeError::RoomUnreachable(format!("no pool client for {}", from.id))
        })?;
        let matrix = client.matrix().await;

        // Both participants at power 100.
        let mut users = serde_json::Map::new();
        users.insert(from.mxid.clone(), json!(100));
        users.insert(to_mxid.to_string(), json!(100));

        let request = CreateRoomRequest {
            preset: Some("trusted_private_chat".to_string()),
            is_direct: Some(true),
            invite: vec![to_mxid.to_string()],
            power_level_content_override: Some(json!({"users": users})),
            ..Default::default()
        };
        let room_id = matrix
            .create_room(&request)
            .await
            .map_err(|e| BridgeError::RoomUnreachable(e.to_string()))?;

        self.mark_direct(&matrix, &from.mxid, to_mxid, &room_id).await;
        if let Some(peer) = self.pool_client_by_mxid(to_mxid).await {
            self.mark_direct(&peer, to_mxid, &from.mxid, &room_id).await;
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mapping = DmRoomMapping {
            room_id: room_id.clone(),
            participants: {
                let (a, b) = if from.mxid.as_str() <= to_mxid {
                    (from.mxid.clone(), to_mxid.to_string())
                } else {
                    (to_mxid.to_string(), from.mxid.clone())
                };
                (a, b)
            },
            created_at: now.clone(),
            last_activity_at: now,
        };
        self.storage.put_dm(&key, &mapping).await?;
        println!("💬 Created DM room {room_id} for {key}");
        Ok(room_id)
    }

    /// Merge the room into the user's `m.direct` account data.
    async fn mark_direct(&self, matrix: &MatrixClient, owner: &str, peer: &str, room_id: &str) {
        let mut direct = match matrix.get_account_data(owner, "m.direct").await {
            Ok(value) => value,
            Err(e) => {
                eprintln!("⚠️ Could not read m.direct for {owner}: {e}");
                json!({})
            }
        };
        let rooms = direct
            .as_object_mut()
            .map(|map| map.entry(peer.to_string()).or_insert_with(|| json!([])));
        if let Some(rooms) = rooms
            && let Some(list) = rooms.as_array_mut()
            && !list.iter().any(|r| r == room_id)
        {
            list.push(json!(room_id));
        }
        if let Err(e) = matrix.set_account_data(owner, "m.direct", &direct).await {
            eprintln!("⚠️ Could not write m.direct for {owner}: {e}");
        }
    }

    async fn pool_client_by_mxid(&self, mxid: &str) -> Option<MatrixClient> {
        for client in self.pool.list() {
            if client.mxid == mxid {
                return Some(client.matrix().await);
            }
        }
        None
    }

    // --- Agent rooms ---

    /// Get or create the dedicated room for an agent, owned by the agent's
    /// own identity. Reuses the stored room when it is still joinable;
    /// otherwise the mapping is rewritten with a replacement room.
    pub async fn get_or_create_agent_room(
        &self,
        agent_id: &str,
        agent_name: &str,
        caller: &Identity,
    ) -> Result<AgentRoomMapping> {
        let agent_identity = self
            .identities
            .get_or_create(IdentityKind::Letta, agent_id, agent_name, None)
            .await?;
        let agent_client = self.pool.acquire(&agent_identity).await?;
        let matrix = agent_client.matrix().await;

        if let Some(mut mapping) = self.storage.get_agent_mapping(agent_id).await? {
            match matrix.join_room(&mapping.room_id).await {
                Ok(_) => {
                    let mut changed = false;
                    for party in self.invite_parties(caller, &agent_identity) {
                        let tracked = mapping.invitation_status.get(&party);
                        if matches!(tracked.map(|s| s.as_str()), Some("invited" | "joined")) {
                            continue;
                        }
                        let status = self.invite_with_policy(&matrix, &mapping.room_id, &party).await;
                        mapping.invitation_status.insert(party, status);
                        changed = true;
                    }
                    if changed {
                        self.storage.put_agent_mapping(&mapping).await?;
                    }
                    self.attach_to_space(&matrix, &mapping.room_id).await;
                    return Ok(mapping);
                }
                Err(e) => {
                    eprintln!(
                        "⚠️ Agent room {} unreachable ({e}), creating a replacement",
                        mapping.room_id
                    );
                }
            }
        }

        // Fresh room, created and owned by the agent's client.
        let parties = self.invite_parties(caller, &agent_identity);
        let request = CreateRoomRequest {
            name: Some(agent_name.to_string()),
            topic: Some(format!("Chat with {agent_name}")),
            preset: Some("private_chat".to_string()),
            invite: parties.clone(),
            initial_state: vec![json!({
                "type": "m.room.history_visibility",
                "state_key": "",
                "content": {"history_visibility": "shared"}
            })],
            ..Default::default()
        };
        let room_id = matrix
            .create_room(&request)
            .await
            .map_err(|e| BridgeError::RoomUnreachable(e.to_string()))?;

        let now = chrono::Utc::now().to_rfc3339();
        let mut mapping = AgentRoomMapping {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            matrix_user_id: agent_identity.mxid.clone(),
            matrix_password: agent_identity.password.clone(),
            room_id: room_id.clone(),
            created: now.clone(),
            room_created: now,
            invitation_status: Default::default(),
        };
        for party in parties {
            mapping.invitation_status.insert(party, "invited".to_string());
        }

        // Rewritten atomically: exactly one room_id per agent in the live set.
        self.storage.put_agent_mapping(&mapping).await?;
        println!("🏠 Created agent room {room_id} for {agent_id}");

        self.attach_to_space(&matrix, &room_id).await;
        Ok(mapping)
    }

    /// Caller, bridge bot, admin, and owner — minus the agent itself and
    /// duplicates.
    fn invite_parties(&self, caller: &Identity, agent: &Identity) -> Vec<String> {
        let mut parties: Vec<String> = Vec::new();
        let mut push = |mxid: Option<&str>| {
            if let Some(mxid) = mxid
                && !mxid.is_empty()
                && mxid != agent.mxid
                && !parties.iter().any(|p| p == mxid)
            {
                parties.push(mxid.to_string());
            }
        };
        push(Some(caller.mxid.as_str()));
        push(self.config.bridge_mxid.as_deref());
        push(Some(self.config.admin_user_id().as_str()));
        push(self.config.owner_mxid.as_deref());
        parties
    }

    /// Invite one user under the forgiving policy: `M_FORBIDDEN` usually
    /// means already present and is not an error; anything else is recorded
    /// as failed without aborting room setup.
    async fn invite_with_policy(
        &self,
        matrix: &MatrixClient,
        room_id: &str,
        mxid: &str,
    ) -> String {
        match matrix.invite(room_id, mxid).await {
            Ok(()) => "invited".to_string(),
            Err(BridgeError::Homeserver { body, .. })
                if errcode(&body).as_deref() == Some("M_FORBIDDEN") =>
            {
                println!("👥 {mxid} already present in {room_id}");
                "invited".to_string()
            }
            Err(e) => {
                eprintln!("⚠️ Invite of {mxid} to {room_id} failed: {e}");
                "failed".to_string()
            }
        }
    }

    // --- Space ---

    /// Ensure the parent space exists and contains the room. Space failures
    /// never fail room creation; the room is simply left unparented until
    /// the next attempt.
    async fn attach_to_space(&self, matrix: &MatrixClient, room_id: &str) {
        match self.ensure_space(matrix).await {
            Ok(space_id) => {
                if let Err(e) = self.add_room_to_space(matrix, &space_id, room_id).await {
                    eprintln!("⚠️ Could not parent {room_id} under {space_id}: {e}");
                }
            }
            Err(e) => eprintln!("⚠️ Space unavailable: {e}"),
        }
    }

    /// Reuse the configured space when it is still accessible, otherwise
    /// create it and migrate every known agent room into it.
    pub async fn ensure_space(&self, matrix: &MatrixClient) -> Result<String> {
        let _guard = self.space_lock.lock().await;

        if let Some(existing) = self.storage.get_space_config().await? {
            match matrix
                .get_state_event(&existing.space_id, "m.room.create", "")
                .await
            {
                Ok(_) => return Ok(existing.space_id),
                Err(e) => {
                    eprintln!(
                        "⚠️ Stored space {} inaccessible ({e}), recreating",
                        existing.space_id
                    );
                }
            }
        }

        let request = CreateRoomRequest {
            name: Some(self.config.space_name.clone()),
            topic: Some("Agent rooms".to_string()),
            preset: Some("private_chat".to_string()),
            creation_content: Some(json!({"type": "m.space"})),
            ..Default::default()
        };
        let space_id = matrix
            .create_room(&request)
            .await
            .map_err(|e| BridgeError::SpaceUnavailable(e.to_string()))?;

        self.storage
            .put_space_config(&SpaceConfig {
                space_id: space_id.clone(),
                name: self.config.space_name.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
            })
            .await?;
        println!("🌌 Created space {space_id} ({})", self.config.space_name);

        // Migrate rooms that predate the space.
        for mapping in self.storage.list_agent_mappings().await? {
            if mapping.room_id == space_id {
                continue;
            }
            if let Err(e) = self
                .add_room_to_space(matrix, &space_id, &mapping.room_id)
                .await
            {
                eprintln!("⚠️ Space migration failed for {}: {e}", mapping.room_id);
            }
        }

        Ok(space_id)
    }

    /// Publish the reciprocal space membership pair, both carrying the
    /// homeserver in `via`.
    async fn add_room_to_space(
        &self,
        matrix: &MatrixClient,
        space_id: &str,
        room_id: &str,
    ) -> Result<()> {
        let via = json!({"via": [self.config.server_name.clone()]});
        matrix
            .send_state_event(space_id, "m.space.child", room_id, &via)
            .await?;
        matrix
            .send_state_event(
                room_id,
                "m.space.parent",
                space_id,
                &json!({"via": [self.config.server_name.clone()], "canonical": true}),
            )
            .await?;
        Ok(())
    }
}
