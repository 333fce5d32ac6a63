use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::models::{AgentRoomMapping, DmRoomMapping, Identity, SpaceConfig, SyncState};

/// Remote storage back-end: the bridge's internal REST surface.
/// Every accessor is asynchronous; unreachability and 5xx surface as
/// `StorageUnavailable` so callers retry.
pub struct ApiStore {
    http: reqwest::Client,
    base_url: String,
    internal_key: String,
}

impl ApiStore {
    pub fn new(base_url: &str, internal_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create storage HTTP client");
        ApiStore {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            internal_key: internal_key.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self
            .http
            .get(self.url(path))
            .header("X-Internal-Key", &self.internal_key)
            .send()
            .await
            .map_err(|e| BridgeError::StorageUnavailable(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.json().await.map_err(|e| {
                BridgeError::StorageCorrupt(format!("{path}: {e}"))
            })?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => Err(BridgeError::StorageUnavailable(format!(
                "GET {path}: HTTP {s}"
            ))),
        }
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let resp = self
            .http
            .put(self.url(path))
            .header("X-Internal-Key", &self.internal_key)
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeError::StorageUnavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BridgeError::StorageUnavailable(format!(
                "PUT {path}: HTTP {}",
                resp.status()
            )))
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .header("X-Internal-Key", &self.internal_key)
            .send()
            .await
            .map_err(|e| BridgeError::StorageUnavailable(e.to_string()))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(BridgeError::StorageUnavailable(format!(
                "DELETE {path}: HTTP {}",
                resp.status()
            )))
        }
    }

    // --- Identities ---

    pub async fn get_identity(&self, id: &str) -> Result<Option<Identity>> {
        self.get_json(&format!(
            "/api/v1/internal/identities/{}",
            urlencoding::encode(id)
        ))
        .await
    }

    pub async fn get_identity_by_mxid(&self, mxid: &str) -> Result<Option<Identity>> {
        let found: Option<Vec<Identity>> = self
            .get_json(&format!(
                "/api/v1/internal/identities?mxid={}",
                urlencoding::encode(mxid)
            ))
            .await?;
        Ok(found.and_then(|list| list.into_iter().next()))
    }

    pub async fn put_identity(&self, identity: &Identity) -> Result<()> {
        self.put_json(
            &format!(
                "/api/v1/internal/identities/{}",
                urlencoding::encode(&identity.id)
            ),
            identity,
        )
        .await
    }

    pub async fn delete_identity(&self, id: &str) -> Result<()> {
        self.delete(&format!(
            "/api/v1/internal/identities/{}",
            urlencoding::encode(id)
        ))
        .await
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        Ok(self
            .get_json("/api/v1/internal/identities")
            .await?
            .unwrap_or_default())
    }

    pub async fn historical_passwords(&self, mxid: &str) -> Result<Vec<String>> {
        Ok(self
            .get_json(&format!(
                "/api/v1/internal/identities/password-history?mxid={}",
                urlencoding::encode(mxid)
            ))
            .await?
            .unwrap_or_default())
    }

    // --- DM rooms ---

    pub async fn get_dm(&self, key: &str) -> Result<Option<DmRoomMapping>> {
        self.get_json(&format!("/api/v1/dm-rooms/{}", urlencoding::encode(key)))
            .await
    }

    pub async fn put_dm(&self, key: &str, mapping: &DmRoomMapping) -> Result<()> {
        self.put_json(
            &format!("/api/v1/dm-rooms/{}", urlencoding::encode(key)),
            mapping,
        )
        .await
    }

    // --- Agent rooms ---

    pub async fn get_agent_mapping(&self, agent_id: &str) -> Result<Option<AgentRoomMapping>> {
        self.get_json(&format!(
            "/api/v1/internal/agent-rooms/{}",
            urlencoding::encode(agent_id)
        ))
        .await
    }

    pub async fn put_agent_mapping(&self, mapping: &AgentRoomMapping) -> Result<()> {
        self.put_json(
            &format!(
                "/api/v1/internal/agent-rooms/{}",
                urlencoding::encode(&mapping.agent_id)
            ),
            mapping,
        )
        .await
    }

    pub async fn delete_agent_mapping(&self, agent_id: &str) -> Result<()> {
        self.delete(&format!(
            "/api/v1/internal/agent-rooms/{}",
            urlencoding::encode(agent_id)
        ))
        .await
    }

    pub async fn list_agent_mappings(&self) -> Result<Vec<AgentRoomMapping>> {
        Ok(self
            .get_json("/api/v1/internal/agent-rooms")
            .await?
            .unwrap_or_default())
    }

    // --- Space ---

    pub async fn get_space_config(&self) -> Result<Option<SpaceConfig>> {
        self.get_json("/api/v1/internal/space-config").await
    }

    pub async fn put_space_config(&self, config: &SpaceConfig) -> Result<()> {
        self.put_json("/api/v1/internal/space-config", config).await
    }

    // --- Sync state ---

    pub async fn get_sync_state(&self, identity_id: &str) -> Result<SyncState> {
        Ok(self
            .get_json(&format!(
                "/api/v1/internal/sync-state/{}",
                urlencoding::encode(identity_id)
            ))
            .await?
            .unwrap_or_default())
    }

    pub async fn put_sync_state(&self, identity_id: &str, state: &SyncState) -> Result<()> {
        self.put_json(
            &format!(
                "/api/v1/internal/sync-state/{}",
                urlencoding::encode(identity_id)
            ),
            state,
        )
        .await
    }
}
