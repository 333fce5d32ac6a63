// Persistence facade — two interchangeable back-ends behind one surface.
// File mode owns JSON documents on local disk; API mode talks to the
// internal storage service. Selection is configuration-driven.

mod api;
mod file;

pub use api::ApiStore;
pub use file::FileStore;

use crate::config::{BridgeConfig, StorageMode};
use crate::error::Result;
use crate::models::{AgentRoomMapping, DmRoomMapping, Identity, SpaceConfig, SyncState};

/// Symmetric DM-room key: both participants sorted, joined with `|`, so
/// `dm_key(a, b) == dm_key(b, a)`.
pub fn dm_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}|{second}")
}

pub enum Storage {
    File(FileStore),
    Api(ApiStore),
}

impl Storage {
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        match config.storage_mode {
            StorageMode::File => Ok(Storage::File(FileStore::open(&config.data_dir)?)),
            StorageMode::Api => Ok(Storage::Api(ApiStore::new(
                &config.storage_api_url,
                &config.storage_internal_key,
            ))),
        }
    }

    // --- Identities ---

    pub async fn get_identity(&self, id: &str) -> Result<Option<Identity>> {
        match self {
            Storage::File(s) => s.get_identity(id).await,
            Storage::Api(s) => s.get_identity(id).await,
        }
    }

    pub async fn get_identity_by_mxid(&self, mxid: &str) -> Result<Option<Identity>> {
        match self {
            Storage::File(s) => s.get_identity_by_mxid(mxid).await,
            Storage::Api(s) => s.get_identity_by_mxid(mxid).await,
        }
    }

    pub async fn put_identity(&self, identity: &Identity) -> Result<()> {
        match self {
            Storage::File(s) => s.put_identity(identity).await,
            Storage::Api(s) => s.put_identity(identity).await,
        }
    }

    pub async fn delete_identity(&self, id: &str) -> Result<()> {
        match self {
            Storage::File(s) => s.delete_identity(id).await,
            Storage::Api(s) => s.delete_identity(id).await,
        }
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        match self {
            Storage::File(s) => s.list_identities().await,
            Storage::Api(s) => s.list_identities().await,
        }
    }

    /// Every password ever persisted for this MXID, newest first. Feeds the
    /// last rung of the recovery ladder.
    pub async fn historical_passwords(&self, mxid: &str) -> Result<Vec<String>> {
        match self {
            Storage::File(s) => s.historical_passwords(mxid).await,
            Storage::Api(s) => s.historical_passwords(mxid).await,
        }
    }

    // --- DM rooms ---

    pub async fn get_dm(&self, key: &str) -> Result<Option<DmRoomMapping>> {
        match self {
            Storage::File(s) => s.get_dm(key).await,
            Storage::Api(s) => s.get_dm(key).await,
        }
    }

    pub async fn put_dm(&self, key: &str, mapping: &DmRoomMapping) -> Result<()> {
        match self {
            Storage::File(s) => s.put_dm(key, mapping).await,
            Storage::Api(s) => s.put_dm(key, mapping).await,
        }
    }

    // --- Agent rooms ---

    pub async fn get_agent_mapping(&self, agent_id: &str) -> Result<Option<AgentRoomMapping>> {
        match self {
            Storage::File(s) => s.get_agent_mapping(agent_id).await,
            Storage::Api(s) => s.get_agent_mapping(agent_id).await,
        }
    }

    pub async fn put_agent_mapping(&self, mapping: &AgentRoomMapping) -> Result<()> {
        match self {
            Storage::File(s) => s.put_agent_mapping(mapping).await,
            Storage::Api(s) => s.put_agent_mapping(mapping).await,
        }
    }

    pub async fn delete_agent_mapping(&self, agent_id: &str) -> Result<()> {
        match self {
            Storage::File(s) => s.delete_agent_mapping(agent_id).await,
            Storage::Api(s) => s.delete_agent_mapping(agent_id).await,
        }
    }

    pub async fn list_agent_mappings(&self) -> Result<Vec<AgentRoomMapping>> {
        match self {
            Storage::File(s) => s.list_agent_mappings().await,
            Storage::Api(s) => s.list_agent_mappings().await,
        }
    }

    // --- Space ---

    pub async fn get_space_config(&self) -> Result<Option<SpaceConfig>> {
        match self {
            Storage::File(s) => s.get_space_config().await,
            Storage::Api(s) => s.get_space_config().await,
        }
    }

    pub async fn put_space_config(&self, config: &SpaceConfig) -> Result<()> {
        match self {
            Storage::File(s) => s.put_space_config(config).await,
            Storage::Api(s) => s.put_space_config(config).await,
        }
    }

    /// Quiesce the back-end before exit: no document rewrite may be left
    /// mid-flight. The API back-end keeps no local state, so only the file
    /// variant has anything to wait for.
    pub async fn flush(&self) {
        if let Storage::File(s) = self {
            s.flush().await;
        }
    }

    // --- Sync state ---

    pub async fn get_sync_state(&self, identity_id: &str) -> Result<SyncState> {
        match self {
            Storage::File(s) => s.get_sync_state(identity_id).await,
            Storage::Api(s) => s.get_sync_state(identity_id).await,
        }
    }

    pub async fn put_sync_state(&self, identity_id: &str, state: &SyncState) -> Result<()> {
        match self {
            Storage::File(s) => s.put_sync_state(identity_id, state).await,
            Storage::Api(s) => s.put_sync_state(identity_id, state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_key_is_symmetric() {
        assert_eq!(
            dm_key("@a:example.com", "@b:example.com"),
            dm_key("@b:example.com", "@a:example.com")
        );
        assert_eq!(
            dm_key("@a:example.com", "@b:example.com"),
            "@a:example.com|@b:example.com"
        );
    }

    #[test]
    fn dm_key_sorts_lexicographically() {
        assert_eq!(dm_key("@zed:hs", "@amy:hs"), "@amy:hs|@zed:hs");
    }
}
