use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};
use crate::models::{AgentRoomMapping, DmRoomMapping, Identity, SpaceConfig, SyncState};

/// Local-file back-end: JSON documents rewritten atomically on every
/// mutation. One mutex per document family serialises writers.
pub struct FileStore {
    root: PathBuf,
    identities_lock: Mutex<()>,
    dm_lock: Mutex<()>,
    agents_lock: Mutex<()>,
    space_lock: Mutex<()>,
    metadata_lock: Mutex<()>,
    sync_lock: Mutex<()>,
}

fn read_doc<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| BridgeError::StorageCorrupt(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(BridgeError::StorageUnavailable(format!(
            "{}: {e}",
            path.display()
        ))),
    }
}

/// Write temp file in the same directory, then rename over the target.
fn write_doc<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(doc)
        .map_err(|e| BridgeError::StorageCorrupt(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| BridgeError::StorageUnavailable(format!("{}: {e}", path.display())))
}

impl FileStore {
    pub fn open(data_dir: &str) -> Result<Self> {
        let root = PathBuf::from(data_dir);
        std::fs::create_dir_all(root.join("clients"))
            .map_err(|e| BridgeError::StorageUnavailable(format!("{data_dir}: {e}")))?;
        Ok(FileStore {
            root,
            identities_lock: Mutex::new(()),
            dm_lock: Mutex::new(()),
            agents_lock: Mutex::new(()),
            space_lock: Mutex::new(()),
            metadata_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
        })
    }

    fn identities_path(&self) -> PathBuf {
        self.root.join("identities.json")
    }

    fn dm_path(&self) -> PathBuf {
        self.root.join("dm_rooms.json")
    }

    fn agents_path(&self) -> PathBuf {
        self.root.join("agent_user_mappings.json")
    }

    fn space_path(&self) -> PathBuf {
        self.root.join("space_config.json")
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    fn sync_path(&self, identity_id: &str) -> PathBuf {
        // Identity ids are `<kind>_<key>` with keys already restricted to
        // filename-safe characters; '/' is defended against anyway.
        let safe: String = identity_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join("clients").join(format!("{safe}.json"))
    }

    // --- Identities ---

    pub async fn get_identity(&self, id: &str) -> Result<Option<Identity>> {
        let _guard = self.identities_lock.lock().await;
        let doc: HashMap<String, Identity> = read_doc(&self.identities_path())?;
        Ok(doc.get(id).cloned())
    }

    pub async fn get_identity_by_mxid(&self, mxid: &str) -> Result<Option<Identity>> {
        let _guard = self.identities_lock.lock().await;
        let doc: HashMap<String, Identity> = read_doc(&self.identities_path())?;
        Ok(doc.values().find(|i| i.mxid == mxid).cloned())
    }

    pub async fn put_identity(&self, identity: &Identity) -> Result<()> {
        let _guard = self.identities_lock.lock().await;
        let mut doc: HashMap<String, Identity> = read_doc(&self.identities_path())?;
        let previous_password = doc
            .get(&identity.id)
            .map(|old| old.password.clone())
            .filter(|old| !old.is_empty() && *old != identity.password);
        doc.insert(identity.id.clone(), identity.clone());
        write_doc(&self.identities_path(), &doc)?;
        drop(_guard);

        // Passwords that worked once may be the only way back in; keep them.
        if let Some(old_password) = previous_password {
            self.record_password(&identity.mxid, &old_password).await?;
        }
        Ok(())
    }

    pub async fn delete_identity(&self, id: &str) -> Result<()> {
        let _guard = self.identities_lock.lock().await;
        let mut doc: HashMap<String, Identity> = read_doc(&self.identities_path())?;
        doc.remove(id);
        write_doc(&self.identities_path(), &doc)
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        let _guard = self.identities_lock.lock().await;
        let doc: HashMap<String, Identity> = read_doc(&self.identities_path())?;
        Ok(doc.into_values().collect())
    }

    async fn record_password(&self, mxid: &str, password: &str) -> Result<()> {
        let _guard = self.metadata_lock.lock().await;
        let mut doc: HashMap<String, Value> = read_doc(&self.metadata_path())?;
        let history = doc
            .entry("password_history".to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(map) = history.as_object_mut() {
            let entry = map
                .entry(mxid.to_string())
                .or_insert_with(|| Value::Array(vec![]));
            if let Some(list) = entry.as_array_mut()
                && !list.iter().any(|v| v == password)
            {
                list.insert(0, Value::String(password.to_string()));
            }
        }
        write_doc(&self.metadata_path(), &doc)
    }

    pub async fn historical_passwords(&self, mxid: &str) -> Result<Vec<String>> {
        let _guard = self.metadata_lock.lock().await;
        let doc: HashMap<String, Value> = read_doc(&self.metadata_path())?;
        let passwords = doc
            .get("password_history")
            .and_then(|h| h.get(mxid))
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(passwords)
    }

    // --- DM rooms ---

    pub async fn get_dm(&self, key: &str) -> Result<Option<DmRoomMapping>> {
        let _guard = self.dm_lock.lock().await;
        let doc: HashMap<String, DmRoomMapping> = read_doc(&self.dm_path())?;
        Ok(doc.get(key).cloned())
    }

    pub async fn put_dm(&self, key: &str, mapping: &DmRoomMapping) -> Result<()> {
        let _guard = self.dm_lock.lock().await;
        let mut doc: HashMap<String, DmRoomMapping> = read_doc(&self.dm_path())?;
        doc.insert(key.to_string(), mapping.clone());
        write_doc(&self.dm_path(), &doc)
    }

    // --- Agent rooms ---

    pub async fn get_agent_mapping(&self, agent_id: &str) -> Result<Option<AgentRoomMapping>> {
        let _guard = self.agents_lock.lock().await;
        let doc: HashMap<String, AgentRoomMapping> = read_doc(&self.agents_path())?;
        Ok(doc.get(agent_id).cloned())
    }

    pub async fn put_agent_mapping(&self, mapping: &AgentRoomMapping) -> Result<()> {
        let _guard = self.agents_lock.lock().await;
        let mut doc: HashMap<String, AgentRoomMapping> = read_doc(&self.agents_path())?;
        doc.insert(mapping.agent_id.clone(), mapping.clone());
        write_doc(&self.agents_path(), &doc)
    }

    pub async fn delete_agent_mapping(&self, agent_id: &str) -> Result<()> {
        let _guard = self.agents_lock.lock().await;
        let mut doc: HashMap<String, AgentRoomMapping> = read_doc(&self.agents_path())?;
        doc.remove(agent_id);
        write_doc(&self.agents_path(), &doc)
    }

    pub async fn list_agent_mappings(&self) -> Result<Vec<AgentRoomMapping>> {
        let _guard = self.agents_lock.lock().await;
        let doc: HashMap<String, AgentRoomMapping> = read_doc(&self.agents_path())?;
        Ok(doc.into_values().collect())
    }

    // --- Space ---

    pub async fn get_space_config(&self) -> Result<Option<SpaceConfig>> {
        let _guard = self.space_lock.lock().await;
        let doc: Option<SpaceConfig> = read_doc(&self.space_path())?;
        Ok(doc)
    }

    pub async fn put_space_config(&self, config: &SpaceConfig) -> Result<()> {
        let _guard = self.space_lock.lock().await;
        write_doc(&self.space_path(), &Some(config.clone()))
    }

    /// Wait out in-flight writers on every document family. Mutations
    /// write through atomically, so once each lock has been free nothing
    /// remains pending on disk.
    pub async fn flush(&self) {
        drop(self.identities_lock.lock().await);
        drop(self.dm_lock.lock().await);
        drop(self.agents_lock.lock().await);
        drop(self.space_lock.lock().await);
        drop(self.metadata_lock.lock().await);
        drop(self.sync_lock.lock().await);
    }

    // --- Sync state ---

    pub async fn get_sync_state(&self, identity_id: &str) -> Result<SyncState> {
        let _guard = self.sync_lock.lock().await;
        read_doc(&self.sync_path(identity_id))
    }

    pub async fn put_sync_state(&self, identity_id: &str, state: &SyncState) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        write_doc(&self.sync_path(identity_id), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityKind;

    fn temp_store() -> FileStore {
        let dir = format!(
            "/tmp/bridge_store_test_{}",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        FileStore::open(&dir).expect("open store")
    }

    fn sample_identity(id: &str, mxid: &str) -> Identity {
        Identity {
            id: id.to_string(),
            mxid: mxid.to_string(),
            display_name: "Test".to_string(),
            avatar_url: None,
            access_token: "tok".to_string(),
            password: "MCP_aaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            kind: IdentityKind::Letta,
            created_at: chrono::Utc::now().to_rfc3339(),
            last_used_at: chrono::Utc::now().to_rfc3339(),
            deactivated: false,
        }
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let store = temp_store();
        let identity = sample_identity("letta_agent-1", "@agent_1:hs");
        store.put_identity(&identity).await.unwrap();

        let loaded = store.get_identity("letta_agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.mxid, "@agent_1:hs");
        let by_mxid = store
            .get_identity_by_mxid("@agent_1:hs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_mxid.id, "letta_agent-1");

        store.delete_identity("letta_agent-1").await.unwrap();
        assert!(store.get_identity("letta_agent-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_documents_read_as_empty() {
        let store = temp_store();
        assert!(store.get_identity("nope").await.unwrap().is_none());
        assert!(store.list_agent_mappings().await.unwrap().is_empty());
        assert!(store.get_space_config().await.unwrap().is_none());
        let sync = store.get_sync_state("letta_agent-1").await.unwrap();
        assert!(sync.next_batch.is_none());
    }

    #[tokio::test]
    async fn password_change_records_history() {
        let store = temp_store();
        let mut identity = sample_identity("letta_agent-2", "@agent_2:hs");
        store.put_identity(&identity).await.unwrap();

        identity.password = "MCP_bbbbbbbbbbbbbbbbbbbbbbbb".to_string();
        store.put_identity(&identity).await.unwrap();

        let history = store.historical_passwords("@agent_2:hs").await.unwrap();
        assert_eq!(history, vec!["MCP_aaaaaaaaaaaaaaaaaaaaaaaa".to_string()]);
    }

    #[tokio::test]
    async fn rewrite_leaves_no_temp_file() {
        let store = temp_store();
        store
            .put_identity(&sample_identity("letta_agent-3", "@agent_3:hs"))
            .await
            .unwrap();
        assert!(store.identities_path().exists());
        assert!(!store.identities_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn sync_state_round_trip() {
        let store = temp_store();
        let state = SyncState {
            next_batch: Some("s99".to_string()),
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        store.put_sync_state("letta_agent-4", &state).await.unwrap();
        let loaded = store.get_sync_state("letta_agent-4").await.unwrap();
        assert_eq!(loaded.next_batch.as_deref(), Some("s99"));
    }

    #[tokio::test]
    async fn flush_completes_after_writes() {
        let store = temp_store();
        store
            .put_identity(&sample_identity("letta_agent-5", "@agent_5:hs"))
            .await
            .unwrap();
        store.flush().await;
        // The store stays usable after a flush.
        assert!(store.get_identity("letta_agent-5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupt_document_is_fatal() {
        let store = temp_store();
        std::fs::write(store.identities_path(), "{not json").unwrap();
        let err = store.get_identity("x").await.unwrap_err();
        assert!(matches!(err, BridgeError::StorageCorrupt(_)));
    }
}
