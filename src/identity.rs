use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::matrix::{MatrixClient, errcode};
use crate::models::{Identity, IdentityKind};
use crate::storage::Storage;

type HmacSha256 = Hmac<Sha256>;

/// Derived passwords are `MCP_` plus hex HMAC output, truncated.
const PASSWORD_LEN: usize = 28;

/// Settle time after posting a reset command to the admin room.
const ADMIN_ROOM_RESET_WAIT: Duration = Duration::from_millis(1500);

// --- Derivation ---

/// Lower-case and strip everything outside `[a-z0-9_]`.
pub fn sanitize_localpart(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

/// True for keys shaped like `agent-<uuid>`: the prefix plus hex digits
/// and hyphens only.
fn is_agent_uuid_key(key: &str) -> bool {
    key.strip_prefix("agent-").is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
    })
}

/// Deterministic localpart for an external key. Letta keys of the form
/// `agent-<uuid>` keep the legacy `agent_<uuid>` shape already present on
/// the homeserver; other Letta keys sanitize as-is. Opencode keys are
/// project directories.
pub fn derive_localpart(kind: IdentityKind, external_key: &str) -> Result<String> {
    let localpart = match kind {
        IdentityKind::Letta => {
            if is_agent_uuid_key(external_key) {
                sanitize_localpart(&external_key.replace('-', "_"))
            } else {
                sanitize_localpart(external_key)
            }
        }
        IdentityKind::Opencode => {
            let basename = external_key
                .trim_end_matches(['/', '\\'])
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(external_key);
            format!("oc_{}_v2", sanitize_localpart(basename))
        }
        IdentityKind::Custom => sanitize_localpart(external_key),
    };
    if localpart.is_empty() || localpart.chars().all(|c| c == '_') {
        return Err(BridgeError::InvalidLocalpart(external_key.to_string()));
    }
    Ok(localpart)
}

/// Deterministic password: `MCP_` + hex(HMAC-SHA256(secret, localpart)),
/// truncated to 28 chars. Same inputs always produce the same password, so
/// an account can be re-provisioned losslessly.
pub fn derive_password(localpart: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(localpart.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    let mut password = format!("MCP_{digest}");
    password.truncate(PASSWORD_LEN);
    password
}

// --- Manager ---

/// Guarantees one Matrix account per external key and a working access
/// token for it, recovering through the reset ladder when registration and
/// the derived password both fail.
pub struct IdentityManager {
    storage: Arc<Storage>,
    config: BridgeConfig,
    admin_session: Mutex<Option<MatrixClient>>,
}

impl IdentityManager {
    pub fn new(storage: Arc<Storage>, config: BridgeConfig) -> Self {
        IdentityManager {
            storage,
            config,
            admin_session: Mutex::new(None),
        }
    }

    pub fn identity_id(kind: IdentityKind, external_key: &str) -> String {
        format!("{}_{}", kind.as_str(), external_key)
    }

    fn mxid_for(&self, localpart: &str) -> String {
        format!("@{}:{}", localpart, self.config.server_name)
    }

    /// Return the stored identity, or provision/recover the account.
    pub async fn get_or_create(
        &self,
        kind: IdentityKind,
        external_key: &str,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<Identity> {
        let id = Self::identity_id(kind, external_key);

        // A stored record wins; a stale cache must not clobber the display
        // name the homeserver already has.
        if let Some(existing) = self.storage.get_identity(&id).await? {
            return Ok(existing);
        }

        let localpart = derive_localpart(kind, external_key)?;
        let password = derive_password(&localpart, &self.config.password_secret);
        let mxid = self.mxid_for(&localpart);
        let anon = MatrixClient::anonymous(&self.config.homeserver_url);

        let access_token = match anon
            .register(&localpart, &password, &self.config.registration_token)
            .await
        {
            Ok(login) => login.access_token,
            Err(BridgeError::Homeserver { body, .. })
                if errcode(&body).as_deref() == Some("M_USER_IN_USE")
                    || body.contains("M_USER_IN_USE")
                    || body.contains("already exists") =>
            {
                self.recover_token(&anon, &localpart, &mxid, &password).await?
            }
            Err(e) => return Err(e),
        };

        let now = chrono::Utc::now().to_rfc3339();
        let identity = Identity {
            id: id.clone(),
            mxid: mxid.clone(),
            display_name: display_name.to_string(),
            avatar_url: avatar_url.map(|s| s.to_string()),
            access_token,
            password,
            kind,
            created_at: now.clone(),
            last_used_at: now,
            deactivated: false,
        };

        if !display_name.is_empty() {
            let client =
                MatrixClient::new(&self.config.homeserver_url, &identity.access_token, &mxid);
            if let Err(e) = client.set_display_name(&mxid, display_name).await {
                eprintln!("⚠️ Could not set display name for {mxid}: {e}");
            }
        }

        self.storage.put_identity(&identity).await?;
        println!("👤 Provisioned identity {id} as {mxid}");
        Ok(identity)
    }

    /// The account exists but we hold no token. Try the derived password,
    /// then the reset ladder, then any historical password. First success
    /// wins; exhaustion is `IdentityUnrecoverable`, never a guess.
    async fn recover_token(
        &self,
        anon: &MatrixClient,
        localpart: &str,
        mxid: &str,
        password: &str,
    ) -> Result<String> {
        // Common case: a prior create succeeded but the token was lost.
        if let Ok(login) = anon.login(localpart, password).await {
            return Ok(login.access_token);
        }

        if let Ok(token) = self.reset_via_ladder(anon, localpart, mxid, password).await {
            return Ok(token);
        }

        for old_password in self.storage.historical_passwords(mxid).await? {
            if let Ok(login) = anon.login(localpart, &old_password).await {
                println!("🔑 Recovered {mxid} with a historical password");
                return Ok(login.access_token);
            }
        }

        Err(BridgeError::IdentityUnrecoverable(mxid.to_string()))
    }

    /// Reset ladder: admin command-room first (authoritative on Tuwunel,
    /// needs no admin-API surface), then the Synapse admin endpoints.
    async fn reset_via_ladder(
        &self,
        anon: &MatrixClient,
        localpart: &str,
        mxid: &str,
        password: &str,
    ) -> Result<String> {
        if let Ok(()) = self.reset_via_admin_room(localpart, password).await
            && let Ok(login) = anon.login(localpart, password).await
        {
            println!("🔑 Recovered {mxid} via admin command-room reset");
            return Ok(login.access_token);
        }

        let admin = self.admin_client().await?;
        if admin.admin_reset_password_v1(mxid, password).await.is_ok()
            && let Ok(login) = anon.login(localpart, password).await
        {
            println!("🔑 Recovered {mxid} via admin reset endpoint");
            return Ok(login.access_token);
        }

        admin
            .admin_put_user(mxid, &serde_json::json!({"password": password}))
            .await?;
        let login = anon.login(localpart, password).await?;
        println!("🔑 Recovered {mxid} via admin user PUT");
        Ok(login.access_token)
    }

    /// Post `!admin users reset-password <local> <password>` into the
    /// homeserver's command room and give it a moment to apply. This is the
    /// only `!admin` command the bridge ever issues.
    async fn reset_via_admin_room(&self, localpart: &str, password: &str) -> Result<()> {
        let admin = self.admin_client().await?;
        let alias = self.config.admin_room_alias();
        let resolved = admin.resolve_alias(&alias).await?;
        let room_id = admin.join_room(&resolved.room_id).await?;

        let command = format!("!admin users reset-password {localpart} {password}");
        admin.send_text(&room_id, &command).await?;
        tokio::time::sleep(ADMIN_ROOM_RESET_WAIT).await;
        Ok(())
    }

    /// Re-login an identity after token invalidation, persisting the fresh
    /// token. Used by the client pool's sync loops.
    pub async fn refresh_token(&self, identity_id: &str) -> Result<Identity> {
        let mut identity = self
            .storage
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| BridgeError::IdentityUnrecoverable(identity_id.to_string()))?;

        let localpart = identity
            .mxid
            .strip_prefix('@')
            .and_then(|s| s.split(':').next())
            .ok_or_else(|| BridgeError::InvalidLocalpart(identity.mxid.clone()))?
            .to_string();

        let anon = MatrixClient::anonymous(&self.config.homeserver_url);
        let token = self
            .recover_token(&anon, &localpart, &identity.mxid, &identity.password)
            .await?;

        identity.access_token = token;
        identity.last_used_at = chrono::Utc::now().to_rfc3339();
        self.storage.put_identity(&identity).await?;
        Ok(identity)
    }

    /// Update display name / avatar through the admin API, falling back to
    /// the user's own profile PUTs on homeservers without that surface.
    pub async fn update(
        &self,
        identity_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Identity> {
        let mut identity = self
            .storage
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| BridgeError::IdentityUnrecoverable(identity_id.to_string()))?;

        let mut body = serde_json::Map::new();
        if let Some(name) = display_name {
            body.insert("displayname".into(), name.into());
        }
        if let Some(url) = avatar_url {
            body.insert("avatar_url".into(), url.into());
        }
        if body.is_empty() {
            return Ok(identity);
        }

        let admin = self.admin_client().await?;
        let via_admin = admin
            .admin_put_user(&identity.mxid, &serde_json::Value::Object(body))
            .await;
        match via_admin {
            Ok(()) => {}
            Err(BridgeError::Homeserver { body, .. })
                if errcode(&body).as_deref() == Some("M_UNRECOGNIZED") =>
            {
                let own = MatrixClient::new(
                    &self.config.homeserver_url,
                    &identity.access_token,
                    &identity.mxid,
                );
                if let Some(name) = display_name {
                    own.set_display_name(&identity.mxid, name).await?;
                }
                if let Some(url) = avatar_url {
                    own.set_avatar_url(&identity.mxid, url).await?;
                }
            }
            Err(e) => return Err(e),
        }

        if let Some(name) = display_name {
            identity.display_name = name.to_string();
        }
        if let Some(url) = avatar_url {
            identity.avatar_url = Some(url.to_string());
        }
        identity.last_used_at = chrono::Utc::now().to_rfc3339();
        self.storage.put_identity(&identity).await?;
        Ok(identity)
    }

    /// Deactivate the homeserver account and drop the local record.
    pub async fn delete(&self, identity_id: &str) -> Result<()> {
        let Some(identity) = self.storage.get_identity(identity_id).await? else {
            return Ok(());
        };
        let admin = self.admin_client().await?;
        admin.admin_deactivate(&identity.mxid).await?;
        self.storage.delete_identity(identity_id).await?;
        println!("🗑️ Deactivated {}", identity.mxid);
        Ok(())
    }

    /// Lazily logged-in admin client, cached for the process lifetime.
    async fn admin_client(&self) -> Result<MatrixClient> {
        let mut session = self.admin_session.lock().await;
        if let Some(client) = session.as_ref() {
            return Ok(client.clone());
        }
        if self.config.admin_password.is_empty() {
            return Err(BridgeError::Config(
                "ADMIN_PASSWORD required for recovery operations".into(),
            ));
        }
        let anon = MatrixClient::anonymous(&self.config.homeserver_url);
        let login = anon
            .login(&self.config.admin_username, &self.config.admin_password)
            .await?;
        let client = MatrixClient::new(
            &self.config.homeserver_url,
            &login.access_token,
            &login.user_id,
        );
        *session = Some(client.clone());
        Ok(client)
    }
}
