use std::env;

use crate::error::{BridgeError, Result};

/// Storage back-end selection (`STORAGE_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    File,
    Api,
}

/// Bridge configuration. All values read from environment variables with
/// sensible defaults; only the homeserver coordinates are mandatory.
///
/// Environment variables:
/// - `HOMESERVER_URL` — base URL of the homeserver (default `http://localhost:8008`)
/// - `SERVER_NAME` — Matrix server name used in MXIDs (required)
/// - `ADMIN_USERNAME` / `ADMIN_PASSWORD` — admin account for the command room
/// - `REGISTRATION_TOKEN` — static token for the registration flow
/// - `PASSWORD_SECRET` — keyed-hash secret for deterministic passwords (required)
/// - `STORAGE_MODE` — `file` (default) or `api`
/// - `STORAGE_API_URL` / `STORAGE_INTERNAL_KEY` — API back-end coordinates
/// - `DATA_DIR` — file back-end directory (default `data`)
/// - `SPACE_NAME` — parent space display name (default `Letta Agents`)
/// - `OWNER_MXID` / `BRIDGE_MXID` / `ADMIN_MXID` — invitation policy parties
/// - `WEBHOOK_PORT` / `WEBHOOK_SECRET` / `WEBHOOK_SKIP_VERIFICATION`
/// - `AUDIT_NON_MATRIX` — post m.notice audits for non-Matrix responses
/// - `CONVERSATION_MAX_AGE_SEC` (300), `MONITOR_MAX_WAIT_SEC` (60),
///   `MONITOR_POLL_INTERVAL_SEC` (2), `DEDUP_TTL_SEC` (3600),
///   `CLEANUP_INTERVAL_SEC` (60), `MONITOR_MAX_CONCURRENT` (16)
/// - `AGENT_SERVICE_URL` / `AGENT_SERVICE_TOKEN` / `OUR_WEBHOOK_URL`
/// - `PROXY_PORT` / `PROXY_UPSTREAM_URL` — session-context proxy (0 disables)
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub homeserver_url: String,
    pub server_name: String,
    pub admin_username: String,
    pub admin_password: String,
    pub registration_token: String,
    pub password_secret: String,

    pub storage_mode: StorageMode,
    pub storage_api_url: String,
    pub storage_internal_key: String,
    pub data_dir: String,

    pub space_name: String,
    pub owner_mxid: Option<String>,
    pub bridge_mxid: Option<String>,
    pub admin_mxid: Option<String>,

    pub webhook_port: u16,
    pub webhook_secret: String,
    pub webhook_skip_verification: bool,
    pub audit_non_matrix: bool,

    pub conversation_max_age_sec: u64,
    pub monitor_max_wait_sec: u64,
    pub monitor_poll_interval_sec: u64,
    pub monitor_max_concurrent: usize,
    pub dedup_ttl_sec: u64,
    pub cleanup_interval_sec: u64,

    pub agent_service_url: String,
    pub agent_service_token: String,
    pub our_webhook_url: String,

    pub proxy_port: u16,
    pub proxy_upstream_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homeserver_url: "http://localhost:8008".to_string(),
            server_name: String::new(),
            admin_username: "admin".to_string(),
            admin_password: String::new(),
            registration_token: String::new(),
            password_secret: String::new(),
            storage_mode: StorageMode::File,
            storage_api_url: String::new(),
            storage_internal_key: String::new(),
            data_dir: "data".to_string(),
            space_name: "Letta Agents".to_string(),
            owner_mxid: None,
            bridge_mxid: None,
            admin_mxid: None,
            webhook_port: 8015,
            webhook_secret: String::new(),
            webhook_skip_verification: false,
            audit_non_matrix: false,
            conversation_max_age_sec: 300,
            monitor_max_wait_sec: 60,
            monitor_poll_interval_sec: 2,
            monitor_max_concurrent: 16,
            dedup_ttl_sec: 3600,
            cleanup_interval_sec: 60,
            agent_service_url: "http://localhost:8283".to_string(),
            agent_service_token: String::new(),
            our_webhook_url: String::new(),
            proxy_port: 0,
            proxy_upstream_url: String::new(),
        }
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(val) = env::var(key)
        && !val.trim().is_empty()
    {
        *target = val.trim().to_string();
    }
}

fn env_opt_string(key: &str, target: &mut Option<String>) {
    if let Ok(val) = env::var(key)
        && !val.trim().is_empty()
    {
        *target = Some(val.trim().to_string());
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(val) = env::var(key) {
        *target = matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes");
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(val) = env::var(key)
        && let Ok(n) = val.trim().parse::<u64>()
    {
        *target = n;
    }
}

fn env_u16(key: &str, target: &mut u16) {
    if let Ok(val) = env::var(key)
        && let Ok(n) = val.trim().parse::<u16>()
    {
        *target = n;
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_string("HOMESERVER_URL", &mut config.homeserver_url);
        env_string("SERVER_NAME", &mut config.server_name);
        env_string("ADMIN_USERNAME", &mut config.admin_username);
        env_string("ADMIN_PASSWORD", &mut config.admin_password);
        env_string("REGISTRATION_TOKEN", &mut config.registration_token);
        env_string("PASSWORD_SECRET", &mut config.password_secret);

        if let Ok(val) = env::var("STORAGE_MODE") {
            config.storage_mode = match val.trim().to_lowercase().as_str() {
                "api" => StorageMode::Api,
                _ => StorageMode::File,
            };
        }
        env_string("STORAGE_API_URL", &mut config.storage_api_url);
        env_string("STORAGE_INTERNAL_KEY", &mut config.storage_internal_key);
        env_string("DATA_DIR", &mut config.data_dir);

        env_string("SPACE_NAME", &mut config.space_name);
        env_opt_string("OWNER_MXID", &mut config.owner_mxid);
        env_opt_string("BRIDGE_MXID", &mut config.bridge_mxid);
        env_opt_string("ADMIN_MXID", &mut config.admin_mxid);

        env_u16("WEBHOOK_PORT", &mut config.webhook_port);
        env_string("WEBHOOK_SECRET", &mut config.webhook_secret);
        env_bool(
            "WEBHOOK_SKIP_VERIFICATION",
            &mut config.webhook_skip_verification,
        );
        env_bool("AUDIT_NON_MATRIX", &mut config.audit_non_matrix);

        env_u64(
            "CONVERSATION_MAX_AGE_SEC",
            &mut config.conversation_max_age_sec,
        );
        env_u64("MONITOR_MAX_WAIT_SEC", &mut config.monitor_max_wait_sec);
        env_u64(
            "MONITOR_POLL_INTERVAL_SEC",
            &mut config.monitor_poll_interval_sec,
        );
        if let Ok(val) = env::var("MONITOR_MAX_CONCURRENT")
            && let Ok(n) = val.trim().parse::<usize>()
        {
            config.monitor_max_concurrent = n;
        }
        env_u64("DEDUP_TTL_SEC", &mut config.dedup_ttl_sec);
        env_u64("CLEANUP_INTERVAL_SEC", &mut config.cleanup_interval_sec);

        env_string("AGENT_SERVICE_URL", &mut config.agent_service_url);
        env_string("AGENT_SERVICE_TOKEN", &mut config.agent_service_token);
        env_string("OUR_WEBHOOK_URL", &mut config.our_webhook_url);

        env_u16("PROXY_PORT", &mut config.proxy_port);
        env_string("PROXY_UPSTREAM_URL", &mut config.proxy_upstream_url);

        config.homeserver_url = config.homeserver_url.trim_end_matches('/').to_string();
        config.agent_service_url = config.agent_service_url.trim_end_matches('/').to_string();

        config
    }

    /// Reject fatally incomplete configuration before any service starts.
    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(BridgeError::Config("SERVER_NAME is required".into()));
        }
        if self.password_secret.trim().is_empty() {
            return Err(BridgeError::Config("PASSWORD_SECRET is required".into()));
        }
        if self.registration_token.trim().is_empty() && self.admin_password.trim().is_empty() {
            return Err(BridgeError::Config(
                "either REGISTRATION_TOKEN or ADMIN_PASSWORD must be set".into(),
            ));
        }
        if self.storage_mode == StorageMode::Api && self.storage_api_url.trim().is_empty() {
            return Err(BridgeError::Config(
                "STORAGE_API_URL is required when STORAGE_MODE=api".into(),
            ));
        }
        if self.proxy_port != 0 && self.proxy_upstream_url.trim().is_empty() {
            return Err(BridgeError::Config(
                "PROXY_UPSTREAM_URL is required when PROXY_PORT is set".into(),
            ));
        }
        Ok(())
    }

    /// The full admin MXID, derived from the admin username.
    pub fn admin_user_id(&self) -> String {
        format!("@{}:{}", self.admin_username, self.server_name)
    }

    /// Alias of the homeserver's command room.
    pub fn admin_room_alias(&self) -> String {
        format!("#admins:{}", self.server_name)
    }
}
