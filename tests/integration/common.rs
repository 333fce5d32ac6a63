use hmac::{Hmac, Mac};
use rocket::local::blocking::Client;
use sha2::Sha256;

use matrix_agent_bridge::config::BridgeConfig;
use matrix_agent_bridge::rocket_with_config;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test";

/// Wrapper around Client that auto-deletes the temp storage dir on drop.
pub struct TestClient {
    client: Option<Client>,
    data_dir: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl TestClient {
    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }
}

pub fn base_config(data_dir: &str) -> BridgeConfig {
    BridgeConfig {
        server_name: "bridge.test".to_string(),
        password_secret: "test-password-secret".to_string(),
        registration_token: "test-registration-token".to_string(),
        data_dir: data_dir.to_string(),
        webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        // Keep stray background monitors short-lived under test.
        monitor_max_wait_sec: 2,
        monitor_poll_interval_sec: 1,
        ..Default::default()
    }
}

pub fn test_client() -> TestClient {
    test_client_with(|_| {})
}

/// Build a client over a unique temp storage dir, with config tweaks.
pub fn test_client_with(tweak: impl FnOnce(&mut BridgeConfig)) -> TestClient {
    let data_dir = format!(
        "/tmp/bridge_test_{}",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    );
    let mut config = base_config(&data_dir);
    tweak(&mut config);
    let client = Client::tracked(rocket_with_config(config)).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        data_dir,
    }
}

/// Seed an agent-room mapping directly in the on-disk document format, the
/// way a previous bridge run would have left it.
pub fn seed_agent_mapping(data_dir: &str, agent_id: &str, room_id: &str) {
    std::fs::create_dir_all(data_dir).unwrap();
    let doc = serde_json::json!({
        agent_id: {
            "agent_id": agent_id,
            "agent_name": "Test Agent",
            "matrix_user_id": format!("@agent_{}:bridge.test", agent_id.replace('-', "_")),
            "matrix_password": "MCP_0123456789abcdef01234567",
            "room_id": room_id,
            "created": "2025-01-01T00:00:00Z",
            "room_created": "2025-01-01T00:00:00Z",
            "invitation_status": {}
        }
    });
    std::fs::write(
        format!("{data_dir}/agent_user_mappings.json"),
        serde_json::to_string_pretty(&doc).unwrap(),
    )
    .unwrap();
}

/// Produce a valid `X-Letta-Signature` header for a payload.
pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Start a tracked conversation through the HTTP surface.
pub fn start_conversation(client: &Client, event_id: &str, room_id: &str, agent_id: &str) {
    let body = serde_json::json!({
        "matrix_event_id": event_id,
        "matrix_room_id": room_id,
        "agent_id": agent_id,
        "original_query": "hello"
    });
    let res = client
        .post("/conversations/start")
        .header(rocket::http::ContentType::JSON)
        .body(body.to_string())
        .dispatch();
    assert_eq!(res.status(), rocket::http::Status::Ok);
}
