use crate::common::test_client;
use rocket::http::Status;

// --- Health ---

#[test]
fn test_health() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "matrix-agent-bridge");
    assert_eq!(body["sessions"], 0);
    assert!(!body["timestamp"].as_str().unwrap().is_empty());
}

// --- Stats ---

#[test]
fn test_stats_empty() {
    let client = test_client();
    let res = client.get("/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["identities"], 0);
    assert_eq!(body["agent_rooms"], 0);
    assert_eq!(body["clients"], 0);
    assert_eq!(body["active_conversations"], 0);
}

#[test]
fn test_stats_sees_seeded_mappings() {
    let client = crate::common::test_client_with(|_| {});
    crate::common::seed_agent_mapping(client.data_dir(), "agent-stats", "!room:bridge.test");
    let res = client.get("/stats").dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agent_rooms"], 1);
}

// --- 404 ---

#[test]
fn test_unknown_route_is_json_404() {
    let client = test_client();
    let res = client.get("/definitely/not/a/route").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "Not found");
}
