use crate::common::{start_conversation, test_client};
use rocket::http::{ContentType, Status};

// --- /conversations/start ---

#[test]
fn test_start_conversation() {
    let client = test_client();
    let res = client
        .post("/conversations/start")
        .header(ContentType::JSON)
        .body(
            r#"{"matrix_event_id": "$e1:bridge.test",
                "matrix_room_id": "!room:bridge.test",
                "agent_id": "agent-1",
                "original_query": "what is up"}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["conversation_id"], "$e1:bridge.test");
    assert_eq!(body["agent_id"], "agent-1");
    assert_eq!(body["tracking"], true);
}

#[test]
fn test_start_conversation_requires_ids() {
    let client = test_client();
    let res = client
        .post("/conversations/start")
        .header(ContentType::JSON)
        .body(r#"{"matrix_event_id": "", "matrix_room_id": "!r:hs", "agent_id": "agent-1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

// --- GET /conversations ---

#[test]
fn test_list_active_conversations() {
    let client = test_client();
    start_conversation(&client, "$e1:bridge.test", "!room:bridge.test", "agent-1");
    start_conversation(&client, "$e2:bridge.test", "!room:bridge.test", "agent-2");

    let res = client.get("/conversations").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["count"], 2);
    let statuses: Vec<&str> = body["conversations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["status"].as_str().unwrap())
        .collect();
    assert!(statuses.iter().all(|s| *s == "pending"));
}

#[test]
fn test_latest_conversation_replaces_earlier_for_same_agent() {
    let client = test_client();
    start_conversation(&client, "$e1:bridge.test", "!room:bridge.test", "agent-1");
    start_conversation(&client, "$e2:bridge.test", "!room:bridge.test", "agent-1");

    // Both records exist, but only the latest is routable; the
    // tool-selector surface confirms which one routes.
    let res = client
        .post("/webhook/tool-selector")
        .header(ContentType::JSON)
        .body(r#"{"event": "run_triggered", "agent_id": "agent-1", "tools_attached": []}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["conversation_id"], "$e2:bridge.test");
}

// --- /conversations/response ---

#[test]
fn test_response_without_active_conversation() {
    let client = test_client();
    let res = client
        .post("/conversations/response")
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "agent-9", "response": "done"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "no_active_conversation");
}

#[test]
fn test_response_rejects_empty_text() {
    let client = test_client();
    let res = client
        .post("/conversations/response")
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "agent-1", "response": "   "}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
