use crate::common::{
    TEST_WEBHOOK_SECRET, seed_agent_mapping, sign_payload, start_conversation, test_client,
    test_client_with,
};
use rocket::http::{ContentType, Header, Status};

fn completion_payload(agent_id: &str) -> String {
    serde_json::json!({
        "event_type": "agent.run.completed",
        "agent_id": agent_id,
        "data": {
            "run_id": "run-2",
            "messages": [{
                "message_type": "assistant_message",
                "content": "done",
                "date": "2025-06-01T12:00:05Z",
                "run_id": "run-2"
            }]
        }
    })
    .to_string()
}

// --- Signature policy ---

#[test]
fn test_missing_signature_is_rejected() {
    let client = test_client();
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(completion_payload("agent-1"))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_bad_signature_is_rejected() {
    let client = test_client();
    let body = completion_payload("agent-1");
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .header(Header::new(
            "X-Letta-Signature",
            sign_payload("wrong-secret", "1700000000", &body),
        ))
        .body(body)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn test_valid_signature_is_accepted() {
    let client = test_client();
    let body = completion_payload("agent-unmapped");
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .header(Header::new(
            "X-Letta-Signature",
            sign_payload(TEST_WEBHOOK_SECRET, "1700000000", &body),
        ))
        .body(body)
        .dispatch();
    // Accepted past the signature gate; dropped later for lack of a room.
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "no_route");
}

#[test]
fn test_dev_skip_bypasses_signature() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(completion_payload("agent-unmapped"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

// --- Payload policy ---

#[test]
fn test_malformed_payload_is_400() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body("{not json")
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_unsupported_event_type_is_dropped() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(r#"{"event_type": "agent.run.started", "agent_id": "agent-1", "data": {}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "unsupported_event_type");
}

#[test]
fn test_no_assistant_content() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(
            r#"{"event_type": "agent.run.completed", "agent_id": "agent-1",
                "data": {"run_id": "run-2", "messages": [
                    {"message_type": "tool_call_message", "content": "irrelevant"}
                ]}}"#,
        )
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "no_assistant_content");
}

#[test]
fn test_relay_content_is_dropped() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(
            r#"{"event_type": "agent.run.completed", "agent_id": "agent-1",
                "data": {"messages": [{
                    "message_type": "assistant_message",
                    "content": "[INTER-AGENT MESSAGE from agent-2] psst"
                }]}}"#,
        )
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "inter_agent_relay");
}

// --- Routing ---

#[test]
fn test_unmapped_agent_is_no_route() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(completion_payload("agent-unknown"))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "no_route");
}

#[test]
fn test_mapped_agent_without_crossrun_conversation() {
    let client = test_client_with(|config| config.webhook_skip_verification = true);
    seed_agent_mapping(client.data_dir(), "agent-7", "!room:bridge.test");

    // A conversation exists but no tools were attached, and auditing is
    // off: the response is dropped without any Matrix send.
    start_conversation(&client, "$e1:bridge.test", "!room:bridge.test", "agent-7");

    let res = client
        .post("/webhooks/letta/agent-response")
        .header(ContentType::JSON)
        .body(completion_payload("agent-7"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "no_crossrun_conversation");
}
