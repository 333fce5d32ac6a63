use crate::common::{start_conversation, test_client, test_client_with};
use rocket::http::{ContentType, Status};

#[test]
fn test_no_active_conversation() {
    let client = test_client();
    let res = client
        .post("/webhook/tool-selector")
        .header(ContentType::JSON)
        .body(
            r#"{"event": "run_triggered", "agent_id": "agent-none",
                "trigger_type": "tool_attachment", "tools_attached": ["search"]}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "no_active_conversation");
}

#[test]
fn test_unsupported_event() {
    let client = test_client();
    let res = client
        .post("/webhook/tool-selector")
        .header(ContentType::JSON)
        .body(r#"{"event": "something_else", "agent_id": "agent-1"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "unsupported_event");
}

#[test]
fn test_tracking_starts_monitor() {
    let client = test_client();
    start_conversation(&client, "$e1:bridge.test", "!room:bridge.test", "agent-1");

    let res = client
        .post("/webhook/tool-selector")
        .header(ContentType::JSON)
        .body(
            r#"{"event": "run_triggered", "agent_id": "agent-1",
                "new_run_id": "run-2", "trigger_type": "tool_attachment",
                "tools_attached": ["search", "browse"]}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "tracking");
    assert_eq!(body["tracking"], true);
    assert_eq!(body["monitoring"], true);
    assert_eq!(body["conversation_id"], "$e1:bridge.test");
    assert_eq!(body["tools_attached"][0], "search");
}

#[test]
fn test_monitor_soft_cap_returns_busy() {
    let client = test_client_with(|config| config.monitor_max_concurrent = 1);
    start_conversation(&client, "$e1:bridge.test", "!room:bridge.test", "agent-1");
    start_conversation(&client, "$e2:bridge.test", "!room:bridge.test", "agent-2");

    let first = client
        .post("/webhook/tool-selector")
        .header(ContentType::JSON)
        .body(r#"{"event": "run_triggered", "agent_id": "agent-1", "tools_attached": ["a"]}"#)
        .dispatch();
    let body: serde_json::Value = first.into_json().unwrap();
    assert_eq!(body["status"], "tracking");

    let second = client
        .post("/webhook/tool-selector")
        .header(ContentType::JSON)
        .body(r#"{"event": "run_triggered", "agent_id": "agent-2", "tools_attached": ["b"]}"#)
        .dispatch();
    let body: serde_json::Value = second.into_json().unwrap();
    assert_eq!(body["status"], "busy");
    assert_eq!(body["monitoring"], false);
    // The run is still tracked for the next cycle.
    assert_eq!(body["tracking"], true);
}
