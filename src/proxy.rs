use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rocket::data::ToByteUnit;
use rocket::http::{ContentType, Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder, Response};
use rocket::{Data, State, get, post};
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::conversations::ConversationTracker;

/// Argument key injected into JSON-RPC tool calls so handlers can recover
/// the acting agent without ambient request context.
const INJECTED_AGENT_KEY: &str = "__injected_agent_id";

const MAX_PROXY_BODY: u64 = 10;

// --- Request guards ---

pub struct AgentIdHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AgentIdHeader {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(AgentIdHeader(
            req.headers().get_one("X-Agent-Id").map(|s| s.to_string()),
        ))
    }
}

pub struct SessionIdHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SessionIdHeader {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(SessionIdHeader(
            req.headers()
                .get_one("Mcp-Session-Id")
                .map(|s| s.to_string()),
        ))
    }
}

pub struct AuthHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthHeader {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(AuthHeader(
            req.headers().get_one("Authorization").map(|s| s.to_string()),
        ))
    }
}

pub struct RawQuery(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RawQuery {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(RawQuery(req.uri().query().map(|q| q.to_string())))
    }
}

// --- Forwarded response ---

/// Upstream response relayed back, with the session header preserved so
/// clients can bind newly created sessions.
pub struct ProxyResponse {
    status: Status,
    content_type: ContentType,
    session_id: Option<String>,
    body: Vec<u8>,
}

impl<'r> Responder<'r, 'static> for ProxyResponse {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let mut builder = Response::build();
        builder
            .status(self.status)
            .header(self.content_type)
            .sized_body(self.body.len(), std::io::Cursor::new(self.body));
        if let Some(session_id) = self.session_id {
            builder.header(Header::new("Mcp-Session-Id", session_id));
        }
        Ok(builder.finalize())
    }
}

// --- State ---

pub struct ProxyState {
    http: reqwest::Client,
    upstream_url: String,
    tracker: Arc<ConversationTracker>,
}

impl ProxyState {
    pub fn new(upstream_url: &str, tracker: Arc<ConversationTracker>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3600))
            .build()
            .expect("Failed to create proxy HTTP client");
        ProxyState {
            http,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            tracker,
        }
    }

    fn upstream(&self, path: &PathBuf, query: &Option<String>) -> String {
        let mut url = format!("{}/{}", self.upstream_url, path.display());
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Record what we know about the acting agent before forwarding.
    fn capture_session(&self, agent_id: &Option<String>, session_id: &Option<String>) {
        if let (Some(agent_id), Some(session_id)) = (agent_id, session_id) {
            self.tracker.bind_session(session_id, agent_id);
        }
    }

    /// Resolve the acting agent: explicit header first, session map second.
    fn resolve_agent(&self, agent_id: &Option<String>, session_id: &Option<String>) -> Option<String> {
        if let Some(agent_id) = agent_id {
            return Some(agent_id.clone());
        }
        session_id
            .as_ref()
            .and_then(|s| self.tracker.agent_for_session(s))
    }

    async fn forward(
        &self,
        method: reqwest::Method,
        url: &str,
        content_type: Option<&ContentType>,
        auth: &Option<String>,
        session_id: &Option<String>,
        agent_id: &Option<String>,
        body: Option<Vec<u8>>,
    ) -> ProxyResponse {
        let mut request = self.http.request(method, url);
        if let Some(ct) = content_type {
            request = request.header("Content-Type", ct.to_string());
        }
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        if let Some(session_id) = session_id {
            request = request.header("Mcp-Session-Id", session_id);
        }
        if let Some(agent_id) = agent_id {
            request = request.header("X-Agent-Id", agent_id);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        match request.send().await {
            Ok(resp) => {
                let status = Status::new(resp.status().as_u16());
                let content_type = resp
                    .headers()
                    .get("Content-Type")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<ContentType>().ok())
                    .unwrap_or(ContentType::JSON);
                let response_session = resp
                    .headers()
                    .get("Mcp-Session-Id")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                // A fresh session minted by the handler belongs to the
                // agent that opened it.
                if let (Some(new_session), Some(agent)) =
                    (response_session.as_ref(), agent_id.as_ref())
                {
                    self.tracker.bind_session(new_session, agent);
                }

                let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                ProxyResponse {
                    status,
                    content_type,
                    session_id: response_session,
                    body,
                }
            }
            Err(e) => {
                eprintln!("⚠️ Proxy upstream error: {e}");
                ProxyResponse {
                    status: Status::BadGateway,
                    content_type: ContentType::JSON,
                    session_id: None,
                    body: serde_json::to_vec(
                        &serde_json::json!({"error": format!("upstream unreachable: {e}")}),
                    )
                    .unwrap_or_default(),
                }
            }
        }
    }
}

/// Append the acting agent to a JSON-RPC `tools/call` body. Other bodies
/// pass through untouched. Content-Length is recomputed implicitly by the
/// forwarding client.
pub fn inject_agent_id(raw: &[u8], agent_id: &str) -> Vec<u8> {
    let Ok(mut body) = serde_json::from_slice::<Value>(raw) else {
        return raw.to_vec();
    };
    if body["method"].as_str() != Some("tools/call") {
        return raw.to_vec();
    }
    let params = &mut body["params"];
    if !params.is_object() {
        *params = serde_json::json!({});
    }
    let arguments = &mut params["arguments"];
    if !arguments.is_object() {
        *arguments = serde_json::json!({});
    }
    arguments[INJECTED_AGENT_KEY] = Value::String(agent_id.to_string());
    serde_json::to_vec(&body).unwrap_or_else(|_| raw.to_vec())
}

// --- Routes ---

#[post("/<path..>", data = "<data>")]
pub async fn proxy_post(
    state: &State<ProxyState>,
    path: PathBuf,
    query: RawQuery,
    content_type: Option<&ContentType>,
    agent: AgentIdHeader,
    session: SessionIdHeader,
    auth: AuthHeader,
    data: Data<'_>,
) -> ProxyResponse {
    let raw = data
        .open(MAX_PROXY_BODY.mebibytes())
        .into_bytes()
        .await
        .map(|b| b.into_inner())
        .unwrap_or_default();

    state.capture_session(&agent.0, &session.0);
    let body = match state.resolve_agent(&agent.0, &session.0) {
        Some(agent_id) => inject_agent_id(&raw, &agent_id),
        None => raw,
    };

    let url = state.upstream(&path, &query.0);
    state
        .forward(
            reqwest::Method::POST,
            &url,
            content_type,
            &auth.0,
            &session.0,
            &agent.0,
            Some(body),
        )
        .await
}

#[get("/<path..>")]
pub async fn proxy_get(
    state: &State<ProxyState>,
    path: PathBuf,
    query: RawQuery,
    agent: AgentIdHeader,
    session: SessionIdHeader,
    auth: AuthHeader,
) -> ProxyResponse {
    state.capture_session(&agent.0, &session.0);
    let url = state.upstream(&path, &query.0);
    state
        .forward(
            reqwest::Method::GET,
            &url,
            None,
            &auth.0,
            &session.0,
            &agent.0,
            None,
        )
        .await
}

#[rocket::delete("/<path..>")]
pub async fn proxy_delete(
    state: &State<ProxyState>,
    path: PathBuf,
    query: RawQuery,
    agent: AgentIdHeader,
    session: SessionIdHeader,
    auth: AuthHeader,
) -> ProxyResponse {
    state.capture_session(&agent.0, &session.0);
    let url = state.upstream(&path, &query.0);
    state
        .forward(
            reqwest::Method::DELETE,
            &url,
            None,
            &auth.0,
            &session.0,
            &agent.0,
            None,
        )
        .await
}

/// Build the proxy server on its own port. Launched alongside the webhook
/// surface when `PROXY_PORT` is configured.
pub fn build_proxy_rocket(
    config: &BridgeConfig,
    tracker: Arc<ConversationTracker>,
) -> rocket::Rocket<rocket::Build> {
    let figment = rocket::Config::figment()
        .merge(("port", config.proxy_port))
        .merge(("limits.bytes", 10 * 1024 * 1024));
    rocket::custom(figment)
        .manage(ProxyState::new(&config.proxy_upstream_url, tracker))
        .mount("/", rocket::routes![proxy_post, proxy_get, proxy_delete])
}
