use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{BridgeError, Result};

/// Server-side long-poll window for /sync (milliseconds).
const SYNC_TIMEOUT_MS: u64 = 30_000;

/// Lightweight Matrix Client-Server API client over plain HTTP.
/// One instance per (homeserver, access token); no E2EE, no SDK state.
#[derive(Clone)]
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver_url: String,
    access_token: String,
    pub user_id: String,
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RoomAliasResponse {
    pub room_id: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendEventResponse {
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Deserialize, Default)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoomSync>,
    #[serde(default)]
    pub invite: HashMap<String, InvitedRoomSync>,
}

#[derive(Debug, Deserialize, Default)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Deserialize, Default)]
pub struct InvitedRoomSync {
    #[serde(default)]
    pub invite_state: InviteState,
}

#[derive(Debug, Deserialize, Default)]
pub struct InviteState {
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimelineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub origin_server_ts: Option<i64>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<TimelineEvent>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinedMembersResponse {
    #[serde(default)]
    pub joined: HashMap<String, Value>,
}

/// Options for room creation; mirrors the createRoom body.
#[derive(Debug, Serialize, Default)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub initial_state: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_level_content_override: Option<Value>,
}

/// Pull the Matrix errcode (`M_USER_IN_USE`, ...) out of an error body.
pub fn errcode(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("errcode")?
        .as_str()
        .map(|s| s.to_string())
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

impl MatrixClient {
    pub fn new(homeserver_url: &str, access_token: &str, user_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create Matrix HTTP client");
        MatrixClient {
            http,
            homeserver_url: homeserver_url.trim_end_matches('/').to_string(),
            access_token: access_token.trim().to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Client with no credentials, for login/register flows.
    pub fn anonymous(homeserver_url: &str) -> Self {
        Self::new(homeserver_url, "", "")
    }

    /// Same account, new token (after a re-login).
    pub fn with_token(&self, access_token: &str) -> Self {
        MatrixClient {
            http: self.http.clone(),
            homeserver_url: self.homeserver_url.clone(),
            access_token: access_token.trim().to_string(),
            user_id: self.user_id.clone(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.homeserver_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(BridgeError::Homeserver {
            status,
            body: body.chars().take(300).collect(),
        })
    }

    // --- Auth ---

    /// Password login. Returns the full response so callers can persist the
    /// token and canonical user id.
    pub async fn login(&self, localpart: &str, password: &str) -> Result<LoginResponse> {
        let body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": localpart},
            "password": password,
            "initial_device_display_name": "matrix-agent-bridge",
        });
        let resp = self
            .http
            .post(self.url("/_matrix/client/v3/login"))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Register an account through the registration-token UIA flow. The
    /// first attempt carries the token without a session; a 401 with a
    /// session id is retried with the session attached, and a server that
    /// only demands the dummy stage gets that instead.
    pub async fn register(
        &self,
        localpart: &str,
        password: &str,
        registration_token: &str,
    ) -> Result<LoginResponse> {
        let url = self.url("/_matrix/client/v3/register");
        let first = json!({
            "username": localpart,
            "password": password,
            "initial_device_display_name": "matrix-agent-bridge",
            "auth": {"type": "m.login.registration_token", "token": registration_token},
        });
        let resp = self.http.post(&url).json(&first).send().await?;
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status != 401 {
            return Err(BridgeError::Homeserver {
                status,
                body: body.chars().take(300).collect(),
            });
        }

        // Interactive-auth challenge: echo the session back with the stage
        // the server advertises.
        let challenge: Value = serde_json::from_str(&body).unwrap_or_default();
        let session = challenge.get("session").and_then(|s| s.as_str());
        let wants_token = challenge["flows"]
            .as_array()
            .map(|flows| {
                flows.iter().any(|f| {
                    f["stages"]
                        .as_array()
                        .is_some_and(|s| s.iter().any(|v| v == "m.login.registration_token"))
                })
            })
            .unwrap_or(true);

        let mut auth = if wants_token {
            json!({"type": "m.login.registration_token", "token": registration_token})
        } else {
            json!({"type": "m.login.dummy"})
        };
        if let Some(session) = session {
            auth["session"] = json!(session);
        }
        let second = json!({
            "username": localpart,
            "password": password,
            "initial_device_display_name": "matrix-agent-bridge",
            "auth": auth,
        });
        let resp = self.http.post(&url).json(&second).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn whoami(&self) -> Result<String> {
        let resp = self
            .http
            .get(self.url("/_matrix/client/v3/account/whoami"))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: Value = Self::check(resp).await?.json().await?;
        body["user_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BridgeError::Homeserver {
                status: 200,
                body: "whoami response missing user_id".into(),
            })
    }

    // --- Profile ---

    pub async fn set_display_name(&self, user_id: &str, display_name: &str) -> Result<()> {
        let url = self.url(&format!(
            "/_matrix/client/v3/profile/{}/displayname",
            encode(user_id)
        ));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"displayname": display_name}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn set_avatar_url(&self, user_id: &str, avatar_url: &str) -> Result<()> {
        let url = self.url(&format!(
            "/_matrix/client/v3/profile/{}/avatar_url",
            encode(user_id)
        ));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"avatar_url": avatar_url}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn get_display_name(&self, user_id: &str) -> Result<Option<String>> {
        let url = self.url(&format!(
            "/_matrix/client/v3/profile/{}/displayname",
            encode(user_id)
        ));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = Self::check(resp).await?.json().await?;
        Ok(body["displayname"].as_str().map(|s| s.to_string()))
    }

    // --- Rooms ---

    pub async fn create_room(&self, req: &CreateRoomRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/_matrix/client/v3/createRoom"))
            .bearer_auth(&self.access_token)
            .json(req)
            .send()
            .await?;
        let created: CreateRoomResponse = Self::check(resp).await?.json().await?;
        Ok(created.room_id)
    }

    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<String> {
        let url = self.url(&format!(
            "/_matrix/client/v3/join/{}",
            encode(room_id_or_alias)
        ));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await?;
        let joined: JoinRoomResponse = Self::check(resp).await?.json().await?;
        Ok(joined.room_id)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        let url = self.url(&format!("/_matrix/client/v3/rooms/{}/leave", encode(room_id)));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        let url = self.url(&format!("/_matrix/client/v3/rooms/{}/invite", encode(room_id)));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"user_id": user_id}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn kick(&self, room_id: &str, user_id: &str, reason: &str) -> Result<()> {
        let url = self.url(&format!("/_matrix/client/v3/rooms/{}/kick", encode(room_id)));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"user_id": user_id, "reason": reason}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn joined_members(&self, room_id: &str) -> Result<Vec<String>> {
        let url = self.url(&format!(
            "/_matrix/client/v3/rooms/{}/joined_members",
            encode(room_id)
        ));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let members: JoinedMembersResponse = Self::check(resp).await?.json().await?;
        Ok(members.joined.into_keys().collect())
    }

    pub async fn resolve_alias(&self, alias: &str) -> Result<RoomAliasResponse> {
        let url = self.url(&format!(
            "/_matrix/client/v3/directory/room/{}",
            encode(alias)
        ));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    // --- Events ---

    /// Send a timeline event with a fresh transaction id. 429s are retried
    /// once after the server-suggested delay.
    pub async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String> {
        let mut retried = false;
        loop {
            let txn_id = uuid::Uuid::new_v4().to_string();
            let url = self.url(&format!(
                "/_matrix/client/v3/rooms/{}/send/{}/{}",
                encode(room_id),
                encode(event_type),
                encode(&txn_id)
            ));
            let resp = self
                .http
                .put(&url)
                .bearer_auth(&self.access_token)
                .json(content)
                .send()
                .await?;
            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS && !retried {
                let body: Value = resp.json().await.unwrap_or_default();
                let delay = body["retry_after_ms"].as_u64().unwrap_or(2_000);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                retried = true;
                continue;
            }
            let sent: SendEventResponse = Self::check(resp).await?.json().await?;
            return Ok(sent.event_id);
        }
    }

    /// Plain text message.
    pub async fn send_text(&self, room_id: &str, body: &str) -> Result<String> {
        self.send_event(
            room_id,
            "m.room.message",
            &json!({"msgtype": "m.text", "body": body}),
        )
        .await
    }

    pub async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String> {
        let url = self.url(&format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            encode(room_id),
            encode(event_type),
            encode(state_key)
        ));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await?;
        let sent: SendEventResponse = Self::check(resp).await?.json().await?;
        Ok(sent.event_id)
    }

    pub async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Value> {
        let url = self.url(&format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            encode(room_id),
            encode(event_type),
            encode(state_key)
        ));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    // --- Account data ---

    pub async fn get_account_data(&self, user_id: &str, data_type: &str) -> Result<Value> {
        let url = self.url(&format!(
            "/_matrix/client/v3/user/{}/account_data/{}",
            encode(user_id),
            encode(data_type)
        ));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(json!({}));
        }
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn set_account_data(
        &self,
        user_id: &str,
        data_type: &str,
        content: &Value,
    ) -> Result<()> {
        let url = self.url(&format!(
            "/_matrix/client/v3/user/{}/account_data/{}",
            encode(user_id),
            encode(data_type)
        ));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    // --- Sync & history ---

    /// One filtered long-poll /sync cycle. `since = None` requests the
    /// initial batch without blocking (timeout 0).
    pub async fn sync(&self, since: Option<&str>, filter: Option<&str>) -> Result<SyncResponse> {
        let timeout_ms = if since.is_some() { SYNC_TIMEOUT_MS } else { 0 };
        let mut request = self
            .http
            .get(self.url("/_matrix/client/v3/sync"))
            .bearer_auth(&self.access_token)
            // client default is 10 s; leave slack past the server window
            .timeout(Duration::from_millis(timeout_ms + 10_000))
            .query(&[("timeout", timeout_ms.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        if let Some(filter) = filter {
            request = request.query(&[("filter", filter)]);
        }
        let resp = request.send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Inline sync filter limiting the payload to timeline + membership.
    pub fn sync_filter() -> String {
        json!({
            "room": {
                "timeline": {"limit": 50},
                "state": {"lazy_load_members": true},
                "ephemeral": {"types": []}
            },
            "presence": {"types": []}
        })
        .to_string()
    }

    pub async fn messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        limit: u32,
    ) -> Result<MessagesResponse> {
        let url = self.url(&format!(
            "/_matrix/client/v3/rooms/{}/messages",
            encode(room_id)
        ));
        let mut request = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("dir", "b"), ("limit", &limit.to_string())]);
        if let Some(from) = from {
            request = request.query(&[("from", from)]);
        }
        let resp = request.send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    // --- Synapse admin API ---

    /// Admin reset-password, v1 endpoint.
    pub async fn admin_reset_password_v1(&self, user_id: &str, new_password: &str) -> Result<()> {
        let url = self.url(&format!(
            "/_synapse/admin/v1/reset_password/{}",
            encode(user_id)
        ));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"new_password": new_password, "logout_devices": false}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Admin v2 user upsert — password reset, profile update, deactivation.
    pub async fn admin_put_user(&self, user_id: &str, body: &Value) -> Result<()> {
        let url = self.url(&format!("/_synapse/admin/v2/users/{}", encode(user_id)));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn admin_deactivate(&self, user_id: &str) -> Result<()> {
        self.admin_put_user(user_id, &json!({"deactivated": true})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errcode_extraction() {
        assert_eq!(
            errcode(r#"{"errcode":"M_USER_IN_USE","error":"taken"}"#).as_deref(),
            Some("M_USER_IN_USE")
        );
        assert_eq!(errcode("not json"), None);
        assert_eq!(errcode(r#"{"error":"no code"}"#), None);
    }

    #[test]
    fn new_strips_trailing_slash_and_trims_token() {
        let client = MatrixClient::new("https://matrix.example.com/", "  tok  ", "@bot:example.com");
        assert_eq!(client.homeserver_url, "https://matrix.example.com");
        assert_eq!(client.access_token(), "tok");
    }

    #[test]
    fn with_token_keeps_account() {
        let client = MatrixClient::new("https://hs", "old", "@bot:example.com");
        let rebuilt = client.with_token("new");
        assert_eq!(rebuilt.user_id, "@bot:example.com");
        assert_eq!(rebuilt.access_token(), "new");
    }

    #[test]
    fn sync_response_parses_invites_and_timeline() {
        let json = r#"{
            "next_batch": "s42",
            "rooms": {
                "join": {
                    "!a:hs": {"timeline": {"events": [
                        {"type": "m.room.message", "sender": "@u:hs",
                         "event_id": "$e1", "origin_server_ts": 1700000000000,
                         "content": {"msgtype": "m.text", "body": "hello"}}
                    ]}}
                },
                "invite": {
                    "!b:hs": {"invite_state": {"events": [
                        {"type": "m.room.member", "sender": "@inviter:hs",
                         "state_key": "@bot:hs", "content": {"membership": "invite"}}
                    ]}}
                }
            }
        }"#;
        let resp: SyncResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.next_batch, "s42");
        let joined = resp.rooms.join.get("!a:hs").unwrap();
        assert_eq!(joined.timeline.events[0].content["body"], "hello");
        assert!(resp.rooms.invite.contains_key("!b:hs"));
    }

    #[test]
    fn sync_response_tolerates_missing_rooms() {
        let resp: SyncResponse = serde_json::from_str(r#"{"next_batch":"s0"}"#).unwrap();
        assert!(resp.rooms.join.is_empty());
        assert!(resp.rooms.invite.is_empty());
    }

    #[test]
    fn create_room_request_omits_empty_fields() {
        let req = CreateRoomRequest {
            name: Some("Meridian".into()),
            preset: Some("private_chat".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["name"], "Meridian");
        assert!(value.get("invite").is_none());
        assert!(value.get("is_direct").is_none());
    }

    #[test]
    fn sync_filter_is_valid_json() {
        let filter: Value = serde_json::from_str(&MatrixClient::sync_filter()).unwrap();
        assert_eq!(filter["room"]["timeline"]["limit"], 50);
    }
}
