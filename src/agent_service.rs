use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{BridgeError, Result};
use crate::models::AgentMessage;

/// Client for the upstream agent platform (Letta-compatible REST surface).
/// Prompts run long; everything else is bounded at 10 s.
pub struct AgentServiceClient {
    http: reqwest::Client,
    prompt_http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl AgentServiceClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create agent-service HTTP client");
        // Agent prompts can legitimately run for a very long time.
        let prompt_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3600))
            .build()
            .expect("Failed to create agent-service prompt client");
        AgentServiceClient {
            http,
            prompt_http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(BridgeError::AgentService(format!(
            "HTTP {status} {}",
            body.chars().take(300).collect::<String>()
        )))
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let resp = self
            .authed(self.http.get(self.url("/v1/agents")))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentInfo> {
        let resp = self
            .authed(self.http.get(self.url(&format!(
                "/v1/agents/{}",
                urlencoding::encode(agent_id)
            ))))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Forward a user prompt to the agent. The actual assistant response
    /// comes back asynchronously through the completion webhook.
    pub async fn send_prompt(&self, agent_id: &str, sender: &str, text: &str) -> Result<()> {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": text,
                "name": sender,
            }]
        });
        let resp = self
            .authed(self.prompt_http.post(self.url(&format!(
                "/v1/agents/{}/messages",
                urlencoding::encode(agent_id)
            ))))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Most recent messages for an agent, newest last.
    pub async fn list_messages(&self, agent_id: &str, limit: u32) -> Result<Vec<AgentMessage>> {
        let resp = self
            .authed(
                self.http
                    .get(self.url(&format!(
                        "/v1/agents/{}/messages",
                        urlencoding::encode(agent_id)
                    )))
                    .query(&[("limit", limit.to_string())]),
            )
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Ensure the platform has a webhook config pointing at us. Returns the
    /// config currently in effect.
    pub async fn ensure_webhook(&self, callback_url: &str, secret: &str) -> Result<Value> {
        let resp = self
            .authed(self.http.get(self.url("/v1/webhooks")))
            .send()
            .await?;
        let existing: Value = Self::check(resp).await?.json().await.unwrap_or_default();
        if let Some(list) = existing.as_array()
            && let Some(found) = list
                .iter()
                .find(|w| w["url"].as_str() == Some(callback_url))
        {
            return Ok(found.clone());
        }

        let body = json!({
            "url": callback_url,
            "event_types": ["agent.run.completed"],
            "secret": secret,
        });
        let resp = self
            .authed(self.http.post(self.url("/v1/webhooks")))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_info_tolerates_missing_name() {
        let info: AgentInfo = serde_json::from_str(r#"{"id": "agent-1"}"#).unwrap();
        assert_eq!(info.id, "agent-1");
        assert!(info.name.is_empty());
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let client = AgentServiceClient::new("http://letta:8283/", "tok");
        assert_eq!(client.url("/v1/agents"), "http://letta:8283/v1/agents");
    }
}
