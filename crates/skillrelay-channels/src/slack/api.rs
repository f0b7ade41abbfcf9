//! Slack Web API client.
//!
//! Every method is a form-encoded POST to `{base}/{method}` with a bearer
//! token. Slack reports failures as `{"ok": false, "error": "..."}` with a
//! 200 status, so the body is always checked.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ChannelError, Result};

/// Slack Web API base URL.
pub const SLACK_API_BASE: &str = "https://slack.com/api";

const SERVICE: &str = "slack";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One emoji reaction on a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Reaction {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub count: u32,
}

pub struct SlackClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl SlackClient {
    /// Client for the bot token (`xoxb-...`).
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, SLACK_API_BASE)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("SkillRelay/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<Value> {
        self.call_with_token(&self.token, method, params).await
    }

    async fn call_with_token(&self, token: &str, method: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Status {
                service: SERVICE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(ChannelError::api(SERVICE, error));
        }
        tracing::trace!(method, "slack call ok");
        Ok(body)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// `chat.postMessage`. Returns the new message's `ts`.
    pub async fn post_message(&self, channel: &str, text: &str, thread_ts: Option<&str>) -> Result<String> {
        let mut params = vec![("channel", channel), ("text", text)];
        if let Some(thread) = thread_ts {
            params.push(("thread_ts", thread));
        }
        let body = self.call("chat.postMessage", &params).await?;
        body.get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChannelError::api(SERVICE, "chat.postMessage returned no ts"))
    }

    pub async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<()> {
        self.call("chat.update", &[("channel", channel), ("ts", ts), ("text", text)])
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, channel: &str, ts: &str) -> Result<()> {
        self.call("chat.delete", &[("channel", channel), ("ts", ts)]).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reactions
    // -----------------------------------------------------------------------

    /// `reactions.add`. Reacting twice is not an error.
    pub async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<()> {
        match self
            .call("reactions.add", &[("channel", channel), ("timestamp", ts), ("name", name)])
            .await
        {
            Err(ChannelError::Api { reason, .. }) if reason == "already_reacted" => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// `reactions.remove`. Removing a missing reaction is not an error.
    pub async fn remove_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<()> {
        match self
            .call("reactions.remove", &[("channel", channel), ("timestamp", ts), ("name", name)])
            .await
        {
            Err(ChannelError::Api { reason, .. }) if reason == "no_reaction" => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// `reactions.get`: the reactions currently on a message.
    pub async fn reactions(&self, channel: &str, ts: &str) -> Result<Vec<Reaction>> {
        let body = self
            .call("reactions.get", &[("channel", channel), ("timestamp", ts)])
            .await?;
        let reactions = body
            .pointer("/message/reactions")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(reactions)?)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Display name: `real_name`, then `name`.
    pub async fn user_name(&self, user: &str) -> Result<String> {
        let body = self.call("users.info", &[("user", user)]).await?;
        let user_obj = body.get("user").cloned().unwrap_or(Value::Null);
        let pick = |key: &str| {
            user_obj
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        pick("real_name")
            .or_else(|| pick("name"))
            .ok_or_else(|| ChannelError::api(SERVICE, "users.info returned no name"))
    }

    /// `#name` for a conversation id.
    pub async fn channel_name(&self, channel: &str) -> Result<String> {
        let body = self.call("conversations.info", &[("channel", channel)]).await?;
        body.pointer("/channel/name")
            .and_then(Value::as_str)
            .map(|name| format!("#{name}"))
            .ok_or_else(|| ChannelError::api(SERVICE, "conversations.info returned no name"))
    }

    /// `auth.test`: the bot's own user id.
    pub async fn auth_test(&self) -> Result<String> {
        let body = self.call("auth.test", &[]).await?;
        body.get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChannelError::api(SERVICE, "auth.test returned no user_id"))
    }

    /// `apps.connections.open` with the app-level token (`xapp-...`).
    /// Returns the Socket Mode WebSocket URL.
    pub async fn open_socket(&self, app_token: &str) -> Result<String> {
        let body = self
            .call_with_token(app_token, "apps.connections.open", &[])
            .await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChannelError::api(SERVICE, "apps.connections.open returned no url"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reactions_deserialize_with_defaults() {
        let raw = json!([{ "name": "eyes" }, { "name": "x", "users": ["U1"], "count": 1 }]);
        let reactions: Vec<Reaction> = serde_json::from_value(raw).unwrap();
        assert_eq!(reactions[0].users.len(), 0);
        assert_eq!(reactions[1].users, ["U1"]);
    }

    #[test]
    fn base_url_is_normalised() {
        let client = SlackClient::with_base_url("xoxb", "http://127.0.0.1:9/api/");
        assert_eq!(client.base_url, "http://127.0.0.1:9/api");
    }
}
