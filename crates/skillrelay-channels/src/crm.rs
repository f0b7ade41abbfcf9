//! CRM chat bridge: polls the CRM's bridge API for queued chat messages and
//! posts answers back.
//!
//! All endpoints live under `{base}/api/bridge/` and take a bearer token that
//! is generated locally and installed on the CRM side as `BRIDGE_TOKEN`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use skillrelay_bridge::{
    Author, InboundMessage, MessageKind, PollError, Poller, PollingSource, Progress, PromptBuilder,
    RelayConfig, Reply, ReplySink, retry_with_backoff,
};

use crate::config;
use crate::error::{ChannelError, Result};

/// Seconds between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Key under which `config.json` keeps the bridge token.
pub const BRIDGE_TOKEN_KEY: &str = "bridge_token";

/// Channel name stamped on every CRM message.
pub const CRM_CHANNEL: &str = "crm";

const SERVICE: &str = "crm";
const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(15);
const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
const RESPOND_ATTEMPTS: u32 = 5;
const RESPOND_DELAY: Duration = Duration::from_secs(3);
const SEND_ATTEMPTS: u32 = 3;
const SEND_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A queued chat message as the CRM returns it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmMessage {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<Value>,
    /// Older CRM builds send the user id under this misspelt key.
    #[serde(default, rename = "oderId")]
    pub legacy_user_id: Option<Value>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub message: String,
}

impl CrmMessage {
    /// Convert to the bridge model. Messages without an id cannot be
    /// answered and yield `None`.
    pub fn into_inbound(self) -> Option<InboundMessage> {
        let id = scalar_string(&self.id)?;
        let author_id = self
            .user_id
            .as_ref()
            .or(self.legacy_user_id.as_ref())
            .and_then(scalar_string)
            .unwrap_or_else(|| "unknown".to_string());
        Some(InboundMessage {
            id,
            channel: CRM_CHANNEL.to_string(),
            author: Author {
                id: author_id,
                name: self.user_name.unwrap_or_else(|| "Unknown".to_string()),
            },
            text: self.message,
            timestamp: Utc::now(),
            thread_id: None,
            kind: MessageKind::Chat,
            is_admin: self.is_admin,
            extra: serde_json::Map::new(),
        })
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Output of `skillrelay crm status`.
#[derive(Debug, Serialize)]
pub struct CrmStatus {
    pub pending_messages: usize,
    pub messages: Vec<Value>,
    pub online_users: Vec<Value>,
    pub pending_conversations: u64,
    pub total_conversations: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bridge API client.
pub struct CrmClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    /// Where `backup_<id>.txt` goes when a response cannot be delivered.
    backup_dir: Option<PathBuf>,
    respond_delay: Duration,
    send_delay: Duration,
}

impl CrmClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("SkillRelay/0.1")
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
            backup_dir: None,
            respond_delay: RESPOND_DELAY,
            send_delay: SEND_DELAY,
        }
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Override the initial backoff delay of every retried call.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.respond_delay = delay;
        self.send_delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/bridge/{path}", self.base_url)
    }

    async fn get_json(&self, path: &str, timeout: Duration) -> Result<Value> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .timeout(timeout)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChannelError::Status {
                service: SERVICE.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// `GET messages`, classified for the polling loop.
    pub async fn fetch_messages(&self) -> std::result::Result<Vec<Value>, PollError> {
        match self.get_json("messages", POLL_TIMEOUT).await {
            Ok(body) => Ok(body
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            Err(ChannelError::Status { status: 401, .. }) => Err(PollError::Unauthorized),
            Err(ChannelError::Status {
                status: status @ (502 | 503 | 504),
                ..
            }) => Err(PollError::Transient(format!(
                "server temporarily unavailable (HTTP {status})"
            ))),
            Err(ChannelError::Http(e)) => Err(PollError::Transient(e.to_string())),
            Err(e) => Err(PollError::Other(e.to_string())),
        }
    }

    /// Deliver an answer. Retries through a CRM restart; if that still
    /// fails the text is saved to `backup_<id>.txt`.
    pub async fn respond(&self, message_id: &str, response: &str) -> Result<()> {
        let body = json!({ "messageId": message_id, "response": response });
        let result = retry_with_backoff(RESPOND_ATTEMPTS, self.respond_delay, || {
            self.post_json("respond", &body, POST_TIMEOUT)
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(message_id, error = %e, "failed to post response after retries");
                if let Some(dir) = &self.backup_dir {
                    let path = backup_path(dir, message_id);
                    match std::fs::write(&path, response) {
                        Ok(()) => tracing::info!(path = %path.display(), "response saved to backup"),
                        Err(io) => tracing::warn!(error = %io, "failed to write response backup"),
                    }
                }
                Err(e)
            }
        }
    }

    /// Report what the relay is doing. Best effort, never retried.
    pub async fn post_activity(&self, message_id: &str, activity: &str) -> Result<()> {
        let body = json!({ "messageId": message_id, "activity": activity });
        self.post_json("activity", &body, ACTIVITY_TIMEOUT).await?;
        Ok(())
    }

    /// Send a direct message as the bridge persona.
    pub async fn send_dm(&self, to_user_id: &str, content: &str, to_user_name: Option<&str>) -> Result<Value> {
        let mut body = json!({ "toUserId": to_user_id, "content": content });
        if let Some(name) = to_user_name {
            body["toUserName"] = Value::String(name.to_string());
        }
        let result = retry_with_backoff(SEND_ATTEMPTS, self.send_delay, || {
            self.post_json("dm", &body, POST_TIMEOUT)
        })
        .await?;
        tracing::info!(to = to_user_name.unwrap_or(to_user_id), "dm sent");
        Ok(result)
    }

    /// Post in the shared chat room, optionally @-mentioning a user.
    pub async fn post_to_chatroom(&self, content: &str, mention_user_id: Option<&str>) -> Result<Value> {
        let mut body = json!({ "content": content });
        if let Some(user) = mention_user_id {
            body["mentionUserId"] = Value::String(user.to_string());
        }
        let result = retry_with_backoff(SEND_ATTEMPTS, self.send_delay, || {
            self.post_json("chatroom", &body, POST_TIMEOUT)
        })
        .await?;
        tracing::info!("posted to chatroom");
        Ok(result)
    }

    pub async fn users(&self) -> Result<Vec<Value>> {
        let body = self.get_json("users", POLL_TIMEOUT).await?;
        Ok(body
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn conversations(&self, pending_only: bool) -> Result<Value> {
        let path = if pending_only {
            "conversations?pending=true"
        } else {
            "conversations"
        };
        self.get_json(path, POLL_TIMEOUT).await
    }

    /// Pending messages, who is online and the conversation counters. Each
    /// part degrades to empty on failure so the command always answers.
    pub async fn status(&self) -> CrmStatus {
        let messages = self.fetch_messages().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to fetch messages");
            Vec::new()
        });
        let users = self.users().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to fetch users");
            Vec::new()
        });
        let conversations = self.conversations(true).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to fetch conversations");
            Value::Null
        });

        let online_users = users
            .into_iter()
            .filter(|u| u.get("isOnline").and_then(Value::as_bool).unwrap_or(false))
            .collect();
        let counter = |key: &str| conversations.get(key).and_then(Value::as_u64).unwrap_or(0);

        CrmStatus {
            pending_messages: messages.len(),
            pending_conversations: counter("pendingCount"),
            total_conversations: counter("totalConversations"),
            messages,
            online_users,
        }
    }
}

/// `<dir>/backup_<message_id>.txt`. The id comes from the CRM, so anything
/// other than word characters, `-` and `.` becomes `_` and the file always
/// lands directly in `dir`.
pub fn backup_path(dir: &Path, message_id: &str) -> PathBuf {
    let safe: String = message_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("backup_{safe}.txt"))
}

/// The bridge token from `config.json`, generating and saving one on first
/// use. Other keys in the file are preserved. The flag is `true` when the
/// token was just created.
pub fn bridge_token(dir: &Path) -> Result<(String, bool)> {
    let mut raw = config::load_raw(dir);
    if let Some(Value::String(token)) = raw.get(BRIDGE_TOKEN_KEY)
        && !token.is_empty()
    {
        return Ok((token.clone(), false));
    }

    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| std::io::Error::other("system random generator failed"))?;
    let token = URL_SAFE_NO_PAD.encode(bytes);
    raw.insert(BRIDGE_TOKEN_KEY.to_string(), Value::String(token.clone()));
    config::save(dir, &raw)?;
    tracing::info!("generated new bridge token");
    Ok((token, true))
}

/// Expose the bridge API to the relay so it can message users itself.
pub fn configure_relay(relay: &mut RelayConfig, client: &CrmClient) {
    relay
        .env
        .insert("CRM_BRIDGE_URL".to_string(), client.base_url().to_string());
    relay
        .env
        .insert("CRM_BRIDGE_TOKEN".to_string(), client.token().to_string());
}

// ---------------------------------------------------------------------------
// Bridge plumbing
// ---------------------------------------------------------------------------

pub struct CrmPoller {
    client: Arc<CrmClient>,
}

impl CrmPoller {
    pub fn new(client: Arc<CrmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Poller for CrmPoller {
    async fn poll(&mut self) -> std::result::Result<Vec<InboundMessage>, PollError> {
        let raw = self.client.fetch_messages().await?;
        let mut messages = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<CrmMessage>(value) {
                Ok(m) => match m.into_inbound() {
                    Some(inbound) => messages.push(inbound),
                    None => tracing::warn!("skipping crm message without id"),
                },
                Err(e) => tracing::warn!(error = %e, "skipping malformed crm message"),
            }
        }
        Ok(messages)
    }
}

/// Polling source over the CRM bridge API.
pub fn crm_source(client: Arc<CrmClient>, interval: Duration) -> PollingSource<CrmPoller> {
    PollingSource::new(CrmPoller::new(client), interval)
}

pub struct CrmSink {
    client: Arc<CrmClient>,
}

impl CrmSink {
    pub fn new(client: Arc<CrmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReplySink for CrmSink {
    fn name(&self) -> &str {
        CRM_CHANNEL
    }

    async fn send_reply(&self, message: &InboundMessage, reply: &Reply) -> skillrelay_bridge::Result<()> {
        self.client.respond(&message.id, &reply.body).await?;
        tracing::info!(id = %message.id, "response posted");
        Ok(())
    }

    async fn progress(&self, message: &InboundMessage, progress: Progress) -> skillrelay_bridge::Result<()> {
        if let Progress::Activity(activity) = progress {
            self.client.post_activity(&message.id, &activity).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

const BRIDGE_CAPABILITIES: &str = r#"## Platform capabilities

You can act on the CRM platform with curl. The URL and token are in the
CRM_BRIDGE_URL and CRM_BRIDGE_TOKEN environment variables.

Send a DM to a user:
  curl -s -X POST "$CRM_BRIDGE_URL/api/bridge/dm" \
    -H "Authorization: Bearer $CRM_BRIDGE_TOKEN" -H "Content-Type: application/json" \
    -d '{"toUserId": "USER_ID", "content": "your message"}'

Post in the chat room (add "mentionUserId" to @-mention someone):
  curl -s -X POST "$CRM_BRIDGE_URL/api/bridge/chatroom" \
    -H "Authorization: Bearer $CRM_BRIDGE_TOKEN" -H "Content-Type: application/json" \
    -d '{"content": "your message"}'

List users and who is online:
  curl -s "$CRM_BRIDGE_URL/api/bridge/users" -H "Authorization: Bearer $CRM_BRIDGE_TOKEN"

List conversations (append ?pending=true for those awaiting a reply):
  curl -s "$CRM_BRIDGE_URL/api/bridge/conversations" -H "Authorization: Bearer $CRM_BRIDGE_TOKEN"

When someone asks you to message another user or post in the chat room, do it
with these commands instead of describing how."#;

/// Full-context prompt for every CRM message. Admins get the operator
/// briefing; everyone else talks to the persona.
pub struct CrmPrompt {
    persona: String,
    working_dir: String,
}

impl CrmPrompt {
    pub fn new(persona: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            working_dir: working_dir.into(),
        }
    }
}

impl PromptBuilder for CrmPrompt {
    fn build(&self, message: &InboundMessage, _continuing: bool) -> String {
        let persona = &self.persona;
        let workdir = &self.working_dir;
        if message.is_admin {
            format!(
                "You are {persona}, working on the CRM codebase in {workdir} with full tool access.\n\
                 When asked for a code or UI change, find the relevant files, edit them, \
                 build and deploy, then report what changed.\n\n\
                 {BRIDGE_CAPABILITIES}\n\n\
                 User request: {}",
                message.text
            )
        } else {
            format!(
                "You are {persona}, a member of the CRM platform.\n\
                 User talking to you: {} (id: {})\n\
                 The CRM codebase is in {workdir}. You may fix bugs and build features when asked, \
                 but never reveal sensitive investor data or export bulk data.\n\
                 Keep responses concise and chat-appropriate.\n\n\
                 {BRIDGE_CAPABILITIES}\n\n\
                 Message: {}",
                message.author.name, message.author.id, message.text
            )
        }
    }

    fn uses_sessions(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_path_flattens_remote_ids() {
        let dir = Path::new("/data/crm");
        assert_eq!(backup_path(dir, "m7"), dir.join("backup_m7.txt"));
        assert_eq!(backup_path(dir, "../x"), dir.join("backup_.._x.txt"));
        assert_eq!(backup_path(dir, "a/b\\c"), dir.join("backup_a_b_c.txt"));
        assert_eq!(backup_path(dir, "../x").parent(), Some(dir));
    }

    #[test]
    fn crm_message_converts_with_fallbacks() {
        let raw = json!({ "id": 17, "message": "hello" });
        let msg: CrmMessage = serde_json::from_value(raw).unwrap();
        let inbound = msg.into_inbound().unwrap();
        assert_eq!(inbound.id, "17");
        assert_eq!(inbound.channel, "crm");
        assert_eq!(inbound.author.id, "unknown");
        assert_eq!(inbound.author.name, "Unknown");
        assert_eq!(inbound.kind, MessageKind::Chat);
        assert!(!inbound.is_admin);
    }

    #[test]
    fn legacy_user_id_key_is_accepted() {
        let raw = json!({ "id": "m1", "userName": "Ada", "oderId": "u9", "isAdmin": true, "message": "x" });
        let inbound = serde_json::from_value::<CrmMessage>(raw)
            .unwrap()
            .into_inbound()
            .unwrap();
        assert_eq!(inbound.author.id, "u9");
        assert_eq!(inbound.author.name, "Ada");
        assert!(inbound.is_admin);
    }

    #[test]
    fn user_id_wins_over_legacy_key() {
        let raw = json!({ "id": "m1", "userId": "u1", "oderId": "u9" });
        let inbound = serde_json::from_value::<CrmMessage>(raw)
            .unwrap()
            .into_inbound()
            .unwrap();
        assert_eq!(inbound.author.id, "u1");
    }

    #[test]
    fn message_without_id_is_dropped() {
        let msg: CrmMessage = serde_json::from_value(json!({ "message": "orphan" })).unwrap();
        assert!(msg.into_inbound().is_none());
    }

    #[test]
    fn bridge_token_is_generated_once_and_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(config::config_path(dir.path()), r#"{"persona": "Ops Bot"}"#).unwrap();

        let (first, created) = bridge_token(dir.path()).unwrap();
        assert!(created);
        assert_eq!(first.len(), 43);

        let (second, created) = bridge_token(dir.path()).unwrap();
        assert!(!created);
        assert_eq!(first, second);

        let raw = config::load_raw(dir.path());
        assert_eq!(raw["persona"], "Ops Bot");
    }

    #[test]
    fn relay_gets_bridge_credentials() {
        let client = CrmClient::new("https://crm.example.com/", "tok");
        let mut relay = RelayConfig::default();
        configure_relay(&mut relay, &client);
        assert_eq!(relay.env["CRM_BRIDGE_URL"], "https://crm.example.com");
        assert_eq!(relay.env["CRM_BRIDGE_TOKEN"], "tok");
    }

    fn inbound(is_admin: bool) -> InboundMessage {
        let raw = json!({ "id": "1", "userName": "Ada", "userId": "u1", "isAdmin": is_admin, "message": "fix the header" });
        serde_json::from_value::<CrmMessage>(raw)
            .unwrap()
            .into_inbound()
            .unwrap()
    }

    #[test]
    fn member_prompt_names_the_user() {
        let prompt = CrmPrompt::new("Ops Bot", "/srv/crm");
        let text = prompt.build(&inbound(false), false);
        assert!(text.starts_with("You are Ops Bot, a member"));
        assert!(text.contains("User talking to you: Ada (id: u1)"));
        assert!(text.contains("$CRM_BRIDGE_URL/api/bridge/dm"));
        assert!(text.ends_with("Message: fix the header"));
    }

    #[test]
    fn admin_prompt_is_a_request() {
        let prompt = CrmPrompt::new("Ops Bot", "/srv/crm");
        let text = prompt.build(&inbound(true), true);
        assert!(text.contains("/srv/crm"));
        assert!(text.ends_with("User request: fix the header"));
        assert!(!prompt.uses_sessions());
    }
}
