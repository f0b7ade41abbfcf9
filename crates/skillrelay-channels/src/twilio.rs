//! Twilio SMS bridge.
//!
//! Inbound texts arrive on an axum webhook (`POST /sms`) which answers Twilio
//! with empty TwiML straight away and queues the message for the bridge.
//! Answers and progress notes go out through the Messages REST API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Form, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use skillrelay_bridge::{
    Author, Disposition, InboundMessage, MessageKind, PreamblePrompt, Progress, RelayConfig,
    RelayReplies, Reply, ReplySink, Shutdown,
};

use crate::config;
use crate::error::{ChannelError, Result};

pub const TWILIO_API_BASE: &str = "https://api.twilio.com";
pub const DEFAULT_PORT: u16 = 5001;
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(300);

/// Empty TwiML: acknowledge without an immediate reply.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

pub const WORKING_TEXT: &str = "Working on it...";
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);
/// Progress texts stop after this many minutes.
const MAX_PROGRESS_MINUTES: u64 = 3;

const SERVICE: &str = "twilio";

const SMS_PREAMBLE: &str = "You are responding to SMS text messages. Keep responses VERY concise; \
SMS has character limits.\n\n\
You have full access to this workspace, its skills and tools.\n\
When the user confirms something (\"yes\", \"do it\", \"y\"), carry out the action you proposed.\n\
Generated images cannot be sent back directly; say where you saved them.";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `config.json` for the SMS bridge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// Our number, used as `From`.
    #[serde(default)]
    pub phone_number: String,
    /// Empty means everyone may text the bridge.
    #[serde(default)]
    pub allowed_numbers: Vec<String>,
}

impl TwilioConfig {
    pub fn load(dir: &Path) -> Result<Self> {
        let config: Self = config::load(dir);
        for (name, value) in [
            ("account_sid", &config.account_sid),
            ("auth_token", &config.auth_token),
            ("phone_number", &config.phone_number),
        ] {
            if value.is_empty() {
                return Err(ChannelError::config(format!(
                    "{name} missing from {}",
                    config::config_path(dir).display()
                )));
            }
        }
        Ok(config)
    }
}

/// Relay settings for SMS: terse canned replies and a short error excerpt.
pub fn relay_config(base: RelayConfig) -> RelayConfig {
    let replies = RelayReplies {
        empty: "Done.".to_string(),
        timeout: "Sorry, that took too long (5 min timeout).".to_string(),
        not_found: base.replies.not_found.clone(),
    };
    RelayConfig {
        timeout: RELAY_TIMEOUT,
        stderr_limit: 200,
        replies,
        ..base
    }
}

/// Preamble for the first text from a number.
pub fn sms_prompt() -> PreamblePrompt {
    PreamblePrompt::new(SMS_PREAMBLE)
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

pub struct TwilioClient {
    base_url: String,
    account_sid: String,
    auth_token: String,
    from: String,
    http: reqwest::Client,
}

impl TwilioClient {
    pub fn new(config: &TwilioConfig) -> Self {
        Self::with_base_url(config, TWILIO_API_BASE)
    }

    pub fn with_base_url(config: &TwilioConfig, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("SkillRelay/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from: config.phone_number.clone(),
            http,
        }
    }

    pub fn from_number(&self) -> &str {
        &self.from
    }

    /// Send an SMS, or an MMS when `media_url` is set. Returns the message SID.
    pub async fn send_sms(&self, to: &str, body: &str, media_url: Option<&str>) -> Result<String> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );
        let mut form = vec![("To", to), ("From", self.from.as_str()), ("Body", body)];
        if let Some(media) = media_url {
            form.push(("MediaUrl", media));
        }

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if !status.is_success() {
            let body = parsed
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(text);
            return Err(ChannelError::Status {
                service: SERVICE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let sid = parsed
            .get("sid")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::api(SERVICE, "response has no sid"))?
            .to_string();
        tracing::info!(sid = %sid, to, "sms sent");
        Ok(sid)
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

pub struct WebhookState {
    pub tx: mpsc::Sender<InboundMessage>,
    pub auto_respond: bool,
}

/// Build a bridge message from Twilio's form fields.
pub fn sms_message(form: &HashMap<String, String>) -> InboundMessage {
    let field = |key: &str| form.get(key).cloned().unwrap_or_default();
    let from = field("From");
    let num_media = form
        .get("NumMedia")
        .and_then(|n| n.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let media_urls: Vec<Value> = (0..num_media)
        .filter_map(|i| form.get(&format!("MediaUrl{i}")))
        .filter(|url| !url.is_empty())
        .map(|url| Value::String(url.clone()))
        .collect();
    let id = form
        .get("MessageSid")
        .filter(|sid| !sid.is_empty())
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    let mut extra = serde_json::Map::new();
    extra.insert("to".to_string(), Value::String(field("To")));
    extra.insert("media_urls".to_string(), Value::Array(media_urls));

    InboundMessage {
        id,
        channel: from.clone(),
        author: Author {
            id: from.clone(),
            name: from,
        },
        text: field("Body").trim().to_string(),
        timestamp: Utc::now(),
        thread_id: None,
        kind: MessageKind::Sms,
        is_admin: false,
        extra,
    }
}

async fn handle_sms(
    State(state): State<Arc<WebhookState>>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let message = sms_message(&form);
    tracing::info!(from = %message.author.id, id = %message.id, "sms received");
    if let Err(e) = state.tx.send(message).await {
        tracing::error!(error = %e, "bridge queue closed, dropping sms");
    }
    ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML)
}

async fn status(State(state): State<Arc<WebhookState>>) -> Json<Value> {
    Json(json!({ "status": "running", "auto_respond": state.auto_respond }))
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/sms", post(handle_sms))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the webhook on `listener` until `shutdown` fires.
pub async fn serve_webhook(listener: TcpListener, state: Arc<WebhookState>, shutdown: Shutdown) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "sms webhook listening on /sms");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    tracing::info!("sms webhook stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct TwilioSink {
    client: Arc<TwilioClient>,
}

impl TwilioSink {
    pub fn new(client: Arc<TwilioClient>) -> Self {
        Self { client }
    }

    async fn text(&self, to: &str, body: &str) -> skillrelay_bridge::Result<()> {
        self.client.send_sms(to, body, None).await?;
        Ok(())
    }
}

fn extra_str<'a>(message: &'a InboundMessage, key: &str) -> &'a str {
    message.extra.get(key).and_then(Value::as_str).unwrap_or("")
}

#[async_trait]
impl ReplySink for TwilioSink {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send_reply(&self, message: &InboundMessage, reply: &Reply) -> skillrelay_bridge::Result<()> {
        self.text(&message.author.id, &reply.body).await
    }

    async fn progress(&self, message: &InboundMessage, progress: Progress) -> skillrelay_bridge::Result<()> {
        match progress {
            Progress::Started => self.text(&message.author.id, WORKING_TEXT).await,
            Progress::Elapsed(elapsed) => {
                let mins = elapsed.as_secs() / 60;
                if mins > MAX_PROGRESS_MINUTES {
                    return Ok(());
                }
                self.text(&message.author.id, &format!("Still working... ({mins}m)"))
                    .await
            }
            Progress::Activity(_) | Progress::Finished => Ok(()),
        }
    }

    fn progress_interval(&self) -> Option<Duration> {
        Some(PROGRESS_INTERVAL)
    }

    fn disposition(&self, message: &InboundMessage) -> Disposition {
        if message.text.is_empty() {
            Disposition::Ignore
        } else {
            Disposition::Respond
        }
    }

    fn inbox_record(&self, message: &InboundMessage) -> Value {
        json!({
            "type": "sms",
            "from": message.author.id,
            "to": extra_str(message, "to"),
            "body": message.text,
            "media_urls": message.extra.get("media_urls").cloned().unwrap_or(json!([])),
        })
    }

    fn sent_record(&self, message: &InboundMessage, reply: &Reply) -> Option<Value> {
        Some(json!({
            "type": "sms_sent",
            "from": extra_str(message, "to"),
            "to": message.author.id,
            "body": reply.body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sms_message_reads_twilio_fields() {
        let msg = sms_message(&form(&[
            ("MessageSid", "SM1"),
            ("From", "+15550001"),
            ("To", "+15559999"),
            ("Body", "  hello  "),
            ("NumMedia", "2"),
            ("MediaUrl0", "https://m/0"),
            ("MediaUrl1", "https://m/1"),
        ]));
        assert_eq!(msg.id, "SM1");
        assert_eq!(msg.channel, "+15550001");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.kind, MessageKind::Sms);
        assert_eq!(msg.extra["to"], "+15559999");
        assert_eq!(msg.extra["media_urls"], json!(["https://m/0", "https://m/1"]));
    }

    #[test]
    fn missing_sid_gets_generated_id() {
        let a = sms_message(&form(&[("From", "+1")]));
        let b = sms_message(&form(&[("From", "+1")]));
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.extra["media_urls"], json!([]));
    }

    #[test]
    fn config_requires_credentials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            config::config_path(dir.path()),
            r#"{"account_sid": "AC1", "auth_token": "t"}"#,
        )
        .unwrap();
        let err = TwilioConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("phone_number"));
    }

    #[test]
    fn records_use_twilio_wording() {
        let sink = TwilioSink::new(Arc::new(TwilioClient::new(&TwilioConfig::default())));
        let msg = sms_message(&form(&[("From", "+1"), ("To", "+2"), ("Body", "hi")]));

        let inbound = sink.inbox_record(&msg);
        assert_eq!(inbound["type"], "sms");
        assert_eq!(inbound["from"], "+1");
        assert_eq!(inbound["to"], "+2");

        let sent = sink.sent_record(&msg, &Reply::to(&msg, "yo")).unwrap();
        assert_eq!(sent, json!({ "type": "sms_sent", "from": "+2", "to": "+1", "body": "yo" }));
    }

    #[test]
    fn empty_body_is_ignored() {
        let sink = TwilioSink::new(Arc::new(TwilioClient::new(&TwilioConfig::default())));
        let msg = sms_message(&form(&[("From", "+1")]));
        assert_eq!(sink.disposition(&msg), Disposition::Ignore);
    }

    #[test]
    fn relay_config_for_sms() {
        let config = relay_config(RelayConfig::default());
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.stderr_limit, 200);
        assert_eq!(config.replies.empty, "Done.");
    }
}
