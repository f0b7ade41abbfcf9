//! Socket Mode: receive Events API payloads over a WebSocket and turn the
//! ones addressed to the bot into [`InboundMessage`]s.
//!
//! Every envelope is acknowledged before it is routed. Only three kinds of
//! event reach the bridge: direct messages, @-mentions and replies in a
//! thread the bot has already posted to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use skillrelay_bridge::{Author, InboundMessage, MessageKind, Shutdown};

use super::api::SlackClient;
use crate::error::{ChannelError, Result};

/// Pause before reconnecting after a dropped socket.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Active threads
// ---------------------------------------------------------------------------

/// Threads the bot has posted in, keyed by thread `ts`. Replies in these
/// threads are answered without a mention.
#[derive(Debug, Clone, Default)]
pub struct ActiveThreads {
    inner: Arc<DashMap<String, String>>,
}

impl ActiveThreads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, thread_ts: &str, channel: &str) {
        self.inner.insert(thread_ts.to_string(), channel.to_string());
    }

    pub fn contains(&self, thread_ts: &str) -> bool {
        self.inner.contains_key(thread_ts)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// An event worth answering, before names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    pub kind: MessageKind,
    pub channel: String,
    pub user: String,
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
}

/// Decide whether an Events API `event` is for us.
pub fn route_event(event: &Value, threads: &ActiveThreads) -> Option<RoutedEvent> {
    let field = |key: &str| event.get(key).and_then(Value::as_str).map(str::to_string);
    let channel = field("channel")?;
    let user = field("user")?;
    let ts = field("ts")?;
    let thread_ts = field("thread_ts");
    let text = field("text").unwrap_or_default();

    match event.get("type").and_then(Value::as_str)? {
        "message" => {
            if event.get("subtype").is_some() || event.get("bot_id").is_some() {
                return None;
            }
            let kind = if thread_ts.as_deref().is_some_and(|t| threads.contains(t)) {
                MessageKind::ThreadReply
            } else if channel.starts_with('D') {
                MessageKind::Direct
            } else {
                // Channel chatter; mentions arrive separately as app_mention.
                return None;
            };
            Some(RoutedEvent {
                kind,
                channel,
                user,
                text,
                ts,
                thread_ts,
            })
        }
        "app_mention" => Some(RoutedEvent {
            kind: MessageKind::Mention,
            channel,
            user,
            text: strip_mention(&text),
            ts,
            thread_ts,
        }),
        _ => None,
    }
}

/// Drop the leading `<@U123>` from a mention.
pub fn strip_mention(text: &str) -> String {
    match text.split_once('>') {
        Some((_, rest)) => rest.trim().to_string(),
        None => text.to_string(),
    }
}

/// Slack `ts` values are `"<unix seconds>.<micros>"`.
fn ts_to_datetime(ts: &str) -> DateTime<Utc> {
    let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs = secs.parse::<i64>().unwrap_or_default();
    let micros = micros.parse::<u32>().unwrap_or_default();
    DateTime::from_timestamp(secs, micros.saturating_mul(1000)).unwrap_or_else(Utc::now)
}

/// Resolve display names and build the bridge message. Lookups that fail
/// fall back to raw ids.
pub async fn resolve(event: RoutedEvent, client: &SlackClient) -> InboundMessage {
    let user_name = match client.user_name(&event.user).await {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(user = %event.user, error = %e, "user lookup failed");
            event.user.clone()
        }
    };
    let channel_name = if event.kind == MessageKind::Direct {
        format!("DM:{user_name}")
    } else {
        client
            .channel_name(&event.channel)
            .await
            .unwrap_or_else(|_| event.channel.clone())
    };

    let mut extra = serde_json::Map::new();
    extra.insert("channel_name".to_string(), Value::String(channel_name));
    InboundMessage {
        timestamp: ts_to_datetime(&event.ts),
        id: event.ts,
        channel: event.channel,
        author: Author {
            id: event.user,
            name: user_name,
        },
        text: event.text,
        thread_id: event.thread_ts,
        kind: event.kind,
        is_admin: false,
        extra,
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// Slack asked us to reconnect, or the socket dropped.
    Reconnect,
    Shutdown,
}

/// Owns the Socket Mode connection and feeds a bridge's push queue.
pub struct SocketModeListener {
    client: Arc<SlackClient>,
    app_token: String,
    threads: ActiveThreads,
    tx: mpsc::Sender<InboundMessage>,
    reconnect_delay: Duration,
}

impl SocketModeListener {
    pub fn new(
        client: Arc<SlackClient>,
        app_token: impl Into<String>,
        threads: ActiveThreads,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Self {
        Self {
            client,
            app_token: app_token.into(),
            threads,
            tx,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Connect and keep reconnecting until `shutdown` fires or the bridge
    /// stops reading. Dropping `self` closes the push queue.
    pub async fn run(self, shutdown: Shutdown) {
        loop {
            match self.session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reconnect) => {
                    tracing::info!("socket mode reconnecting");
                }
                Err(e) => {
                    tracing::warn!(error = %e, delay_secs = self.reconnect_delay.as_secs(), "socket mode error");
                }
            }
            if self.tx.is_closed() || shutdown.sleep(self.reconnect_delay).await {
                break;
            }
        }
        tracing::info!("socket mode listener stopped");
    }

    async fn session(&self, shutdown: &Shutdown) -> Result<SessionEnd> {
        let url = self.client.open_socket(&self.app_token).await?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::WebSocket {
                reason: e.to_string(),
            })?;
        tracing::info!("socket mode connected");
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "failed to send close frame");
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                frame = stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Reconnect),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ChannelError::WebSocket {
                        reason: e.to_string(),
                    });
                }
            };

            let envelope: Value = match serde_json::from_str(text.as_str()) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable socket frame");
                    continue;
                }
            };

            if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                let ack = json!({ "envelope_id": envelope_id }).to_string();
                sink.send(Message::Text(ack.into()))
                    .await
                    .map_err(|e| ChannelError::WebSocket {
                        reason: e.to_string(),
                    })?;
            }

            match envelope.get("type").and_then(Value::as_str) {
                Some("hello") => tracing::debug!("socket mode hello"),
                Some("disconnect") => {
                    let reason = envelope.get("reason").and_then(Value::as_str).unwrap_or("");
                    tracing::info!(reason, "socket mode disconnect requested");
                    return Ok(SessionEnd::Reconnect);
                }
                Some("events_api") => {
                    let Some(event) = envelope.pointer("/payload/event") else {
                        continue;
                    };
                    let Some(routed) = route_event(event, &self.threads) else {
                        continue;
                    };
                    let message = resolve(routed, &self.client).await;
                    if self.tx.send(message).await.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ => {}
            }
        }
    }
}
