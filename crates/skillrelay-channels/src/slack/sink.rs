//! Slack delivery: threaded replies, reaction markers and a self-updating
//! progress message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use skillrelay_bridge::{
    Disposition, InboundMessage, Marker, MessageKind, Progress, Reply, ReplySink, WorkKey,
    format_elapsed,
};

use super::api::SlackClient;
use super::socket::ActiveThreads;

/// Slack rejects messages over 4000 characters.
pub const MAX_MESSAGE_CHARS: usize = 3900;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(15);
pub const PROGRESS_TEXT: &str = "⏳ Working on your request...";

pub const EMOJI_WORKING: &str = "hourglass_flowing_sand";
pub const EMOJI_DONE: &str = "white_check_mark";
pub const EMOJI_ACK: &str = "eyes";
pub const EMOJI_ERROR: &str = "x";
pub const EMOJI_RETRY: &str = "arrows_counterclockwise";
pub const EMOJI_REJECTED: &str = "no_entry";

/// Thread replies that only close the conversation.
const ACK_ONLY: &[&str] = &[
    "thanks", "thank you", "thx", "ty", "cool", "nice", "great", "got it", "perfect", "awesome",
    "ok thanks", "okay thanks", "👍", "🙏", "✅",
];

/// `true` when a thread reply is a sign-off that needs no answer.
pub fn is_acknowledgement(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    let stripped = lower.trim_end_matches(['!', '.']);
    ACK_ONLY.iter().any(|s| lower == *s || stripped == *s)
}

/// Split at `limit` characters, prefixing `(i/n) ` when there is more than
/// one chunk.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return vec![text.to_string()];
    }
    let chunks: Vec<String> = chars
        .chunks(limit.max(1))
        .map(|c| c.iter().collect())
        .collect();
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("({}/{total}) {chunk}", i + 1))
        .collect()
}

/// Where the answer to `message` is posted. Top-level DMs are answered
/// in the conversation, everything else in a thread.
pub fn reply_thread(message: &InboundMessage) -> Option<&str> {
    match message.kind {
        MessageKind::Direct => None,
        MessageKind::ThreadReply => message.thread_id.as_deref(),
        _ => Some(message.reply_thread()),
    }
}

pub struct SlackSink {
    client: Arc<SlackClient>,
    threads: ActiveThreads,
    /// Progress message ts per in-flight work item.
    progress: DashMap<WorkKey, String>,
}

impl SlackSink {
    pub fn new(client: Arc<SlackClient>, threads: ActiveThreads) -> Self {
        Self {
            client,
            threads,
            progress: DashMap::new(),
        }
    }

    async fn react(&self, message: &InboundMessage, add: &[&str], remove: &[&str]) -> skillrelay_bridge::Result<()> {
        for name in remove {
            if let Err(e) = self
                .client
                .remove_reaction(&message.channel, &message.id, name)
                .await
            {
                tracing::warn!(ts = %message.id, reaction = name, error = %e, "failed to remove reaction");
            }
        }
        for name in add {
            self.client
                .add_reaction(&message.channel, &message.id, name)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReplySink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send_reply(&self, message: &InboundMessage, reply: &Reply) -> skillrelay_bridge::Result<()> {
        let thread = reply_thread(message);
        let mut first_ts = None;
        for chunk in split_message(&reply.body, MAX_MESSAGE_CHARS) {
            let ts = self
                .client
                .post_message(&message.channel, &chunk, thread)
                .await?;
            first_ts.get_or_insert(ts);
        }

        // Follow-ups in this thread get answered without a mention.
        match (thread, first_ts) {
            (Some(thread), _) => self.threads.track(thread, &message.channel),
            (None, Some(ts)) => self.threads.track(&ts, &message.channel),
            (None, None) => {}
        }
        Ok(())
    }

    async fn set_marker(&self, message: &InboundMessage, marker: Marker) -> skillrelay_bridge::Result<()> {
        match marker {
            Marker::Working => self.react(message, &[EMOJI_WORKING], &[]).await,
            Marker::Done => {
                self.react(message, &[EMOJI_DONE], &[EMOJI_WORKING, EMOJI_RETRY])
                    .await
            }
            Marker::Acknowledged => self.react(message, &[EMOJI_ACK], &[]).await,
            Marker::Failed => {
                self.react(message, &[EMOJI_ERROR], &[EMOJI_WORKING, EMOJI_RETRY])
                    .await
            }
            Marker::Retrying => self.react(message, &[EMOJI_RETRY], &[]).await,
            Marker::Rejected => self.react(message, &[EMOJI_REJECTED], &[]).await,
        }
    }

    async fn progress(&self, message: &InboundMessage, progress: Progress) -> skillrelay_bridge::Result<()> {
        let key = message.work_key();
        match progress {
            Progress::Started => {
                let ts = self
                    .client
                    .post_message(&message.channel, PROGRESS_TEXT, reply_thread(message))
                    .await?;
                self.progress.insert(key, ts);
            }
            Progress::Elapsed(elapsed) => {
                let Some(ts) = self.progress.get(&key).map(|e| e.value().clone()) else {
                    return Ok(());
                };
                let text = format!("{PROGRESS_TEXT} ({})", format_elapsed(elapsed));
                self.client
                    .update_message(&message.channel, &ts, &text)
                    .await?;
            }
            Progress::Finished => {
                if let Some((_, ts)) = self.progress.remove(&key) {
                    self.client.delete_message(&message.channel, &ts).await?;
                }
            }
            Progress::Activity(_) => {}
        }
        Ok(())
    }

    fn progress_interval(&self) -> Option<Duration> {
        Some(PROGRESS_INTERVAL)
    }

    fn disposition(&self, message: &InboundMessage) -> Disposition {
        match message.kind {
            MessageKind::Mention if message.text.trim().is_empty() => Disposition::Ignore,
            MessageKind::ThreadReply if is_acknowledgement(&message.text) => Disposition::Acknowledge,
            _ => Disposition::Respond,
        }
    }

    /// Only mentions are visibly refused; DMs from strangers get silence.
    async fn reject(&self, message: &InboundMessage) -> skillrelay_bridge::Result<()> {
        if message.kind == MessageKind::Mention {
            self.set_marker(message, Marker::Rejected).await?;
        }
        Ok(())
    }

    fn inbox_record(&self, message: &InboundMessage) -> Value {
        let kind = match message.kind {
            MessageKind::Direct => "dm",
            MessageKind::ThreadReply => "thread_reply",
            _ => "mention",
        };
        let channel_name = message
            .extra
            .get("channel_name")
            .cloned()
            .unwrap_or_else(|| Value::String(message.channel.clone()));
        json!({
            "type": kind,
            "channel_id": message.channel,
            "channel": channel_name,
            "user_id": message.author.id,
            "user": message.author.name,
            "text": message.text,
            "ts": message.id,
            "thread_ts": message.thread_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skillrelay_bridge::Author;

    fn message(kind: MessageKind, thread: Option<&str>) -> InboundMessage {
        InboundMessage {
            id: "111.1".to_string(),
            channel: "C1".to_string(),
            author: Author {
                id: "U1".to_string(),
                name: "Ada".to_string(),
            },
            text: "hello".to_string(),
            timestamp: Utc::now(),
            thread_id: thread.map(str::to_string),
            kind,
            is_admin: false,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn acknowledgements() {
        for text in ["thanks", "Thanks!", "got it.", "  👍 ", "OK thanks!!"] {
            assert!(is_acknowledgement(text), "{text}");
        }
        for text in ["thanks, now do X", "yes", "ok", "do it"] {
            assert!(!is_acknowledgement(text), "{text}");
        }
    }

    #[test]
    fn short_message_is_one_chunk_without_prefix() {
        assert_eq!(split_message("hi", 10), ["hi"]);
    }

    #[test]
    fn long_message_is_numbered() {
        let chunks = split_message("abcdefghij", 4);
        assert_eq!(chunks, ["(1/3) abcd", "(2/3) efgh", "(3/3) ij"]);
    }

    #[test]
    fn split_respects_multibyte_chars() {
        let chunks = split_message("ééé", 2);
        assert_eq!(chunks, ["(1/2) éé", "(2/2) é"]);
    }

    #[test]
    fn reply_thread_rules() {
        assert_eq!(reply_thread(&message(MessageKind::Direct, None)), None);
        assert_eq!(reply_thread(&message(MessageKind::Mention, None)), Some("111.1"));
        assert_eq!(reply_thread(&message(MessageKind::Mention, Some("100.0"))), Some("100.0"));
        assert_eq!(reply_thread(&message(MessageKind::ThreadReply, Some("100.0"))), Some("100.0"));
    }

    #[test]
    fn disposition_rules() {
        let sink = SlackSink::new(Arc::new(SlackClient::new("xoxb")), ActiveThreads::new());

        let mut mention = message(MessageKind::Mention, None);
        mention.text = "   ".to_string();
        assert_eq!(sink.disposition(&mention), Disposition::Ignore);

        let mut thanks = message(MessageKind::ThreadReply, Some("100.0"));
        thanks.text = "thanks!".to_string();
        assert_eq!(sink.disposition(&thanks), Disposition::Acknowledge);

        // Sign-offs only count inside threads.
        let mut dm = message(MessageKind::Direct, None);
        dm.text = "thanks".to_string();
        assert_eq!(sink.disposition(&dm), Disposition::Respond);
    }

    #[test]
    fn inbox_record_shape() {
        let sink = SlackSink::new(Arc::new(SlackClient::new("xoxb")), ActiveThreads::new());
        let mut msg = message(MessageKind::ThreadReply, Some("100.0"));
        msg.extra
            .insert("channel_name".to_string(), json!("#general"));
        let record = sink.inbox_record(&msg);
        assert_eq!(record["type"], "thread_reply");
        assert_eq!(record["channel"], "#general");
        assert_eq!(record["channel_id"], "C1");
        assert_eq!(record["ts"], "111.1");
        assert_eq!(record["thread_ts"], "100.0");
    }
}
