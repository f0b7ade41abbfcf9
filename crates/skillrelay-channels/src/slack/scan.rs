//! Orphaned-marker recovery.
//!
//! A bridge that dies mid-answer leaves an hourglass on the message and
//! nothing in memory. The scan walks the tail of the inbox, asks Slack which
//! of those messages still carry our hourglass without a done or error
//! reaction, and replays them.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use skillrelay_bridge::{Author, Bridge, InboundMessage, MessageKind};

use super::api::{Reaction, SlackClient};
use super::sink::{EMOJI_DONE, EMOJI_ERROR, EMOJI_WORKING};
use crate::error::Result;

/// How far back in the inbox the scan looks.
pub const SCAN_DEPTH: usize = 50;

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub checked: usize,
    pub orphaned: usize,
    pub recovered: usize,
    pub failed: usize,
}

/// Our hourglass is present and nobody finished the message.
pub fn is_orphaned(reactions: &[Reaction], bot_user_id: &str) -> bool {
    let mut ours = false;
    for reaction in reactions {
        match reaction.name.as_str() {
            EMOJI_WORKING if reaction.users.iter().any(|u| u == bot_user_id) => ours = true,
            EMOJI_DONE | EMOJI_ERROR => return false,
            _ => {}
        }
    }
    ours
}

/// Rebuild a message from a Slack inbox line.
pub fn message_from_record(record: &Value) -> Option<InboundMessage> {
    let field = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);
    let channel = field("channel_id")?;
    let ts = field("ts")?;
    let user_id = field("user_id").unwrap_or_else(|| "unknown".to_string());
    let kind = match record.get("type").and_then(Value::as_str) {
        Some("dm") => MessageKind::Direct,
        Some("thread_reply") => MessageKind::ThreadReply,
        _ => MessageKind::Mention,
    };
    Some(InboundMessage {
        id: ts,
        channel,
        author: Author {
            name: field("user").unwrap_or_else(|| user_id.clone()),
            id: user_id,
        },
        text: field("text").unwrap_or_default(),
        timestamp: Utc::now(),
        thread_id: field("thread_ts"),
        kind,
        is_admin: false,
        extra: serde_json::Map::new(),
    })
}

/// Find orphaned messages in the last [`SCAN_DEPTH`] inbox entries and
/// replay each through `bridge`.
pub async fn scan_orphans(bridge: &Bridge, client: &SlackClient) -> Result<ScanReport> {
    let bot_user_id = client.auth_test().await?;
    tracing::info!(bot_user_id = %bot_user_id, "scanning for orphaned markers");

    let page = bridge.inbox().recent(SCAN_DEPTH)?;
    let mut report = ScanReport {
        checked: page.messages.len(),
        ..ScanReport::default()
    };

    let mut orphans = Vec::new();
    for record in &page.messages {
        let Some(message) = message_from_record(record) else {
            continue;
        };
        match client.reactions(&message.channel, &message.id).await {
            Ok(reactions) if is_orphaned(&reactions, &bot_user_id) => {
                tracing::info!(channel = %message.channel, ts = %message.id, "found orphaned message");
                orphans.push(message);
            }
            Ok(_) => {}
            // Deleted, or no longer visible to the bot.
            Err(e) => tracing::debug!(ts = %message.id, error = %e, "reactions lookup failed"),
        }
    }
    report.orphaned = orphans.len();

    for message in orphans {
        if bridge.replay(&message).await {
            report.recovered += 1;
        } else {
            report.failed += 1;
        }
    }
    tracing::info!(
        checked = report.checked,
        orphaned = report.orphaned,
        recovered = report.recovered,
        "scan finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reaction(name: &str, users: &[&str]) -> Reaction {
        Reaction {
            name: name.to_string(),
            users: users.iter().map(|u| u.to_string()).collect(),
            count: users.len() as u32,
        }
    }

    #[test]
    fn orphan_needs_our_hourglass() {
        assert!(is_orphaned(&[reaction(EMOJI_WORKING, &["UBOT"])], "UBOT"));
        assert!(!is_orphaned(&[reaction(EMOJI_WORKING, &["U1"])], "UBOT"));
        assert!(!is_orphaned(&[], "UBOT"));
    }

    #[test]
    fn finished_messages_are_not_orphans() {
        let done = [reaction(EMOJI_WORKING, &["UBOT"]), reaction(EMOJI_DONE, &["UBOT"])];
        assert!(!is_orphaned(&done, "UBOT"));
        let failed = [reaction(EMOJI_ERROR, &["UBOT"]), reaction(EMOJI_WORKING, &["UBOT"])];
        assert!(!is_orphaned(&failed, "UBOT"));
    }

    #[test]
    fn record_round_trips_to_message() {
        let record = json!({
            "type": "mention", "channel_id": "C1", "channel": "#general",
            "user_id": "U1", "user": "Ada", "text": "do it", "ts": "5.5", "thread_ts": null
        });
        let msg = message_from_record(&record).unwrap();
        assert_eq!(msg.kind, MessageKind::Mention);
        assert_eq!(msg.id, "5.5");
        assert_eq!(msg.author.name, "Ada");
        assert_eq!(msg.thread_id, None);
    }

    #[test]
    fn record_without_ts_is_skipped() {
        assert!(message_from_record(&json!({ "channel_id": "C1" })).is_none());
    }
}
