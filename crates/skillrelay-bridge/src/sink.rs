//! Outbound side of a bridge: replies, status markers and progress.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{InboundMessage, Reply};

/// Visible per-message status. Slack renders these as reactions; channels
/// without markers ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Working,
    Done,
    /// Read but deliberately not answered.
    Acknowledged,
    Failed,
    Retrying,
    /// Sender is not on the allow-list.
    Rejected,
}

/// Progress events emitted while a relay runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Started,
    /// Periodic tick, sent every [`ReplySink::progress_interval`].
    Elapsed(Duration),
    /// What the relay appears to be doing right now.
    Activity(String),
    Finished,
}

/// What the bridge should do with an allowed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Respond,
    /// Mark as seen without invoking the relay.
    Acknowledge,
    Ignore,
}

/// Platform-specific delivery.
///
/// Only [`ReplySink::send_reply`] is required; everything else defaults to
/// a no-op so simple channels stay simple. Marker and progress failures are
/// never fatal to the bridge; implementations should log and move on.
#[async_trait]
pub trait ReplySink: Send + Sync {
    fn name(&self) -> &str;

    async fn send_reply(&self, message: &InboundMessage, reply: &Reply) -> Result<()>;

    async fn set_marker(&self, _message: &InboundMessage, _marker: Marker) -> Result<()> {
        Ok(())
    }

    async fn progress(&self, _message: &InboundMessage, _progress: Progress) -> Result<()> {
        Ok(())
    }

    /// How often [`Progress::Elapsed`] fires. `None` disables ticks.
    fn progress_interval(&self) -> Option<Duration> {
        None
    }

    fn disposition(&self, _message: &InboundMessage) -> Disposition {
        Disposition::Respond
    }

    /// Called for senders outside the allow-list.
    async fn reject(&self, _message: &InboundMessage) -> Result<()> {
        Ok(())
    }

    /// The inbox line written for an inbound message.
    fn inbox_record(&self, message: &InboundMessage) -> serde_json::Value {
        serde_json::to_value(message).unwrap_or(serde_json::Value::Null)
    }

    /// The inbox line written after a reply went out, if this channel logs
    /// outbound traffic.
    fn sent_record(&self, _message: &InboundMessage, _reply: &Reply) -> Option<serde_json::Value> {
        None
    }
}

/// `"45s"` or `"2m 5s"`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (mins, secs) = (secs / 60, secs % 60);
    if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_secs(15)), "15s");
        assert_eq!(format_elapsed(Duration::from_secs(60)), "1m 0s");
        assert_eq!(format_elapsed(Duration::from_millis(125_900)), "2m 5s");
    }
}
