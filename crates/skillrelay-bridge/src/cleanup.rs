//! Stuck-work sweeper.
//!
//! ```text
//! WORKING --timeout--> RETRYING --relay ok--> done
//!                          |
//!                          +--timeout again--> FAILED (apology, entry removed)
//! ```
//!
//! A retry runs inline within the sweep. A relay error during the retry
//! leaves the item in RETRYING so the next sweep gives up on it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bridge::Bridge;
use crate::model::InboundMessage;
use crate::shutdown::Shutdown;
use crate::sink::Marker;
use crate::tracker::MarkOutcome;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    /// Retries that produced an answer.
    pub recovered: usize,
    /// Retries that failed again and will be given up on next time.
    pub retry_failed: usize,
    /// Items abandoned with an apology.
    pub failed: usize,
}

impl Bridge {
    /// Check every item against the work timeout once.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout = chrono::Duration::from_std(self.config().work_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let stuck = self.tracker().stuck(now, timeout);
        let mut report = SweepReport {
            checked: stuck.len(),
            ..SweepReport::default()
        };

        for work in stuck {
            let key = work.key();
            if work.is_retrying() {
                if self.give_up(&work.message).await {
                    report.failed += 1;
                }
                continue;
            }

            let Some(work) = self.tracker().begin_retry(&key, now) else {
                continue;
            };
            tracing::info!(key = %key, text = %preview(&work.message.text), "retrying stuck work");
            self.mark(&work.message, Marker::Retrying).await;

            let (request, session_key) = self.request_for(&work.message);
            match self.relay().run(request, None).await {
                Ok(text) => {
                    if let Some(session_key) = session_key {
                        self.sessions().activate(&session_key);
                    }
                    if self.complete(&work.message, text, Marker::Done).await {
                        tracing::info!(key = %key, "retry succeeded");
                        report.recovered += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "retry failed, will give up next sweep");
                    report.retry_failed += 1;
                }
            }
        }

        if report.checked > 0 {
            tracing::info!(
                checked = report.checked,
                recovered = report.recovered,
                retry_failed = report.retry_failed,
                failed = report.failed,
                "sweep finished"
            );
        }
        report
    }

    /// Claim the item and post the apology. Returns whether we claimed it.
    async fn give_up(&self, message: &InboundMessage) -> bool {
        let apology = self.config().failure_apology.clone();
        let claimed = self.complete(message, apology, Marker::Failed).await;
        if claimed {
            tracing::warn!(key = %message.work_key(), text = %preview(&message.text), "giving up on stuck work after retry");
        }
        claimed
    }

    /// Re-run a message recovered out of band (for example from a marker
    /// left on the platform by a crashed process). Skips messages that are
    /// already tracked. Returns whether an answer was delivered.
    pub async fn replay(&self, message: &InboundMessage) -> bool {
        if self.tracker().mark_started(message, Utc::now()) == MarkOutcome::AlreadyTracked {
            tracing::debug!(key = %message.work_key(), "replay skipped, already in progress");
            return false;
        }
        self.mark(message, Marker::Retrying).await;

        let (request, session_key) = self.request_for(message);
        let (body, marker) = match self.relay().run(request, None).await {
            Ok(text) => {
                if let Some(session_key) = session_key {
                    self.sessions().activate(&session_key);
                }
                (text, Marker::Done)
            }
            Err(e) => {
                tracing::warn!(key = %message.work_key(), error = %e, "replay failed");
                (self.relay().failure_reply(&e), Marker::Failed)
            }
        };
        let delivered = marker == Marker::Done;
        self.complete(message, body, marker).await && delivered
    }

    /// Sweep every `cleanup_interval` until `shutdown` fires.
    pub async fn run_sweeper(&self, shutdown: Shutdown) {
        tracing::debug!(interval_secs = self.config().cleanup_interval.as_secs(), "sweeper started");
        while !shutdown.sleep(self.config().cleanup_interval).await {
            self.sweep_once(Utc::now()).await;
        }
        tracing::debug!("sweeper stopped");
    }
}

fn preview(text: &str) -> &str {
    crate::relay::truncate_chars(text, 50)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::error::Result;
    use crate::model::{Author, MessageKind, Reply};
    use crate::prompt::PreamblePrompt;
    use crate::relay::{ActivityCallback, Relay, RelayError, RelayRequest};
    use crate::sink::ReplySink;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct Fixed(std::result::Result<String, RelayError>);

    #[async_trait]
    impl Relay for Fixed {
        async fn run(
            &self,
            _request: RelayRequest,
            _on_activity: Option<ActivityCallback>,
        ) -> std::result::Result<String, RelayError> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct Recorder {
        replies: Mutex<Vec<String>>,
        markers: Mutex<Vec<Marker>>,
    }

    #[async_trait]
    impl ReplySink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send_reply(&self, _message: &InboundMessage, reply: &Reply) -> Result<()> {
            self.replies.lock().unwrap().push(reply.body.clone());
            Ok(())
        }

        async fn set_marker(&self, _message: &InboundMessage, marker: Marker) -> Result<()> {
            self.markers.lock().unwrap().push(marker);
            Ok(())
        }
    }

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            channel: "C1".to_string(),
            author: Author {
                id: "U1".to_string(),
                name: "Ada".to_string(),
            },
            text: "long job".to_string(),
            timestamp: Utc::now(),
            thread_id: None,
            kind: MessageKind::Mention,
            is_admin: false,
            extra: serde_json::Map::new(),
        }
    }

    fn bridge(dir: &std::path::Path, relay: Fixed) -> (Bridge, Arc<Recorder>) {
        let sink = Arc::new(Recorder::default());
        let bridge = Bridge::new(
            BridgeConfig::new("test", dir),
            Arc::new(relay),
            sink.clone(),
            Arc::new(PreamblePrompt::new("P")),
        )
        .unwrap();
        (bridge, sink)
    }

    #[tokio::test]
    async fn fresh_items_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge(dir.path(), Fixed(Ok("ok".into())));
        let t0 = Utc::now();
        bridge.tracker().mark_started(&message("1"), t0);

        let report = bridge.sweep_once(t0 + chrono::Duration::seconds(10)).await;
        assert_eq!(report, SweepReport::default());
        assert!(sink.replies.lock().unwrap().is_empty());
        assert_eq!(bridge.tracker().len(), 1);
    }

    #[tokio::test]
    async fn retry_success_completes_item() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge(dir.path(), Fixed(Ok("late answer".into())));
        let t0 = Utc::now();
        bridge.tracker().mark_started(&message("1"), t0);

        let report = bridge.sweep_once(t0 + chrono::Duration::seconds(301)).await;
        assert_eq!(report.recovered, 1);
        assert_eq!(*sink.replies.lock().unwrap(), ["late answer"]);
        assert_eq!(*sink.markers.lock().unwrap(), [Marker::Retrying, Marker::Done]);
        assert!(bridge.tracker().is_empty());
    }

    #[tokio::test]
    async fn second_timeout_gives_up_once() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge(
            dir.path(),
            Fixed(Err(RelayError::Failed {
                reason: "crashed".into(),
            })),
        );
        let t0 = Utc::now();
        bridge.tracker().mark_started(&message("1"), t0);

        let t1 = t0 + chrono::Duration::seconds(301);
        let first = bridge.sweep_once(t1).await;
        assert_eq!(first.retry_failed, 1);
        assert_eq!(bridge.tracker().retrying(), 1);
        assert!(sink.replies.lock().unwrap().is_empty());

        // Not yet timed out again.
        let early = bridge.sweep_once(t1 + chrono::Duration::seconds(100)).await;
        assert_eq!(early.checked, 0);

        let second = bridge.sweep_once(t1 + chrono::Duration::seconds(301)).await;
        assert_eq!(second.failed, 1);
        assert_eq!(*sink.replies.lock().unwrap(), [DEFAULT_APOLOGY]);
        assert_eq!(sink.markers.lock().unwrap().last(), Some(&Marker::Failed));
        assert!(bridge.tracker().is_empty());

        let third = bridge.sweep_once(t1 + chrono::Duration::seconds(1000)).await;
        assert_eq!(third.checked, 0);
        assert_eq!(sink.replies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_delivers_and_marks() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge(dir.path(), Fixed(Ok("recovered".into())));

        assert!(bridge.replay(&message("9")).await);
        assert_eq!(*sink.replies.lock().unwrap(), ["recovered"]);
        assert_eq!(*sink.markers.lock().unwrap(), [Marker::Retrying, Marker::Done]);
        assert!(bridge.tracker().is_empty());
    }

    #[tokio::test]
    async fn replay_skips_tracked_work() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge(dir.path(), Fixed(Ok("x".into())));
        bridge.tracker().mark_started(&message("9"), Utc::now());

        assert!(!bridge.replay(&message("9")).await);
        assert!(sink.replies.lock().unwrap().is_empty());
    }

    const DEFAULT_APOLOGY: &str = crate::bridge::DEFAULT_FAILURE_APOLOGY;
}
