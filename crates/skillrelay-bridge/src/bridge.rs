//! The bridge context and its dispatch loop.
//!
//! A [`Bridge`] owns everything one running bridge needs: the pending-work
//! tracker, session affinity, the relay, the outbound sink and the inbox
//! log. Nothing is global, so tests can run several bridges side by side.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::Result;
use crate::inbox::{INBOX_FILE_NAME, InboxLog};
use crate::lifecycle::{BridgeState, PID_FILE_NAME, PidFile, StateCell};
use crate::model::{InboundMessage, Reply};
use crate::prompt::PromptBuilder;
use crate::relay::{ActivityCallback, Relay, RelayError, RelayRequest};
use crate::sessions::SessionRegistry;
use crate::shutdown::Shutdown;
use crate::sink::{Disposition, Marker, Progress, ReplySink};
use crate::source::EventSource;
use crate::tracker::{MarkOutcome, PENDING_WORK_FILE_NAME, WorkTracker};

/// Default time a work item may run before the sweeper steps in.
pub const DEFAULT_WORK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default spacing between sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Default number of messages relayed at the same time.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

pub const DEFAULT_FAILURE_APOLOGY: &str =
    "Sorry, that request failed after retrying. Please try again later.";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Short name used in logs (`crm`, `slack`, `twilio`).
    pub name: String,
    /// Directory holding the PID file, inbox and pending-work mirror.
    pub dir: PathBuf,
    /// When false, messages are only logged to the inbox.
    pub auto_respond: bool,
    pub work_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Run the stuck-work sweeper alongside the dispatch loop.
    pub retry_enabled: bool,
    /// Author ids allowed to trigger the relay. Empty allows everyone.
    pub allowed_senders: Vec<String>,
    pub failure_apology: String,
    /// Messages handled at once. `1` keeps strict arrival order.
    pub max_concurrent: usize,
}

impl BridgeConfig {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            auto_respond: true,
            work_timeout: DEFAULT_WORK_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            retry_enabled: false,
            allowed_senders: Vec::new(),
            failure_apology: DEFAULT_FAILURE_APOLOGY.to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE_NAME)
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.dir.join(INBOX_FILE_NAME)
    }

    pub fn pending_work_path(&self) -> PathBuf {
        self.dir.join(PENDING_WORK_FILE_NAME)
    }

    pub fn is_allowed(&self, sender: &str) -> bool {
        self.allowed_senders.is_empty() || self.allowed_senders.iter().any(|s| s == sender)
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge {
    config: BridgeConfig,
    tracker: WorkTracker,
    sessions: SessionRegistry,
    relay: Arc<dyn Relay>,
    sink: Arc<dyn ReplySink>,
    prompts: Arc<dyn PromptBuilder>,
    inbox: InboxLog,
    state: StateCell,
}

impl Bridge {
    /// Build a bridge, loading any pending work left in `config.dir`.
    pub fn new(
        config: BridgeConfig,
        relay: Arc<dyn Relay>,
        sink: Arc<dyn ReplySink>,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Result<Self> {
        let tracker = WorkTracker::load(config.pending_work_path())?;
        let inbox = InboxLog::new(config.inbox_path());
        Ok(Self {
            config,
            tracker,
            sessions: SessionRegistry::new(),
            relay,
            sink,
            prompts,
            inbox,
            state: StateCell::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn tracker(&self) -> &WorkTracker {
        &self.tracker
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn inbox(&self) -> &InboxLog {
        &self.inbox
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    pub(crate) fn relay(&self) -> &dyn Relay {
        self.relay.as_ref()
    }

    pub(crate) fn sink(&self) -> &dyn ReplySink {
        self.sink.as_ref()
    }

    /// Run until `shutdown` fires or `source` is exhausted.
    ///
    /// Claims the PID file first; a second instance for the same directory
    /// fails with [`BridgeError::AlreadyRunning`](crate::BridgeError).
    /// Each message is handled on its own task, at most
    /// `max_concurrent` at a time; in-flight messages are drained before
    /// stopping.
    pub async fn run<S: EventSource>(self: Arc<Self>, mut source: S, shutdown: Shutdown) -> Result<()> {
        self.state.set(BridgeState::Starting);
        let pid_file = match PidFile::acquire(self.config.pid_path()) {
            Ok(pid_file) => pid_file,
            Err(e) => {
                self.state.set(BridgeState::Stopped);
                return Err(e);
            }
        };
        tracing::info!(
            bridge = %self.config.name,
            pid = pid_file.pid(),
            dir = %self.config.dir.display(),
            auto_respond = self.config.auto_respond,
            pending = self.tracker.len(),
            "bridge started"
        );

        let sweeper = (self.config.retry_enabled && self.config.auto_respond).then(|| {
            let bridge = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bridge.run_sweeper(shutdown).await })
        });

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        self.state.set(BridgeState::Listening);
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = source.next_batch() => next,
            };

            match next {
                Ok(Some(batch)) => {
                    self.state.set(BridgeState::Processing);
                    tracing::debug!(count = batch.len(), "processing batch");
                    for message in batch {
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                            break;
                        };
                        let bridge = Arc::clone(&self);
                        tasks.spawn(async move {
                            bridge.handle(message).await;
                            drop(permit);
                        });
                    }
                    while let Some(joined) = tasks.try_join_next() {
                        log_join(joined);
                    }
                    self.state.set(BridgeState::Listening);
                }
                Ok(None) => {
                    tracing::info!(bridge = %self.config.name, "event source closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(bridge = %self.config.name, error = %e, "event source failed");
                    if shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                }
            }
        }

        self.state.set(BridgeState::Stopping);
        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "waiting for in-flight messages");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        shutdown.trigger();
        if let Some(handle) = sweeper
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "sweeper task ended abnormally");
        }
        drop(pid_file);
        self.state.set(BridgeState::Stopped);
        tracing::info!(bridge = %self.config.name, "bridge stopped");
        Ok(())
    }

    /// Process one inbound message end to end. Never fails: per-message
    /// problems become replies or log lines.
    pub async fn handle(&self, message: InboundMessage) {
        let record = self.sink.inbox_record(&message);
        if !record.is_null()
            && let Err(e) = self.inbox.append(&record)
        {
            tracing::warn!(error = %e, "failed to write inbox");
        }

        tracing::info!(
            bridge = %self.config.name,
            channel = %message.channel,
            id = %message.id,
            author = %message.author.name,
            kind = ?message.kind,
            "message received"
        );

        if !self.config.auto_respond {
            return;
        }

        if !self.config.is_allowed(&message.author.id) {
            tracing::info!(author = %message.author.id, "sender not allowed, ignoring");
            if let Err(e) = self.sink.reject(&message).await {
                tracing::warn!(error = %e, "failed to mark rejected message");
            }
            return;
        }

        match self.sink.disposition(&message) {
            Disposition::Respond => {}
            Disposition::Acknowledge => {
                tracing::debug!(id = %message.id, "acknowledging without response");
                self.mark(&message, Marker::Acknowledged).await;
                return;
            }
            Disposition::Ignore => return,
        }

        if self.tracker.mark_started(&message, Utc::now()) == MarkOutcome::AlreadyTracked {
            tracing::debug!(key = %message.work_key(), "already in progress, skipping duplicate");
            return;
        }

        self.mark(&message, Marker::Working).await;
        self.notify(&message, Progress::Started).await;
        let outcome = self.relay_with_progress(&message).await;
        self.notify(&message, Progress::Finished).await;

        let (body, marker) = match outcome {
            Ok(text) => (text, Marker::Done),
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "relay failed");
                (self.relay.failure_reply(&e), Marker::Failed)
            }
        };
        self.complete(&message, body, marker).await;
    }

    /// Build the relay request, consulting and updating session affinity.
    pub(crate) fn request_for(&self, message: &InboundMessage) -> (RelayRequest, Option<String>) {
        if !self.prompts.uses_sessions() {
            let request = RelayRequest {
                prompt: self.prompts.build(message, false),
                continue_session: false,
            };
            return (request, None);
        }
        let key = self.prompts.session_key(message);
        let continuing = self.sessions.is_active(&key);
        let request = RelayRequest {
            prompt: self.prompts.build(message, continuing),
            continue_session: continuing,
        };
        (request, Some(key))
    }

    /// Run the relay, emitting elapsed-time ticks and activity updates.
    async fn relay_with_progress(&self, message: &InboundMessage) -> std::result::Result<String, RelayError> {
        let (request, session_key) = self.request_for(message);
        let relay = self.relay.run(request, Some(self.activity_callback(message)));
        tokio::pin!(relay);

        let outcome = match self.sink.progress_interval() {
            None => relay.await,
            Some(every) => {
                let started = Instant::now();
                let mut ticker = tokio::time::interval_at(started + every, every);
                loop {
                    tokio::select! {
                        outcome = &mut relay => break outcome,
                        _ = ticker.tick() => {
                            self.notify(message, Progress::Elapsed(started.elapsed())).await;
                        }
                    }
                }
            }
        };

        if outcome.is_ok()
            && let Some(key) = session_key
        {
            self.sessions.activate(&key);
        }
        outcome
    }

    fn activity_callback(&self, message: &InboundMessage) -> ActivityCallback {
        let sink = Arc::clone(&self.sink);
        let message = message.clone();
        Arc::new(move |activity: String| {
            let sink = Arc::clone(&sink);
            let message = message.clone();
            Box::pin(async move {
                if let Err(e) = sink.progress(&message, Progress::Activity(activity)).await {
                    tracing::debug!(error = %e, "failed to report activity");
                }
            })
        })
    }

    /// Claim the work item and, if the claim succeeds, deliver `body` and
    /// apply `marker`. Returns whether this caller delivered.
    pub(crate) async fn complete(&self, message: &InboundMessage, body: String, marker: Marker) -> bool {
        if self.tracker.finish(&message.work_key()).is_none() {
            tracing::info!(key = %message.work_key(), "work already completed elsewhere, dropping reply");
            return false;
        }

        let reply = Reply::to(message, body);
        match self.sink.send_reply(message, &reply).await {
            Ok(()) => {
                if let Some(record) = self.sink.sent_record(message, &reply)
                    && let Err(e) = self.inbox.append(&record)
                {
                    tracing::warn!(error = %e, "failed to write inbox");
                }
            }
            Err(e) => {
                tracing::error!(id = %message.id, error = %e, "failed to send reply");
            }
        }
        self.mark(message, marker).await;
        true
    }

    pub(crate) async fn mark(&self, message: &InboundMessage, marker: Marker) {
        if let Err(e) = self.sink.set_marker(message, marker).await {
            tracing::warn!(id = %message.id, marker = ?marker, error = %e, "failed to set marker");
        }
    }

    async fn notify(&self, message: &InboundMessage, progress: Progress) {
        if let Err(e) = self.sink.progress(message, progress).await {
            tracing::debug!(id = %message.id, error = %e, "failed to report progress");
        }
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "message task ended abnormally");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Author, MessageKind};
    use crate::prompt::PreamblePrompt;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn message(id: &str, author: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            channel: "D1".to_string(),
            author: Author {
                id: author.to_string(),
                name: author.to_string(),
            },
            text: "what time is it".to_string(),
            timestamp: Utc::now(),
            thread_id: None,
            kind: MessageKind::Direct,
            is_admin: false,
            extra: serde_json::Map::new(),
        }
    }

    struct Echo {
        requests: Mutex<Vec<RelayRequest>>,
    }

    #[async_trait]
    impl Relay for Echo {
        async fn run(
            &self,
            request: RelayRequest,
            _on_activity: Option<ActivityCallback>,
        ) -> std::result::Result<String, RelayError> {
            self.requests.lock().unwrap().push(request.clone());
            if request.prompt.contains("fail") {
                return Err(RelayError::Timeout { secs: 300 });
            }
            Ok(format!("echo: {}", request.prompt))
        }
    }

    #[derive(Default)]
    struct Recorder {
        replies: Mutex<Vec<Reply>>,
        markers: Mutex<Vec<Marker>>,
        rejected: Mutex<usize>,
    }

    #[async_trait]
    impl ReplySink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send_reply(&self, _message: &InboundMessage, reply: &Reply) -> Result<()> {
            self.replies.lock().unwrap().push(reply.clone());
            Ok(())
        }

        async fn set_marker(&self, _message: &InboundMessage, marker: Marker) -> Result<()> {
            self.markers.lock().unwrap().push(marker);
            Ok(())
        }

        fn disposition(&self, message: &InboundMessage) -> Disposition {
            if message.text == "thanks" {
                Disposition::Acknowledge
            } else {
                Disposition::Respond
            }
        }

        async fn reject(&self, _message: &InboundMessage) -> Result<()> {
            *self.rejected.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn bridge(dir: &Path, configure: impl FnOnce(&mut BridgeConfig)) -> (Bridge, Arc<Echo>, Arc<Recorder>) {
        let mut config = BridgeConfig::new("test", dir);
        configure(&mut config);
        let relay = Arc::new(Echo {
            requests: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(Recorder::default());
        let bridge = Bridge::new(
            config,
            relay.clone(),
            sink.clone(),
            Arc::new(PreamblePrompt::new("PREAMBLE")),
        )
        .unwrap();
        (bridge, relay, sink)
    }

    #[tokio::test]
    async fn responds_and_marks_done() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, relay, sink) = bridge(dir.path(), |_| {});

        bridge.handle(message("1", "U1")).await;

        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.starts_with("echo: PREAMBLE"));
        assert_eq!(*sink.markers.lock().unwrap(), [Marker::Working, Marker::Done]);
        assert!(!relay.requests.lock().unwrap()[0].continue_session);
        assert!(bridge.tracker().is_empty());
        assert_eq!(bridge.inbox().recent(10).unwrap().total, 1);
    }

    #[tokio::test]
    async fn second_message_continues_session() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, relay, _sink) = bridge(dir.path(), |_| {});

        bridge.handle(message("1", "U1")).await;
        bridge.handle(message("2", "U1")).await;

        let requests = relay.requests.lock().unwrap();
        assert!(requests[1].continue_session);
        assert_eq!(requests[1].prompt, "what time is it");
    }

    #[tokio::test]
    async fn disallowed_sender_is_rejected_silently() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, relay, sink) = bridge(dir.path(), |c| c.allowed_senders = vec!["U1".into()]);

        bridge.handle(message("1", "U2")).await;

        assert!(relay.requests.lock().unwrap().is_empty());
        assert!(sink.replies.lock().unwrap().is_empty());
        assert_eq!(*sink.rejected.lock().unwrap(), 1);
        // Still logged.
        assert_eq!(bridge.inbox().recent(10).unwrap().total, 1);
    }

    #[tokio::test]
    async fn acknowledgement_skips_relay() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, relay, sink) = bridge(dir.path(), |_| {});
        let mut msg = message("1", "U1");
        msg.text = "thanks".to_string();

        bridge.handle(msg).await;

        assert!(relay.requests.lock().unwrap().is_empty());
        assert_eq!(*sink.markers.lock().unwrap(), [Marker::Acknowledged]);
    }

    #[tokio::test]
    async fn relay_failure_becomes_canned_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _relay, sink) = bridge(dir.path(), |_| {});
        let mut msg = message("1", "U1");
        msg.text = "please fail".to_string();

        bridge.handle(msg).await;

        let replies = sink.replies.lock().unwrap();
        assert!(replies[0].body.contains("took too long"));
        assert_eq!(sink.markers.lock().unwrap().last(), Some(&Marker::Failed));
        assert!(bridge.tracker().is_empty());
    }

    #[tokio::test]
    async fn inbox_only_mode_never_relays() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, relay, sink) = bridge(dir.path(), |c| c.auto_respond = false);

        bridge.handle(message("1", "U1")).await;

        assert!(relay.requests.lock().unwrap().is_empty());
        assert!(sink.markers.lock().unwrap().is_empty());
        assert_eq!(bridge.inbox().recent(10).unwrap().total, 1);
    }

    #[tokio::test]
    async fn complete_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, _relay, sink) = bridge(dir.path(), |_| {});
        let msg = message("1", "U1");
        bridge.tracker().mark_started(&msg, Utc::now());

        assert!(bridge.complete(&msg, "first".into(), Marker::Done).await);
        assert!(!bridge.complete(&msg, "second".into(), Marker::Done).await);
        assert_eq!(sink.replies.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_allow_list_allows_everyone() {
        let config = BridgeConfig::new("x", "/tmp/x");
        assert!(config.is_allowed("anyone"));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/x/.bridge.pid"));
    }
}
