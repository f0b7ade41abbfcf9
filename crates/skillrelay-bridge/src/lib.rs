//! Inbox-relay bridge core for SkillRelay.
//!
//! A bridge waits for inbound chat messages, hands each one to an external
//! text-generation program and posts the answer back where it came from.
//! Transports live in `skillrelay-channels`; this crate is everything they
//! share.
//!
//! # Architecture
//!
//! ```text
//! Bridge
//! ├── EventSource    (PollingSource | PushSource)
//! ├── Relay          (CliRelay: subprocess + activity classifier)
//! ├── ReplySink      (per-channel replies, markers, progress)
//! ├── WorkTracker    (pending work, mirrored to pending_work.json)
//! ├── SessionRegistry
//! ├── InboxLog       (inbox.jsonl)
//! └── PidFile        (.bridge.pid, one instance per directory)
//! ```
//!
//! Stuck items are retried once by the sweeper and then abandoned with an
//! apology. Completing an item is a claim on the tracker, so each item gets
//! exactly one terminal message.

pub mod activity;
pub mod bridge;
pub mod cleanup;
pub mod error;
pub mod inbox;
pub mod lifecycle;
pub mod model;
pub mod prompt;
pub mod relay;
pub mod retry;
pub mod sessions;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod tracker;

pub use activity::{ActivityThrottle, INITIAL_ACTIVITY, classify_line};
pub use bridge::{Bridge, BridgeConfig, DEFAULT_FAILURE_APOLOGY, DEFAULT_MAX_CONCURRENT};
pub use cleanup::SweepReport;
pub use error::{BridgeError, Result};
pub use inbox::{INBOX_FILE_NAME, InboxLog, InboxPage};
pub use lifecycle::{
    BridgeState, PID_FILE_NAME, PidFile, StateCell, listen_for_signals, running_pid, stop_running,
};
pub use model::{Author, InboundMessage, MessageKind, Reply, WorkKey};
pub use prompt::{PreamblePrompt, PromptBuilder};
pub use relay::{
    ActivityCallback, CliRelay, Relay, RelayConfig, RelayError, RelayReplies, RelayRequest,
    truncate_chars,
};
pub use retry::retry_with_backoff;
pub use sessions::SessionRegistry;
pub use shutdown::Shutdown;
pub use sink::{Disposition, Marker, Progress, ReplySink, format_elapsed};
pub use source::{EventSource, PollBackoff, PollError, Poller, PollingSource, PushSource, push_channel};
pub use tracker::{MarkOutcome, PENDING_WORK_FILE_NAME, PendingWork, WorkTracker};
