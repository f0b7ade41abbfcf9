//! Pending-work bookkeeping.
//!
//! One entry per `(channel, message_id)` while a relay is outstanding. All
//! read-modify-write sequences, including the JSON mirror on disk, happen
//! under a single lock acquisition so the dispatch loop and the sweeper can
//! never interleave half an update.
//!
//! Completing an item is a *claim*: [`WorkTracker::finish`] removes the
//! entry and only the caller that gets it back may post the terminal
//! message. That is what keeps notifications to exactly one per item when
//! the first handler and a retry race.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{InboundMessage, WorkKey};

pub const PENDING_WORK_FILE_NAME: &str = "pending_work.json";

/// A relay invocation that has not produced a terminal message yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWork {
    pub message: InboundMessage,
    pub start_time: DateTime<Utc>,
    /// 0 while on the first attempt, 1 once the sweeper has retried.
    pub retry_count: u32,
}

impl PendingWork {
    pub fn key(&self) -> WorkKey {
        self.message.work_key()
    }

    pub fn channel(&self) -> &str {
        &self.message.channel
    }

    pub fn message_id(&self) -> &str {
        &self.message.id
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_count >= 1
    }
}

/// Result of [`WorkTracker::mark_started`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new entry was created; the caller owns the relay.
    Started,
    /// The key was already tracked; the existing entry is left untouched.
    AlreadyTracked,
}

// ---------------------------------------------------------------------------
// WorkTracker
// ---------------------------------------------------------------------------

/// Mutex-guarded pending-work map with an optional JSON mirror.
pub struct WorkTracker {
    entries: Mutex<HashMap<WorkKey, PendingWork>>,
    path: Option<PathBuf>,
}

impl WorkTracker {
    /// A tracker that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Load the mirror at `path` (missing file means empty) and keep
    /// writing it on every mutation.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => {
                let raw: BTreeMap<String, PendingWork> = serde_json::from_str(&content)?;
                raw.into_iter()
                    .filter_map(|(key, work)| match WorkKey::parse(&key) {
                        Some(parsed) => Some((parsed, work)),
                        None => {
                            tracing::warn!(key = %key, "dropping malformed pending-work key");
                            None
                        }
                    })
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        if !entries.is_empty() {
            tracing::info!(count = entries.len(), path = %path.display(), "loaded pending work");
        }

        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start tracking `message`. A second call for the same key is a no-op.
    pub fn mark_started(&self, message: &InboundMessage, now: DateTime<Utc>) -> MarkOutcome {
        self.mutate(|entries| {
            let key = message.work_key();
            if entries.contains_key(&key) {
                return (MarkOutcome::AlreadyTracked, false);
            }
            entries.insert(
                key,
                PendingWork {
                    message: message.clone(),
                    start_time: now,
                    retry_count: 0,
                },
            );
            (MarkOutcome::Started, true)
        })
    }

    /// Move a first-attempt item into the retrying state: reset its start
    /// time and set `retry_count` to 1. Returns `None` if the item is gone or
    /// already retrying.
    pub fn begin_retry(&self, key: &WorkKey, now: DateTime<Utc>) -> Option<PendingWork> {
        self.mutate(|entries| match entries.get_mut(key) {
            Some(work) if work.retry_count == 0 => {
                work.retry_count = 1;
                work.start_time = now;
                (Some(work.clone()), true)
            }
            _ => (None, false),
        })
    }

    /// Claim the item for its terminal message by removing it.
    pub fn finish(&self, key: &WorkKey) -> Option<PendingWork> {
        self.mutate(|entries| {
            let removed = entries.remove(key);
            let changed = removed.is_some();
            (removed, changed)
        })
    }

    /// Items whose current attempt started at least `timeout` before `now`,
    /// oldest first.
    pub fn stuck(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<PendingWork> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut stuck: Vec<PendingWork> = entries
            .values()
            .filter(|w| now - w.start_time >= timeout)
            .cloned()
            .collect();
        stuck.sort_by_key(|w| w.start_time);
        stuck
    }

    pub fn get(&self, key: &WorkKey) -> Option<PendingWork> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<PendingWork> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<PendingWork> = entries.values().cloned().collect();
        all.sort_by_key(|w| w.start_time);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items in the retrying state.
    pub fn retrying(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|w| w.is_retrying()).count()
    }

    /// Apply `f` and, if it reports a change, rewrite the mirror while the
    /// lock is still held.
    fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<WorkKey, PendingWork>) -> (R, bool)) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let (result, changed) = f(&mut entries);
        if changed && let Some(path) = &self.path {
            if let Err(e) = write_mirror(path, &entries) {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist pending work");
            }
        }
        result
    }
}

fn write_mirror(path: &Path, entries: &HashMap<WorkKey, PendingWork>) -> Result<()> {
    let ordered: BTreeMap<String, &PendingWork> =
        entries.iter().map(|(k, v)| (k.to_string(), v)).collect();
    let json = serde_json::to_string_pretty(&ordered)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
