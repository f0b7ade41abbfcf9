//! Append-only JSON-lines log of everything a bridge saw and sent.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub const INBOX_FILE_NAME: &str = "inbox.jsonl";

/// The tail of an inbox, as printed by `inbox` subcommands.
#[derive(Debug, Serialize)]
pub struct InboxPage {
    pub messages: Vec<Value>,
    pub total: usize,
    pub showing: usize,
}

/// `inbox.jsonl` writer. Each line is one JSON object with `received_at`.
pub struct InboxLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl InboxLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record` (which must serialize to an object), stamping
    /// `received_at` with the local time.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut value = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "received_at".to_string(),
                Value::String(chrono::Local::now().to_rfc3339()),
            );
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// The last `limit` entries. Lines that fail to parse are skipped.
    pub fn recent(&self, limit: usize) -> Result<InboxPage> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(InboxPage {
                    messages: Vec::new(),
                    total: 0,
                    showing: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&line) {
                messages.push(value);
            }
        }

        let total = messages.len();
        let recent = messages.split_off(total.saturating_sub(limit));
        Ok(InboxPage {
            showing: recent.len(),
            messages: recent,
            total,
        })
    }
}
