//! Shared helpers used across CLI subcommands.
//!
//! Tracing setup, JSON output and the status / stop / inbox commands every
//! bridge has.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use skillrelay_bridge::{BridgeError, INBOX_FILE_NAME, InboxLog, PID_FILE_NAME, running_pid, stop_running};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr; stdout carries only the command's JSON.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn print_json(value: &Value) {
    let formatted = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{formatted}");
}

/// Output objects carrying `error`, or `success: false`, exit non-zero.
pub fn is_failure(value: &Value) -> bool {
    value.get("error").is_some() || value.get("success") == Some(&Value::Bool(false))
}

pub fn error_json(error: &anyhow::Error) -> Value {
    json!({ "error": format!("{error:#}") })
}

// ---------------------------------------------------------------------------
// Bridge files
// ---------------------------------------------------------------------------

/// `{"running": true, "pid": N}` or `{"running": false}`.
pub fn bridge_status(dir: &Path) -> Result<Value> {
    Ok(match running_pid(&dir.join(PID_FILE_NAME))? {
        Some(pid) => json!({ "running": true, "pid": pid }),
        None => json!({ "running": false }),
    })
}

/// SIGTERM the bridge recorded in `dir`.
pub fn bridge_stop(dir: &Path) -> Result<Value> {
    match stop_running(&dir.join(PID_FILE_NAME)) {
        Ok(pid) => Ok(json!({ "stopped": true, "pid": pid })),
        Err(BridgeError::NotRunning) => Ok(json!({ "stopped": false, "error": "Bridge not running" })),
        Err(e) => Err(e.into()),
    }
}

/// Fail early, before binding ports or opening sockets, when `dir` already
/// has a live bridge.
pub fn ensure_not_running(dir: &Path) -> Result<()> {
    match running_pid(&dir.join(PID_FILE_NAME))? {
        Some(pid) => Err(BridgeError::AlreadyRunning { pid }.into()),
        None => Ok(()),
    }
}

pub fn inbox(dir: &Path, limit: usize) -> Result<Value> {
    let log = InboxLog::new(dir.join(INBOX_FILE_NAME));
    if !log.path().exists() {
        return Ok(json!({ "messages": [], "info": "No messages yet" }));
    }
    Ok(serde_json::to_value(log.recent(limit)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_detection() {
        assert!(is_failure(&json!({ "error": "boom" })));
        assert!(is_failure(&json!({ "success": false })));
        assert!(is_failure(&json!({ "stopped": false, "error": "Bridge not running" })));
        assert!(!is_failure(&json!({ "success": true })));
        assert!(!is_failure(&json!({ "running": false })));
    }

    #[test]
    fn error_json_keeps_context_chain() {
        let err = anyhow::anyhow!("inner").context("outer");
        assert_eq!(error_json(&err), json!({ "error": "outer: inner" }));
    }

    #[test]
    fn status_and_stop_without_bridge() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(bridge_status(dir.path()).unwrap(), json!({ "running": false }));
        assert_eq!(
            bridge_stop(dir.path()).unwrap(),
            json!({ "stopped": false, "error": "Bridge not running" })
        );
        ensure_not_running(dir.path()).unwrap();
    }

    #[test]
    fn live_pid_is_reported_and_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        std::fs::write(dir.path().join(PID_FILE_NAME), pid.to_string()).unwrap();

        assert_eq!(bridge_status(dir.path()).unwrap(), json!({ "running": true, "pid": pid }));
        let err = ensure_not_running(dir.path()).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn inbox_without_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            inbox(dir.path(), 10).unwrap(),
            json!({ "messages": [], "info": "No messages yet" })
        );
    }

    #[test]
    fn inbox_shows_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = InboxLog::new(dir.path().join(INBOX_FILE_NAME));
        for i in 0..3 {
            log.append(&json!({ "n": i })).unwrap();
        }
        let page = inbox(dir.path(), 2).unwrap();
        assert_eq!(page["total"], 3);
        assert_eq!(page["showing"], 2);
        assert_eq!(page["messages"][1]["n"], 2);
    }
}
