//! Bridge process lifecycle: state machine, PID file and signal handling.
//!
//! ```text
//! Stopped -> Starting -> Listening <-> Processing
//!                            |
//!                            v
//!                        Stopping -> Stopped
//! ```
//!
//! `Starting` claims the PID file; `Stopping` (SIGINT / SIGTERM) releases it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::watch;

use crate::error::{BridgeError, Result};
use crate::shutdown::Shutdown;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Stopped,
    Starting,
    Listening,
    Processing,
    Stopping,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Publishes state transitions to any number of observers.
pub struct StateCell {
    tx: watch::Sender<BridgeState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BridgeState::Stopped);
        Self { tx }
    }

    pub fn get(&self) -> BridgeState {
        *self.tx.borrow()
    }

    pub fn set(&self, next: BridgeState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "bridge state changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// PID file
// ---------------------------------------------------------------------------

/// Name of the PID file inside a bridge directory.
pub const PID_FILE_NAME: &str = ".bridge.pid";

/// Exclusive claim on a bridge directory, released on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Write the current process id to `path`.
    ///
    /// A file naming another live process means a second instance, which is
    /// refused. A stale file is replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let pid = std::process::id();

        if let Some(existing) = read_pid(&path)? {
            if existing != pid && process_alive(existing) {
                return Err(BridgeError::AlreadyRunning { pid: existing });
            }
            tracing::warn!(path = %path.display(), stale_pid = existing, "replacing stale PID file");
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, pid.to_string())?;
        tracing::debug!(path = %path.display(), pid, "PID file written");

        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us.
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "could not remove PID file");
            }
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The live process recorded in `path`, removing the file if it is stale.
pub fn running_pid(path: &Path) -> Result<Option<u32>> {
    match read_pid(path)? {
        Some(pid) if process_alive(pid) => Ok(Some(pid)),
        Some(_) | None => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            Ok(None)
        }
    }
}

/// Send SIGTERM to the process recorded in `path`.
pub fn stop_running(path: &Path) -> Result<u32> {
    let pid = running_pid(path)?.ok_or(BridgeError::NotRunning)?;
    terminate(pid)?;
    tracing::info!(pid, "sent SIGTERM to bridge");
    Ok(pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| BridgeError::Signal {
        reason: format!("pid {pid} out of range"),
    })?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| BridgeError::Signal {
        reason: format!("kill {pid}: {e}"),
    })
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    Err(BridgeError::Signal {
        reason: format!("cannot signal pid {pid} on this platform"),
    })
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Trigger `shutdown` on SIGINT or SIGTERM.
///
/// Handlers are registered before this returns, so a signal delivered
/// right after the call is never lost.
#[cfg(unix)]
pub fn listen_for_signals(shutdown: Shutdown) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
            _ = interrupt.recv() => tracing::info!("received SIGINT"),
            _ = shutdown.wait() => return,
        }
        shutdown.trigger();
    }))
}

#[cfg(not(unix))]
pub fn listen_for_signals(shutdown: Shutdown) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    tracing::info!("received Ctrl-C");
                }
            }
            _ = shutdown.wait() => return,
        }
        shutdown.trigger();
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);

        let pid_file = PidFile::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
        assert_eq!(pid_file.pid(), std::process::id());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        // Max pid on Linux is well below this.
        std::fs::write(&path, "999999999").unwrap();

        let _pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[cfg(unix)]
    #[test]
    fn live_foreign_pid_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        // pid 1 always exists.
        std::fs::write(&path, "1").unwrap();

        match PidFile::acquire(&path) {
            Err(BridgeError::AlreadyRunning { pid }) => assert_eq!(pid, 1),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn drop_leaves_foreign_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        let pid_file = PidFile::acquire(&path).unwrap();
        std::fs::write(&path, "1").unwrap();
        drop(pid_file);
        assert!(path.exists());
    }

    #[test]
    fn running_pid_cleans_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        std::fs::write(&path, "999999999").unwrap();

        assert_eq!(running_pid(&path).unwrap(), None);
        assert!(!path.exists());
        assert!(matches!(stop_running(&path), Err(BridgeError::NotRunning)));
    }

    #[test]
    fn running_pid_reports_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        let _pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(running_pid(&path).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn state_cell_publishes_transitions() {
        let cell = StateCell::new();
        let rx = cell.subscribe();
        assert_eq!(cell.get(), BridgeState::Stopped);
        cell.set(BridgeState::Listening);
        assert_eq!(*rx.borrow(), BridgeState::Listening);
        assert_eq!(BridgeState::Processing.to_string(), "processing");
    }
}
