//! Bridge error types.
//!
//! Per-message failures never surface here: the bridge turns them into
//! canned replies or log lines. [`BridgeError`] covers the things that stop
//! a bridge from starting or a one-shot command from completing.

/// Unified error type for the bridge core.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Another live process already owns the PID file.
    #[error("bridge already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// No live process owns the PID file.
    #[error("bridge not running")]
    NotRunning,

    /// A platform call (post, react, poll) failed.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Sending a signal to another process failed.
    #[error("signal error: {reason}")]
    Signal { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the bridge crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Shorthand for [`BridgeError::Transport`].
    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            reason: reason.to_string(),
        }
    }
}
