//! Error types for the channel transports.

use skillrelay_bridge::BridgeError;

/// Unified error type for CRM, Slack and Twilio calls.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The HTTP request itself failed (connect, timeout, body).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered but reported a failure in its body
    /// (Slack `"ok": false`, Twilio error JSON).
    #[error("{service} api error: {reason}")]
    Api { service: String, reason: String },

    /// Non-success status code.
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    /// Missing token, SID or URL.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("websocket error: {reason}")]
    WebSocket { reason: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    pub fn api(service: &str, reason: impl Into<String>) -> Self {
        Self::Api {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl From<ChannelError> for BridgeError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Bridge(inner) => inner,
            ChannelError::InvalidConfig { reason } => BridgeError::InvalidConfig { reason },
            ChannelError::Io(e) => BridgeError::Io(e),
            other => BridgeError::transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_names_the_service() {
        let err = ChannelError::api("slack", "channel_not_found");
        assert_eq!(err.to_string(), "slack api error: channel_not_found");
    }

    #[test]
    fn status_error_display() {
        let err = ChannelError::Status {
            service: "twilio".into(),
            status: 401,
            body: "Authenticate".into(),
        };
        assert_eq!(err.to_string(), "twilio returned HTTP 401: Authenticate");
    }

    #[test]
    fn converts_into_bridge_transport_error() {
        let err: BridgeError = ChannelError::api("crm", "boom").into();
        assert!(matches!(err, BridgeError::Transport { .. }));

        let err: BridgeError = ChannelError::config("no token").into();
        assert!(matches!(err, BridgeError::InvalidConfig { .. }));
    }
}
