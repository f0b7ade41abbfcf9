//! Error types for the auth crate.
//!
//! All login, refresh and credential-file operations surface errors through
//! [`AuthError`]. Each variant carries enough context for the CLI to print a
//! useful `{"error": ...}` object and for bridges to decide whether a retry
//! makes sense.

/// Unified error type for SkillRelay authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No usable token exists and an interactive login is not possible.
    #[error("login required for {provider} ({reason}); run `skillrelay auth login {provider}`")]
    LoginRequired {
        /// The provider that needs a login.
        provider: String,
        /// Why the saved credentials could not be used.
        reason: String,
    },

    /// The authorization server redirected back with an `error` parameter.
    #[error("authorization denied: {error}")]
    AuthorizationDenied {
        /// The `error` (and description, when present) from the redirect.
        error: String,
    },

    /// The authorization code exchange or refresh grant was rejected by the
    /// authorization server.
    #[error("invalid grant: {reason}")]
    InvalidGrant {
        /// Explanation from the authorization server.
        reason: String,
    },

    /// An HTTP request to the authorization server failed.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// Client configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The requested provider is not in the registry.
    #[error("provider not found: {provider}")]
    ProviderNotFound {
        /// The provider name that was not found.
        provider: String,
    },

    /// No token file exists for the named account.
    #[error("account not found: {account} ({provider})")]
    AccountNotFound {
        /// The provider that was searched.
        provider: String,
        /// The account name that was not found.
        account: String,
    },

    /// The flow failed for a reason not covered above (state mismatch,
    /// malformed callback, CSPRNG failure).
    #[error("authentication flow failed: {reason}")]
    FlowFailed {
        /// Details about why the flow failed.
        reason: String,
    },

    /// The loopback listener timed out waiting for the redirect.
    #[error("callback timed out after {timeout_secs} seconds")]
    CallbackTimeout {
        /// How many seconds we waited before giving up.
        timeout_secs: u64,
    },

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (token files, callback listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_required_names_the_command() {
        let err = AuthError::LoginRequired {
            provider: "google".to_string(),
            reason: "no saved credentials".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "login required for google (no saved credentials); run `skillrelay auth login google`"
        );
    }

    #[test]
    fn error_display_authorization_denied() {
        let err = AuthError::AuthorizationDenied {
            error: "access_denied".to_string(),
        };
        assert_eq!(err.to_string(), "authorization denied: access_denied");
    }

    #[test]
    fn error_display_callback_timeout() {
        let err = AuthError::CallbackTimeout { timeout_secs: 120 };
        assert_eq!(err.to_string(), "callback timed out after 120 seconds");
    }

    #[test]
    fn error_display_account_not_found() {
        let err = AuthError::AccountNotFound {
            provider: "reddit".to_string(),
            account: "someone".to_string(),
        };
        assert_eq!(err.to_string(), "account not found: someone (reddit)");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthError>();
    }
}
