//! OAuth loopback login and credential files for SkillRelay.
//!
//! - **Authorization code flow** with PKCE (RFC 7636) where supported
//! - **Loopback callback listener** with a bounded wait
//! - **Token files** (`tokens/token_<account>.json`) written atomically
//! - **Resolution**: transparent refresh, browser fallback, or a clear
//!   "run login" error when headless
//!
//! # Architecture
//!
//! ```text
//! AuthManager
//! ├── Provider         (endpoints, scopes, port, identity lookup)
//! ├── OAuthFlow        (authorization URL, code exchange, refresh)
//! ├── CallbackServer   (single-request loopback listener)
//! └── CredentialStore  (one JSON file per account)
//! ```

pub mod browser;
pub mod callback;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod provider;
pub mod store;

pub use browser::{BrowserLauncher, no_browser, system_browser};
pub use callback::{CallbackParams, CallbackServer, DEFAULT_CALLBACK_TIMEOUT_SECS};
pub use error::{AuthError, Result};
pub use manager::{AccountSummary, AuthManager};
pub use oauth::{ClientAuth, OAuthConfig, OAuthFlow, OAuthTokens};
pub use provider::{BUILTIN_PROVIDERS, ClientCredentials, IdentityEndpoint, Provider};
pub use store::{CredentialStore, StoredAccount, sanitize_account};
