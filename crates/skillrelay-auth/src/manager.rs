//! Login, credential resolution and refresh.
//!
//! [`AuthManager`] is the entry point the CLI and skills use. It owns the
//! data directory, decides whether an interactive browser login is allowed,
//! and guarantees that a resolved account never carries an empty or expired
//! access token.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::browser::{BrowserLauncher, system_browser};
use crate::callback::{CallbackServer, DEFAULT_CALLBACK_TIMEOUT_SECS};
use crate::error::{AuthError, Result};
use crate::oauth::{OAuthFlow, generate_pkce_verifier, generate_state, is_expired, pkce_challenge};
use crate::provider::{ClientCredentials, Provider};
use crate::store::{CredentialStore, StoredAccount};

/// Account name used when the provider reports none and none was given.
const DEFAULT_ACCOUNT: &str = "default";

/// Summary row for `accounts`.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account: String,
    pub expiry: Option<DateTime<Utc>>,
    pub expired: bool,
    pub has_refresh_token: bool,
}

// ---------------------------------------------------------------------------
// AuthManager
// ---------------------------------------------------------------------------

/// Coordinates OAuth logins and token files for every provider.
pub struct AuthManager {
    data_dir: PathBuf,
    http: reqwest::Client,
    launcher: BrowserLauncher,
    interactive: bool,
    callback_timeout_secs: u64,
}

impl AuthManager {
    /// A manager storing provider directories under `data_dir`.
    ///
    /// Interactive logins are allowed by default.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            http: reqwest::Client::new(),
            launcher: system_browser(),
            interactive: true,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
        }
    }

    /// Replace the browser launcher.
    pub fn with_launcher(mut self, launcher: BrowserLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Allow or forbid falling back to a browser login.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Override the loopback wait.
    pub fn with_callback_timeout(mut self, secs: u64) -> Self {
        self.callback_timeout_secs = secs;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Token files for `provider`.
    pub fn store(&self, provider: &Provider) -> CredentialStore {
        CredentialStore::new(&self.data_dir, &provider.name)
    }

    /// OAuth client for `provider`, from its `credentials.json`.
    pub fn client_credentials(&self, provider: &Provider) -> Result<ClientCredentials> {
        ClientCredentials::load(&self.store(provider).client_credentials_path())
    }

    // -----------------------------------------------------------------------
    // Login
    // -----------------------------------------------------------------------

    /// Run the full browser flow and persist the result.
    ///
    /// 1. Bind the loopback listener (fixed or OS-assigned port).
    /// 2. Generate `state` and, for PKCE providers, the verifier.
    /// 3. Open the authorization URL in the browser.
    /// 4. Wait (bounded) for the single redirect.
    /// 5. Verify `state`, exchange the code.
    /// 6. Name the account and write its token file.
    pub async fn login(
        &self,
        provider: &Provider,
        account: Option<&str>,
        scopes: Option<Vec<String>>,
    ) -> Result<StoredAccount> {
        tracing::info!(provider = %provider.name, "starting OAuth login");

        let client = self.client_credentials(provider)?;

        let server = CallbackServer::bind(provider.callback_port).await?;
        let redirect_uri = Provider::redirect_uri(server.port());
        let config = provider.oauth_config(&client, redirect_uri, scopes);

        let state = generate_state()?;
        let verifier = if config.use_pkce {
            Some(generate_pkce_verifier()?)
        } else {
            None
        };
        let challenge = verifier.as_deref().map(pkce_challenge);

        let flow = OAuthFlow::with_client(config, self.http.clone());
        let auth_url = flow.authorization_url(&state, challenge.as_deref())?;

        tracing::info!(url = %auth_url, "open this URL in your browser to authorize");
        if !(self.launcher)(&auth_url) {
            tracing::warn!("browser did not open; visit the URL above manually");
        }

        let params = server.wait(self.callback_timeout_secs).await?;
        if params.state != state {
            return Err(AuthError::FlowFailed {
                reason: "state mismatch in OAuth callback".to_string(),
            });
        }

        let tokens = flow.exchange_code(&params.code, verifier.as_deref()).await?;

        let identity = self.discover_identity(provider, &tokens.access_token).await;
        let name = identity
            .or_else(|| account.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string());

        let stored = StoredAccount::from_tokens(&provider.name, &name, tokens);
        let path = self.store(provider).save(&stored)?;

        tracing::info!(
            provider = %provider.name,
            account = %stored.account,
            path = %path.display(),
            "login completed"
        );
        Ok(stored)
    }

    /// Ask the provider who we are. Failures only cost the account name.
    async fn discover_identity(&self, provider: &Provider, access_token: &str) -> Option<String> {
        let endpoint = provider.identity.as_ref()?;

        let mut request = self.http.get(&endpoint.url).bearer_auth(access_token);
        if let Some(agent) = &provider.user_agent {
            request = request.header("User-Agent", agent);
        }

        let response = match request.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(provider = %provider.name, status = %r.status(), "identity lookup rejected");
                return None;
            }
            Err(e) => {
                tracing::warn!(provider = %provider.name, error = %e, "identity lookup failed");
                return None;
            }
        };

        let body: serde_json::Value = response.json().await.ok()?;
        body.pointer(&endpoint.pointer)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Return a usable account, refreshing or logging in as needed.
    ///
    /// With no `account`, the first saved account is used.
    ///
    /// # Errors
    ///
    /// [`AuthError::LoginRequired`] when no usable token exists and the
    /// manager is not interactive.
    pub async fn resolve(&self, provider: &Provider, account: Option<&str>) -> Result<StoredAccount> {
        let store = self.store(provider);
        let saved = match account {
            Some(name) => store.load(name)?,
            None => store.first()?,
        };

        let saved = match saved.filter(|s| !s.access_token.is_empty()) {
            Some(saved) => saved,
            None => {
                return self
                    .login_or_fail(provider, account, "no saved credentials".to_string())
                    .await;
            }
        };

        if !is_expired(saved.expiry, Utc::now()) {
            return Ok(saved);
        }

        tracing::debug!(
            provider = %provider.name,
            account = %saved.account,
            "access token expired, attempting refresh"
        );

        let reason = match saved.refresh_token.clone() {
            Some(refresh_token) => match self.refresh(provider, saved.clone(), &refresh_token).await {
                Ok(refreshed) => return Ok(refreshed),
                Err(e) => {
                    tracing::warn!(provider = %provider.name, error = %e, "token refresh failed");
                    format!("token expired and refresh failed: {e}")
                }
            },
            None => "token expired and no refresh token is saved".to_string(),
        };

        self.login_or_fail(provider, Some(&saved.account), reason).await
    }

    async fn login_or_fail(
        &self,
        provider: &Provider,
        account: Option<&str>,
        reason: String,
    ) -> Result<StoredAccount> {
        if self.interactive {
            tracing::info!(provider = %provider.name, reason = %reason, "falling back to browser login");
            self.login(provider, account, None).await
        } else {
            Err(AuthError::LoginRequired {
                provider: provider.name.clone(),
                reason,
            })
        }
    }

    /// Exchange the refresh token and persist the new expiry.
    async fn refresh(
        &self,
        provider: &Provider,
        mut saved: StoredAccount,
        refresh_token: &str,
    ) -> Result<StoredAccount> {
        let client = self.client_credentials(provider)?;
        let config = provider.oauth_config(
            &client,
            Provider::redirect_uri(provider.callback_port),
            Some(saved.scopes.clone()),
        );
        let flow = OAuthFlow::with_client(config, self.http.clone());

        let tokens = flow.refresh_token(refresh_token).await?;
        saved.apply_refresh(tokens);
        self.store(provider).save(&saved)?;

        tracing::info!(
            provider = %provider.name,
            account = %saved.account,
            "token refreshed"
        );
        Ok(saved)
    }

    // -----------------------------------------------------------------------
    // Account management
    // -----------------------------------------------------------------------

    /// Delete a saved account.
    pub fn logout(&self, provider: &Provider, account: &str) -> Result<()> {
        if self.store(provider).remove(account)? {
            tracing::info!(provider = %provider.name, account, "logged out");
            Ok(())
        } else {
            Err(AuthError::AccountNotFound {
                provider: provider.name.clone(),
                account: account.to_string(),
            })
        }
    }

    /// Saved accounts with their expiry state.
    pub fn accounts(&self, provider: &Provider) -> Result<Vec<AccountSummary>> {
        let now = Utc::now();
        Ok(self
            .store(provider)
            .list()?
            .into_iter()
            .map(|a| AccountSummary {
                expired: is_expired(a.expiry, now),
                has_refresh_token: a.refresh_token.is_some(),
                expiry: a.expiry,
                account: a.account,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::no_browser;
    use chrono::Duration;

    fn manager(dir: &Path) -> AuthManager {
        AuthManager::new(dir)
            .with_launcher(no_browser())
            .interactive(false)
    }

    fn saved(expiry: DateTime<Utc>, refresh: Option<&str>) -> StoredAccount {
        StoredAccount {
            provider: "google".to_string(),
            account: "me@example.com".to_string(),
            access_token: "old".to_string(),
            refresh_token: refresh.map(str::to_string),
            expiry: Some(expiry),
            token_type: "Bearer".to_string(),
            scopes: vec![],
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_token_without_interaction_requires_login() {
        let dir = tempfile::tempdir().unwrap();
        let google = Provider::builtin("google").unwrap();

        let err = manager(dir.path()).resolve(&google, None).await.unwrap_err();
        match err {
            AuthError::LoginRequired { provider, reason } => {
                assert_eq!(provider, "google");
                assert_eq!(reason, "no saved credentials");
            }
            other => panic!("expected LoginRequired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_token_is_returned_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let google = Provider::builtin("google").unwrap();
        let mgr = manager(dir.path());
        let account = saved(Utc::now() + Duration::hours(1), None);
        mgr.store(&google).save(&account).unwrap();

        let resolved = mgr.resolve(&google, None).await.unwrap();
        assert_eq!(resolved, account);
    }

    #[tokio::test]
    async fn expired_without_refresh_token_requires_login() {
        let dir = tempfile::tempdir().unwrap();
        let google = Provider::builtin("google").unwrap();
        let mgr = manager(dir.path());
        mgr.store(&google)
            .save(&saved(Utc::now() - Duration::hours(1), None))
            .unwrap();

        let err = mgr
            .resolve(&google, Some("me@example.com"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no refresh token"));
    }

    #[tokio::test]
    async fn empty_access_token_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let google = Provider::builtin("google").unwrap();
        let mgr = manager(dir.path());
        let mut account = saved(Utc::now() + Duration::hours(1), None);
        account.access_token.clear();
        mgr.store(&google).save(&account).unwrap();

        assert!(matches!(
            mgr.resolve(&google, None).await,
            Err(AuthError::LoginRequired { .. })
        ));
    }

    #[test]
    fn logout_unknown_account_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reddit = Provider::builtin("reddit").unwrap();
        assert!(matches!(
            manager(dir.path()).logout(&reddit, "ghost"),
            Err(AuthError::AccountNotFound { .. })
        ));
    }

    #[test]
    fn accounts_reports_expiry_state() {
        let dir = tempfile::tempdir().unwrap();
        let google = Provider::builtin("google").unwrap();
        let mgr = manager(dir.path());
        mgr.store(&google)
            .save(&saved(Utc::now() - Duration::minutes(5), Some("r")))
            .unwrap();

        let accounts = mgr.accounts(&google).unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].expired);
        assert!(accounts[0].has_refresh_token);
    }

    #[test]
    fn manager_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthManager>();
    }
}
