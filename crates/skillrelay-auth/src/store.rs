//! File-per-account credential storage.
//!
//! Layout under a provider directory:
//!
//! ```text
//! <provider>/
//! ├── credentials.json          OAuth client (id / secret)
//! └── tokens/
//!     └── token_<account>.json  one StoredAccount per file
//! ```
//!
//! Writes go through a temp file in the same directory and an atomic
//! rename, so a crash never leaves a half-written token file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};
use crate::oauth::OAuthTokens;

const TOKENS_DIR: &str = "tokens";
const TOKEN_FILE_PREFIX: &str = "token_";

// ---------------------------------------------------------------------------
// StoredAccount
// ---------------------------------------------------------------------------

/// One saved login for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAccount {
    pub provider: String,
    /// Email or username the provider reported, or the name given at login.
    pub account: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredAccount {
    /// Build a record from a fresh token set.
    pub fn from_tokens(provider: &str, account: &str, tokens: OAuthTokens) -> Self {
        Self {
            provider: provider.to_string(),
            account: account.to_string(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expiry: tokens.expiry,
            token_type: tokens.token_type,
            scopes: tokens.scopes,
            saved_at: Utc::now(),
        }
    }

    /// Apply a refresh response. A provider that does not rotate refresh
    /// tokens leaves the old one in place, and empty scopes keep the old set.
    pub fn apply_refresh(&mut self, tokens: OAuthTokens) {
        self.access_token = tokens.access_token;
        self.expiry = tokens.expiry;
        self.token_type = tokens.token_type;
        if let Some(refresh_token) = tokens.refresh_token {
            self.refresh_token = Some(refresh_token);
        }
        if !tokens.scopes.is_empty() {
            self.scopes = tokens.scopes;
        }
        self.saved_at = Utc::now();
    }
}

/// Map an account name to the file-name-safe form used in `token_<x>.json`.
///
/// Lowercases, then replaces anything other than word characters, `-` and
/// `.` with `_`.
pub fn sanitize_account(account: &str) -> String {
    account
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Token files for one provider.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    provider: String,
    root: PathBuf,
}

impl CredentialStore {
    /// A store rooted at `<data_dir>/<provider>`.
    pub fn new(data_dir: impl AsRef<Path>, provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            root: data_dir.as_ref().join(provider),
        }
    }

    /// The provider directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the OAuth client configuration is read from.
    pub fn client_credentials_path(&self) -> PathBuf {
        self.root.join("credentials.json")
    }

    fn tokens_dir(&self) -> PathBuf {
        self.root.join(TOKENS_DIR)
    }

    /// Path of the token file for `account`.
    pub fn path_for(&self, account: &str) -> PathBuf {
        self.tokens_dir().join(format!(
            "{TOKEN_FILE_PREFIX}{}.json",
            sanitize_account(account)
        ))
    }

    /// Persist an account atomically with owner-only permissions.
    pub fn save(&self, account: &StoredAccount) -> Result<PathBuf> {
        let dir = self.tokens_dir();
        std::fs::create_dir_all(&dir)?;

        let path = self.path_for(&account.account);
        let json = serde_json::to_string_pretty(account)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(&path).map_err(|e| AuthError::Io(e.error))?;

        tracing::debug!(
            provider = %self.provider,
            path = %path.display(),
            "token file saved"
        );
        Ok(path)
    }

    /// Load one account, `None` when no file exists.
    pub fn load(&self, account: &str) -> Result<Option<StoredAccount>> {
        read_account(&self.path_for(account))
    }

    /// All saved accounts, ordered by file name.
    pub fn list(&self) -> Result<Vec<StoredAccount>> {
        let dir = self.tokens_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TOKEN_FILE_PREFIX) && n.ends_with(".json"))
            })
            .collect();
        paths.sort();

        let mut accounts = Vec::with_capacity(paths.len());
        for path in paths {
            match read_account(&path) {
                Ok(Some(account)) => accounts.push(account),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable token file");
                }
            }
        }
        Ok(accounts)
    }

    /// The first account in file-name order, used when none is named.
    pub fn first(&self) -> Result<Option<StoredAccount>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Delete an account's token file. Returns whether a file existed.
    pub fn remove(&self, account: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(account)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_account(path: &Path) -> Result<Option<StoredAccount>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
