//! `skillrelay auth ...`

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use skillrelay_auth::{AuthManager, BUILTIN_PROVIDERS, Provider, StoredAccount, no_browser};

use crate::cli::AuthAction;

pub async fn run(action: AuthAction, data_dir: &Path) -> Result<Value> {
    match action {
        AuthAction::Login {
            provider,
            account,
            scopes,
            no_browser: headless,
        } => {
            let provider = Provider::lookup(&provider)?;
            let mut manager = AuthManager::new(data_dir);
            if headless {
                manager = manager.with_launcher(no_browser());
            }
            let scopes = (!scopes.is_empty()).then_some(scopes);
            let saved = manager
                .login(&provider, account.as_deref(), scopes)
                .await
                .with_context(|| format!("{} login failed", provider.name))?;
            Ok(json!({
                "success": true,
                "provider": saved.provider,
                "account": saved.account,
                "expiry": saved.expiry,
                "scopes": saved.scopes,
                "path": manager.store(&provider).path_for(&saved.account),
            }))
        }
        AuthAction::Logout { provider, account } => {
            let provider = Provider::lookup(&provider)?;
            AuthManager::new(data_dir).logout(&provider, &account)?;
            Ok(json!({ "success": true, "provider": provider.name, "account": account }))
        }
        AuthAction::Accounts { provider } => {
            let provider = Provider::lookup(&provider)?;
            let accounts = AuthManager::new(data_dir).accounts(&provider)?;
            Ok(json!({ "provider": provider.name, "accounts": accounts }))
        }
        AuthAction::Token {
            provider,
            account,
            no_login,
        } => {
            let provider = Provider::lookup(&provider)?;
            let manager = AuthManager::new(data_dir).interactive(!no_login);
            let resolved = manager.resolve(&provider, account.as_deref()).await?;
            Ok(token_json(&resolved))
        }
        AuthAction::Providers => Ok(json!({ "providers": BUILTIN_PROVIDERS })),
    }
}

fn token_json(account: &StoredAccount) -> Value {
    json!({
        "provider": account.provider,
        "account": account.account,
        "access_token": account.access_token,
        "token_type": account.token_type,
        "expiry": account.expiry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillrelay_auth::CredentialStore;

    fn saved(provider: &str, account: &str) -> StoredAccount {
        StoredAccount {
            provider: provider.to_string(),
            account: account.to_string(),
            access_token: "at-1".to_string(),
            refresh_token: Some("rt-1".to_string()),
            expiry: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            token_type: "Bearer".to_string(),
            scopes: vec!["identify".to_string()],
            saved_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn providers_lists_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(AuthAction::Providers, dir.path()).await.unwrap();
        assert_eq!(out["providers"].as_array().unwrap().len(), BUILTIN_PROVIDERS.len());
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let action = AuthAction::Accounts {
            provider: "myspace".to_string(),
        };
        assert!(run(action, dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn token_returns_saved_unexpired_account() {
        let dir = tempfile::tempdir().unwrap();
        CredentialStore::new(dir.path(), "discord")
            .save(&saved("discord", "ada"))
            .unwrap();

        let out = run(
            AuthAction::Token {
                provider: "discord".to_string(),
                account: None,
                no_login: true,
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out["account"], "ada");
        assert_eq!(out["access_token"], "at-1");
    }

    #[tokio::test]
    async fn token_without_login_fails_headless() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            AuthAction::Token {
                provider: "reddit".to_string(),
                account: None,
                no_login: true,
            },
            dir.path(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("skillrelay auth login reddit"));
    }

    #[tokio::test]
    async fn logout_then_accounts_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        CredentialStore::new(dir.path(), "google")
            .save(&saved("google", "a@example.com"))
            .unwrap();

        let out = run(
            AuthAction::Logout {
                provider: "google".to_string(),
                account: "a@example.com".to_string(),
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out["success"], true);

        let out = run(
            AuthAction::Accounts {
                provider: "google".to_string(),
            },
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out["accounts"], json!([]));
    }
}
