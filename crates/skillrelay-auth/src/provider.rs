//! OAuth provider registry and client configuration loading.
//!
//! Each [`Provider`] knows its endpoints, default scopes, loopback port and
//! how to discover the logged-in account's name. Client id/secret come from
//! the provider's `credentials.json`, which may use Google's
//! `{"installed": {...}}` shape or a flat `{"client_id": ...}` object.

use std::path::Path;

use serde::Deserialize;

use crate::error::{AuthError, Result};
use crate::oauth::{ClientAuth, OAuthConfig};

/// Where to look up the account name after a successful exchange.
#[derive(Debug, Clone)]
pub struct IdentityEndpoint {
    pub url: String,
    /// JSON pointer to the field naming the account, e.g. `/data/username`.
    pub pointer: String,
}

/// Static description of one OAuth provider.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub auth_url: String,
    pub token_url: String,
    pub default_scopes: Vec<String>,
    /// Loopback port registered with the provider; 0 for OS-assigned.
    pub callback_port: u16,
    pub use_pkce: bool,
    pub client_auth: ClientAuth,
    pub extra_auth_params: Vec<(String, String)>,
    pub identity: Option<IdentityEndpoint>,
    pub user_agent: Option<String>,
}

/// Names accepted by [`Provider::builtin`].
pub const BUILTIN_PROVIDERS: &[&str] = &["google", "discord", "linkedin", "reddit", "twitter"];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Provider {
    /// Look up a built-in provider by name.
    pub fn builtin(name: &str) -> Option<Self> {
        let provider = match name {
            "google" => Self {
                name: "google".to_string(),
                auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                default_scopes: strings(&[
                    "https://www.googleapis.com/auth/gmail.modify",
                    "https://www.googleapis.com/auth/calendar.events",
                    "https://www.googleapis.com/auth/drive",
                    "https://www.googleapis.com/auth/userinfo.email",
                ]),
                callback_port: 0,
                use_pkce: true,
                client_auth: ClientAuth::RequestBody,
                extra_auth_params: pairs(&[("access_type", "offline"), ("prompt", "consent")]),
                identity: Some(IdentityEndpoint {
                    url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
                    pointer: "/email".to_string(),
                }),
                user_agent: None,
            },
            "discord" => Self {
                name: "discord".to_string(),
                auth_url: "https://discord.com/api/oauth2/authorize".to_string(),
                token_url: "https://discord.com/api/oauth2/token".to_string(),
                default_scopes: strings(&[
                    "identify",
                    "guilds",
                    "guilds.members.read",
                    "messages.read",
                ]),
                callback_port: 9997,
                use_pkce: false,
                client_auth: ClientAuth::RequestBody,
                extra_auth_params: vec![],
                identity: Some(IdentityEndpoint {
                    url: "https://discord.com/api/v10/users/@me".to_string(),
                    pointer: "/username".to_string(),
                }),
                user_agent: None,
            },
            "linkedin" => Self {
                name: "linkedin".to_string(),
                auth_url: "https://www.linkedin.com/oauth/v2/authorization".to_string(),
                token_url: "https://www.linkedin.com/oauth/v2/accessToken".to_string(),
                default_scopes: strings(&["openid", "profile", "email", "w_member_social"]),
                callback_port: 9999,
                use_pkce: false,
                client_auth: ClientAuth::RequestBody,
                extra_auth_params: vec![],
                identity: Some(IdentityEndpoint {
                    url: "https://api.linkedin.com/v2/userinfo".to_string(),
                    pointer: "/email".to_string(),
                }),
                user_agent: None,
            },
            "reddit" => Self {
                name: "reddit".to_string(),
                auth_url: "https://www.reddit.com/api/v1/authorize".to_string(),
                token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
                default_scopes: strings(&[
                    "identity",
                    "read",
                    "submit",
                    "vote",
                    "save",
                    "subscribe",
                    "mysubreddits",
                    "privatemessages",
                    "history",
                ]),
                callback_port: 9996,
                use_pkce: false,
                client_auth: ClientAuth::BasicAuth,
                extra_auth_params: pairs(&[("duration", "permanent")]),
                identity: Some(IdentityEndpoint {
                    url: "https://oauth.reddit.com/api/v1/me".to_string(),
                    pointer: "/name".to_string(),
                }),
                user_agent: Some(format!("skillrelay/{}", env!("CARGO_PKG_VERSION"))),
            },
            "twitter" => Self {
                name: "twitter".to_string(),
                auth_url: "https://twitter.com/i/oauth2/authorize".to_string(),
                token_url: "https://api.twitter.com/2/oauth2/token".to_string(),
                default_scopes: strings(&[
                    "tweet.read",
                    "tweet.write",
                    "users.read",
                    "follows.read",
                    "follows.write",
                    "offline.access",
                    "like.read",
                    "like.write",
                    "bookmark.read",
                    "bookmark.write",
                ]),
                callback_port: 9998,
                use_pkce: true,
                client_auth: ClientAuth::BasicAuth,
                extra_auth_params: vec![],
                identity: Some(IdentityEndpoint {
                    url: "https://api.twitter.com/2/users/me".to_string(),
                    pointer: "/data/username".to_string(),
                }),
                user_agent: None,
            },
            _ => return None,
        };
        Some(provider)
    }

    /// Like [`Provider::builtin`] but with a typed error.
    pub fn lookup(name: &str) -> Result<Self> {
        Self::builtin(name).ok_or_else(|| AuthError::ProviderNotFound {
            provider: name.to_string(),
        })
    }

    /// Redirect URI for a listener bound to `port`.
    pub fn redirect_uri(port: u16) -> String {
        format!("http://localhost:{port}")
    }

    /// Build the flow configuration for one login or refresh.
    pub fn oauth_config(
        &self,
        client: &ClientCredentials,
        redirect_uri: String,
        scopes: Option<Vec<String>>,
    ) -> OAuthConfig {
        // Basic auth without a secret is a public client; fall back to body.
        let client_auth = match (self.client_auth, &client.client_secret) {
            (ClientAuth::BasicAuth, None) if self.use_pkce => ClientAuth::RequestBody,
            (auth, _) => auth,
        };

        OAuthConfig {
            client_id: client.client_id.clone(),
            client_secret: client.client_secret.clone(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            redirect_uri,
            scopes: scopes.unwrap_or_else(|| self.default_scopes.clone()),
            use_pkce: self.use_pkce,
            client_auth,
            extra_auth_params: self.extra_auth_params.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client credentials
// ---------------------------------------------------------------------------

/// OAuth client id and optional secret.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<ClientCredentials>,
    web: Option<ClientCredentials>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl ClientCredentials {
    /// Read `credentials.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AuthError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(&content).map_err(|reason| AuthError::InvalidConfig {
            reason: format!("{}: {reason}", path.display()),
        })
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        let file: CredentialsFile = serde_json::from_str(content).map_err(|e| e.to_string())?;

        let credentials = file
            .installed
            .or(file.web)
            .or_else(|| {
                file.client_id.map(|client_id| ClientCredentials {
                    client_id,
                    client_secret: file.client_secret,
                })
            })
            .ok_or_else(|| "no client_id found".to_string())?;

        if credentials.client_id.trim().is_empty() {
            return Err("client_id is empty".to_string());
        }
        Ok(ClientCredentials {
            client_secret: credentials.client_secret.filter(|s| !s.is_empty()),
            ..credentials
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_resolves() {
        for name in BUILTIN_PROVIDERS {
            let provider = Provider::builtin(name).unwrap();
            assert_eq!(provider.name, *name);
            assert!(provider.auth_url.starts_with("https://"));
            assert!(!provider.default_scopes.is_empty());
        }
        assert!(Provider::builtin("myspace").is_none());
        assert!(matches!(
            Provider::lookup("myspace"),
            Err(AuthError::ProviderNotFound { .. })
        ));
    }

    #[test]
    fn google_requests_offline_access() {
        let google = Provider::builtin("google").unwrap();
        assert_eq!(google.callback_port, 0);
        assert!(
            google
                .extra_auth_params
                .contains(&("access_type".to_string(), "offline".to_string()))
        );
    }

    #[test]
    fn reddit_uses_basic_auth_and_user_agent() {
        let reddit = Provider::builtin("reddit").unwrap();
        let config = reddit.oauth_config(
            &ClientCredentials {
                client_id: "id".to_string(),
                client_secret: Some("s".to_string()),
            },
            Provider::redirect_uri(9996),
            None,
        );
        assert_eq!(config.client_auth, ClientAuth::BasicAuth);
        assert!(config.user_agent.is_some());
        assert_eq!(config.redirect_uri, "http://localhost:9996");
    }

    #[test]
    fn twitter_public_client_sends_id_in_body() {
        let twitter = Provider::builtin("twitter").unwrap();
        let config = twitter.oauth_config(
            &ClientCredentials {
                client_id: "id".to_string(),
                client_secret: None,
            },
            Provider::redirect_uri(9998),
            Some(vec!["tweet.read".to_string()]),
        );
        assert_eq!(config.client_auth, ClientAuth::RequestBody);
        assert_eq!(config.scopes, vec!["tweet.read"]);
    }

    #[test]
    fn parse_installed_shape() {
        let creds = ClientCredentials::parse(
            r#"{"installed":{"client_id":"abc.apps","client_secret":"shh","redirect_uris":["http://localhost"]}}"#,
        )
        .unwrap();
        assert_eq!(creds.client_id, "abc.apps");
        assert_eq!(creds.client_secret.as_deref(), Some("shh"));
    }

    #[test]
    fn parse_flat_shape_without_secret() {
        let creds = ClientCredentials::parse(r#"{"client_id":"flat","client_secret":""}"#).unwrap();
        assert_eq!(creds.client_id, "flat");
        assert!(creds.client_secret.is_none());
    }

    #[test]
    fn parse_rejects_missing_id() {
        assert!(ClientCredentials::parse(r#"{"something":"else"}"#).is_err());
        assert!(ClientCredentials::parse(r#"{"client_id":"  "}"#).is_err());
    }

    #[test]
    fn load_reports_path() {
        let err = ClientCredentials::load(Path::new("/nonexistent/credentials.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/credentials.json"));
    }
}
