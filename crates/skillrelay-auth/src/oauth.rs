//! OAuth 2.0 authorization code flow, with PKCE where the provider supports it.
//!
//! # Flow Overview
//!
//! 1. Generate a random `state` and, for PKCE providers, a code verifier.
//! 2. Build an authorization URL and send the user to it.
//! 3. Receive the authorization code via the loopback callback.
//! 4. Exchange the code (plus verifier) for tokens.
//! 5. Refresh the access token once `now >= expiry`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, Result};

/// Bytes of entropy behind the PKCE verifier and the CSRF state.
const RANDOM_TOKEN_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the client authenticates itself at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    /// `client_id` / `client_secret` form fields.
    RequestBody,
    /// HTTP Basic with `client_id:client_secret`.
    BasicAuth,
}

/// Configuration for one OAuth 2.0 authorization code flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// The OAuth client ID.
    pub client_id: String,

    /// The OAuth client secret (confidential clients only).
    pub client_secret: Option<String>,

    /// The authorization endpoint URL.
    pub auth_url: String,

    /// The token endpoint URL.
    pub token_url: String,

    /// The redirect URI pointing at the loopback listener.
    pub redirect_uri: String,

    /// The scopes to request.
    pub scopes: Vec<String>,

    /// Whether to send an S256 code challenge.
    pub use_pkce: bool,

    /// Where client credentials go on token requests.
    pub client_auth: ClientAuth,

    /// Provider-specific authorization parameters (`access_type`, `duration`).
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,

    /// Some providers reject requests without a descriptive User-Agent.
    #[serde(default)]
    pub user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

/// Tokens returned by the authorization server after a successful exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// The access token used to authenticate API requests.
    pub access_token: String,

    /// The refresh token used to obtain new access tokens.
    pub refresh_token: Option<String>,

    /// Absolute time the access token stops being valid.
    pub expiry: Option<DateTime<Utc>>,

    /// The token type (typically "Bearer").
    pub token_type: String,

    /// The scopes that were granted.
    pub scopes: Vec<String>,
}

/// Raw token response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    /// Convert into [`OAuthTokens`], computing `expiry` from `expires_in`.
    fn into_tokens(self, now: DateTime<Utc>) -> OAuthTokens {
        let expiry = self.expires_in.map(|secs| now + Duration::seconds(secs));

        let scopes = self
            .scope
            .map(|s| {
                s.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expiry,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scopes,
        }
    }
}

/// Raw error response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// Random values and PKCE
// ---------------------------------------------------------------------------

/// Generate `len` random bytes and encode them base64url without padding.
///
/// # Errors
///
/// Returns [`AuthError::FlowFailed`] if the system CSPRNG fails.
pub fn random_urlsafe(len: usize) -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).map_err(|_| AuthError::FlowFailed {
        reason: "system random number generator failed".to_string(),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a CSRF `state` value.
pub fn generate_state() -> Result<String> {
    random_urlsafe(RANDOM_TOKEN_BYTES)
}

/// Generate a PKCE code verifier (random 32 bytes, base64url encoded).
pub fn generate_pkce_verifier() -> Result<String> {
    random_urlsafe(RANDOM_TOKEN_BYTES)
}

/// Derive the PKCE code challenge from a code verifier using SHA-256.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Whether a token with the given expiry must be refreshed at `now`.
///
/// Tokens without an expiry are treated as valid.
pub fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiry {
        Some(expiry) => now >= expiry,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// OAuth flow
// ---------------------------------------------------------------------------

/// Drives the HTTP side of an authorization code flow.
///
/// Holds no per-login state; the caller owns the verifier and `state`.
pub struct OAuthFlow {
    config: OAuthConfig,
    client: reqwest::Client,
}

impl OAuthFlow {
    /// Create a new flow with its own HTTP client.
    pub fn new(config: OAuthConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Create a flow sharing an existing HTTP client.
    pub fn with_client(config: OAuthConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// The configuration this flow was built with.
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Build the authorization URL the user should visit.
    ///
    /// `code_challenge` must be present exactly when the config enables PKCE.
    pub fn authorization_url(&self, state: &str, code_challenge: Option<&str>) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_url)?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.config.redirect_uri);
            params.append_pair("state", state);

            if !self.config.scopes.is_empty() {
                params.append_pair("scope", &self.config.scopes.join(" "));
            }

            if let Some(challenge) = code_challenge {
                params.append_pair("code_challenge", challenge);
                params.append_pair("code_challenge_method", "S256");
            }

            for (key, value) in &self.config.extra_auth_params {
                params.append_pair(key, value);
            }
        }

        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidGrant`] if the server rejects the code, or
    /// [`AuthError::NetworkError`] on transport failure.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<OAuthTokens> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }

        tracing::debug!(token_url = %self.config.token_url, "exchanging authorization code");
        self.post_token_request(params).await
    }

    /// Refresh an access token using a refresh token.
    ///
    /// The returned set has `refresh_token: None` when the provider did not
    /// rotate it; callers keep the old one in that case.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens> {
        let params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        tracing::debug!(token_url = %self.config.token_url, "refreshing access token");
        self.post_token_request(params).await
    }

    /// POST a grant to the token endpoint with the configured client auth.
    async fn post_token_request(&self, mut params: Vec<(&str, &str)>) -> Result<OAuthTokens> {
        let mut request = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json");

        if let Some(agent) = &self.config.user_agent {
            request = request.header("User-Agent", agent);
        }

        match (self.config.client_auth, self.config.client_secret.as_deref()) {
            (ClientAuth::BasicAuth, secret) => {
                request = request.header(
                    "Authorization",
                    basic_auth_header(&self.config.client_id, secret.unwrap_or("")),
                );
            }
            (ClientAuth::RequestBody, secret) => {
                params.push(("client_id", self.config.client_id.as_str()));
                if let Some(secret) = secret {
                    params.push(("client_secret", secret));
                }
            }
        }

        let response = request.form(&params).send().await?;
        Self::parse_token_response(response).await
    }

    /// Parse the HTTP response from the token endpoint.
    async fn parse_token_response(response: reqwest::Response) -> Result<OAuthTokens> {
        let status = response.status();
        let body = response.text().await?;
        parse_token_body(status, &body, Utc::now())
    }
}

/// Interpret a token endpoint response body.
fn parse_token_body(
    status: reqwest::StatusCode,
    body: &str,
    now: DateTime<Utc>,
) -> Result<OAuthTokens> {
    if status.is_success() {
        // Some providers answer 200 with an error object.
        if let Ok(token_response) = serde_json::from_str::<TokenResponse>(body) {
            tracing::debug!("token exchange successful");
            return Ok(token_response.into_tokens(now));
        }
    }

    if let Ok(error_response) = serde_json::from_str::<TokenErrorResponse>(body) {
        let reason = match error_response.error_description {
            Some(description) => format!("{}: {description}", error_response.error),
            None => error_response.error,
        };
        return Err(AuthError::InvalidGrant { reason });
    }

    Err(AuthError::InvalidGrant {
        reason: format!("HTTP {status}: {body}"),
    })
}

/// `Basic base64(id:secret)` header value.
pub fn basic_auth_header(client_id: &str, client_secret: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{client_id}:{client_secret}"))
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OAuthConfig {
        OAuthConfig {
            client_id: "test-client-id".to_string(),
            client_secret: Some("test-secret".to_string()),
            auth_url: "https://auth.example.com/authorize".to_string(),
            token_url: "https://auth.example.com/token".to_string(),
            redirect_uri: "http://localhost:9998/callback".to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
            use_pkce: true,
            client_auth: ClientAuth::RequestBody,
            extra_auth_params: vec![],
            user_agent: None,
        }
    }

    fn query_of(url_str: &str) -> std::collections::HashMap<String, String> {
        Url::parse(url_str)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn pkce_verifier_is_correct_length() {
        let verifier = generate_pkce_verifier().unwrap();
        // 32 bytes base64url encoded = 43 characters (no padding).
        assert_eq!(verifier.len(), 43);
    }

    #[test]
    fn random_values_are_url_safe_and_distinct() {
        let a = generate_state().unwrap();
        let b = generate_state().unwrap();
        assert_ne!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn authorization_url_includes_all_params() {
        let mut config = test_config();
        config.extra_auth_params = vec![("access_type".to_string(), "offline".to_string())];
        let flow = OAuthFlow::new(config);
        let challenge = pkce_challenge("test-verifier");
        let params = query_of(
            &flow
                .authorization_url("random-state", Some(&challenge))
                .unwrap(),
        );

        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "test-client-id");
        assert_eq!(params["redirect_uri"], "http://localhost:9998/callback");
        assert_eq!(params["state"], "random-state");
        assert_eq!(params["code_challenge"], challenge);
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "read write");
        assert_eq!(params["access_type"], "offline");
    }

    #[test]
    fn authorization_url_without_pkce_or_scopes() {
        let mut config = test_config();
        config.scopes = vec![];
        config.use_pkce = false;
        let flow = OAuthFlow::new(config);
        let params = query_of(&flow.authorization_url("state", None).unwrap());

        assert!(!params.contains_key("scope"));
        assert!(!params.contains_key("code_challenge"));
    }

    #[test]
    fn token_body_computes_absolute_expiry() {
        let now = Utc::now();
        let tokens = parse_token_body(
            reqwest::StatusCode::OK,
            r#"{"access_token":"t1","refresh_token":"r1","expires_in":3600,"scope":"a b"}"#,
            now,
        )
        .unwrap();

        assert_eq!(tokens.access_token, "t1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("r1"));
        assert_eq!(tokens.expiry, Some(now + Duration::seconds(3600)));
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.scopes, vec!["a", "b"]);
    }

    #[test]
    fn token_body_minimal_has_no_expiry() {
        let tokens = parse_token_body(
            reqwest::StatusCode::OK,
            r#"{"access_token":"tok"}"#,
            Utc::now(),
        )
        .unwrap();
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.expiry.is_none());
        assert!(tokens.scopes.is_empty());
    }

    #[test]
    fn token_body_error_becomes_invalid_grant() {
        let err = parse_token_body(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token has been revoked"}"#,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid grant: invalid_grant: Token has been revoked"
        );
    }

    #[test]
    fn token_body_error_with_ok_status() {
        let err = parse_token_body(
            reqwest::StatusCode::OK,
            r#"{"error":"invalid_request"}"#,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant { .. }));
    }

    #[test]
    fn token_body_non_json_error() {
        let err = parse_token_body(reqwest::StatusCode::BAD_GATEWAY, "upstream down", Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn expiry_comparison_has_no_margin() {
        let now = Utc::now();
        assert!(is_expired(Some(now), now));
        assert!(is_expired(Some(now - Duration::seconds(1)), now));
        assert!(!is_expired(Some(now + Duration::seconds(30)), now));
        assert!(!is_expired(None, now));
    }

    #[test]
    fn basic_auth_header_encodes_pair() {
        assert_eq!(basic_auth_header("id", "secret"), "Basic aWQ6c2VjcmV0");
    }

    #[test]
    fn oauth_flow_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OAuthFlow>();
        assert_send_sync::<OAuthConfig>();
        assert_send_sync::<OAuthTokens>();
    }
}
