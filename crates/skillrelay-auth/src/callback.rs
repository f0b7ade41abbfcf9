//! Single-request loopback listener for the OAuth redirect.
//!
//! The authorization server redirects the browser to
//! `http://localhost:<port>/...?code=xxx&state=yyy` (or `?error=...`). The
//! listener accepts exactly one connection, answers it with a small HTML
//! page, and hands the parsed parameters back to the login flow.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{AuthError, Result};

/// Bounded wait for the browser step, applied to every provider.
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 120;

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Authorization Successful</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
    <h1 style="color: #22c55e;">Authorization Successful</h1>
    <p>You can close this tab and return to the terminal.</p>
</body>
</html>"#;

/// Parameters carried by a successful redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// A loopback listener bound before the authorization URL is built, so an
/// OS-assigned port can be baked into the redirect URI.
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

impl CallbackServer {
    /// Bind to `127.0.0.1:{port}`. Port 0 lets the OS choose.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        tracing::debug!(port, "callback listener bound");
        Ok(Self { listener, port })
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the single redirect request.
    ///
    /// # Errors
    ///
    /// - [`AuthError::CallbackTimeout`] if `timeout_secs` elapse first.
    /// - [`AuthError::AuthorizationDenied`] if the redirect carries `error`.
    /// - [`AuthError::FlowFailed`] if the request is missing parameters.
    pub async fn wait(self, timeout_secs: u64) -> Result<CallbackParams> {
        tracing::info!(port = self.port, "waiting for OAuth redirect");

        let timeout = tokio::time::Duration::from_secs(timeout_secs);
        match tokio::time::timeout(timeout, self.accept_one()).await {
            Ok(inner) => inner,
            Err(_) => Err(AuthError::CallbackTimeout { timeout_secs }),
        }
    }

    /// Accept one connection, parse it, answer it.
    async fn accept_one(&self) -> Result<CallbackParams> {
        let (mut stream, peer) = self.listener.accept().await?;
        tracing::debug!(peer = %peer, "accepted callback connection");

        // Redirect requests are small GETs.
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let parsed = Self::parse_callback_request(&request);

        let (status, body) = match &parsed {
            Ok(_) => ("200 OK", SUCCESS_HTML.to_string()),
            Err(e) => ("400 Bad Request", failure_html(&e.to_string())),
        };
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len(),
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        if parsed.is_ok() {
            tracing::info!("callback received, authorization code extracted");
        }
        parsed
    }

    /// Parse the query of the request line `GET /path?code=..&state=.. HTTP/1.1`.
    fn parse_callback_request(request: &str) -> Result<CallbackParams> {
        let request_line = request
            .lines()
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| AuthError::FlowFailed {
                reason: "empty HTTP request".to_string(),
            })?;

        let path = request_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| AuthError::FlowFailed {
                reason: format!("malformed HTTP request line: {request_line}"),
            })?;

        let query = path
            .split_once('?')
            .map(|(_, q)| q)
            .ok_or_else(|| AuthError::FlowFailed {
                reason: "callback request has no query string".to_string(),
            })?;

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut error_description = None;

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            let error = match error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(AuthError::AuthorizationDenied { error });
        }

        let code = code.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback missing 'code' parameter".to_string(),
        })?;
        let state = state.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback missing 'state' parameter".to_string(),
        })?;

        Ok(CallbackParams { code, state })
    }
}

fn failure_html(message: &str) -> String {
    let escaped = message
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Authorization Failed</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; padding-top: 4rem;\">\
         <h1 style=\"color: #ef4444;\">Authorization Failed</h1><p>{escaped}</p></body></html>"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
