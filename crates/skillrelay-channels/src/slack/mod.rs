//! Slack bridge: Socket Mode in, Web API out.
//!
//! ```text
//! SocketModeListener --mpsc--> PushSource --> Bridge --> SlackSink
//!        |                                                  |
//!        +------------------ ActiveThreads -----------------+
//! ```

pub mod api;
pub mod scan;
pub mod sink;
pub mod socket;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use skillrelay_bridge::{InboundMessage, PromptBuilder, RelayConfig, RelayReplies};

use crate::config;
use crate::error::{ChannelError, Result};

pub use api::{Reaction, SLACK_API_BASE, SlackClient};
pub use scan::{ScanReport, scan_orphans};
pub use sink::SlackSink;
pub use socket::{ActiveThreads, SocketModeListener};

/// Image generation runs long; Slack gets twice the default.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(600);

/// Bot and app tokens for one workspace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackTokens {
    /// Bot token, `xoxb-...`.
    #[serde(default)]
    pub token: Option<String>,
    /// App-level token for Socket Mode, `xapp-...`.
    #[serde(default)]
    pub app_token: Option<String>,
}

/// Tokens for `workspace` from `config.json`, which maps workspace names to
/// token pairs. Unknown workspaces fall back to `"default"`.
pub fn load_tokens(dir: &Path, workspace: &str) -> Result<SlackTokens> {
    let raw = config::load_raw(dir);
    if raw.is_empty() {
        return Err(ChannelError::config(format!(
            "no Slack config at {}",
            config::config_path(dir).display()
        )));
    }
    let entry = raw
        .get(workspace)
        .or_else(|| raw.get("default"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(serde_json::from_value(entry).unwrap_or_default())
}

impl SlackTokens {
    pub fn bot_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChannelError::config("no bot token in Slack config"))
    }

    pub fn app_token(&self) -> Result<&str> {
        self.app_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChannelError::config("no app_token in Slack config; add your xapp- token"))
    }
}

/// Relay settings for Slack: longer timeout and Slack-worded replies.
pub fn relay_config(base: RelayConfig) -> RelayConfig {
    let replies = RelayReplies {
        empty: "I processed that but have no response.".to_string(),
        timeout: "Sorry, that took too long to process (10 min timeout).".to_string(),
        not_found: base.replies.not_found.clone(),
    };
    RelayConfig {
        timeout: RELAY_TIMEOUT,
        replies,
        ..base
    }
}

/// First-message preamble carrying the channel and thread so the relay can
/// post files back to the right place. Continuations send the raw text.
pub struct SlackPrompt;

impl PromptBuilder for SlackPrompt {
    fn build(&self, message: &InboundMessage, continuing: bool) -> String {
        if continuing {
            return message.text.clone();
        }
        let thread = sink::reply_thread(message);
        let thread_line = thread.unwrap_or("none (post to channel)");
        format!(
            "You are responding to Slack messages from {name}. Keep responses concise and conversational.\n\
             \n\
             You have full access to this workspace, its skills and tools.\n\
             When the user confirms something (\"yes\", \"do it\", \"send it\"), carry out the action you proposed.\n\
             \n\
             Context:\n\
             - Channel ID: {channel}\n\
             - Thread TS: {thread_line}\n\
             - Always answer in the same thread when there is one, and pass the thread to any upload command.\n\
             \n\
             First message: {text}",
            name = message.author.name,
            channel = message.channel,
            text = message.text,
        )
    }
}
