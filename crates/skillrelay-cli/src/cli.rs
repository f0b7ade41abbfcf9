//! CLI argument definitions for SkillRelay.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// SkillRelay -- chat bridges and OAuth logins for CLI skills.
#[derive(Parser)]
#[command(
    name = "skillrelay",
    version,
    about = "SkillRelay -- chat bridges and OAuth logins for CLI skills",
    long_about = "Relays CRM, Slack and SMS messages to an external text-generation \
                  program and manages the OAuth tokens the skills use. Every command \
                  prints one JSON object on stdout."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// OAuth logins and saved tokens.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// CRM polling bridge.
    Crm {
        #[command(subcommand)]
        action: CrmAction,
    },

    /// Slack Socket Mode bridge.
    Slack {
        #[command(subcommand)]
        action: SlackAction,
    },

    /// Twilio SMS webhook bridge.
    Twilio {
        #[command(subcommand)]
        action: TwilioAction,
    },
}

impl Commands {
    /// Long-running commands log at `info`, one-shot commands at `warn`.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Commands::Crm {
                action: CrmAction::Run { .. },
            }
            | Commands::Slack {
                action: SlackAction::Run { .. } | SlackAction::Scan { .. } | SlackAction::Cleanup { .. },
            }
            | Commands::Twilio {
                action: TwilioAction::Run { .. },
            }
            | Commands::Auth {
                action: AuthAction::Login { .. },
            } => "info",
            _ => "warn",
        }
    }
}

// ---------------------------------------------------------------------------
// auth
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum AuthAction {
    /// Log in through the browser and save the token.
    Login {
        /// Provider name (see `auth providers`).
        provider: String,
        /// Account name to save under when the provider does not report one.
        #[arg(long, short)]
        account: Option<String>,
        /// Scopes to request instead of the provider defaults (repeatable).
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Print the authorization URL without opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
    /// Delete a saved account.
    Logout {
        provider: String,
        account: String,
    },
    /// List saved accounts for a provider.
    Accounts { provider: String },
    /// Print a valid access token, refreshing it if needed.
    Token {
        provider: String,
        #[arg(long, short)]
        account: Option<String>,
        /// Fail instead of opening a browser when no usable token exists.
        #[arg(long)]
        no_login: bool,
    },
    /// List the built-in providers.
    Providers,
}

// ---------------------------------------------------------------------------
// bridges
// ---------------------------------------------------------------------------

/// Options shared by every `run` subcommand.
#[derive(Args, Clone, Default)]
pub struct RelayArgs {
    /// Working directory for the relay program (default: current dir).
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum CrmAction {
    /// Poll the CRM and answer queued messages.
    Run {
        /// CRM base URL.
        #[arg(long, short)]
        url: Option<String>,
        /// Poll interval in seconds.
        #[arg(long, short)]
        interval: Option<u64>,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Pending messages, online users and conversation counters.
    Status {
        #[arg(long, short)]
        url: Option<String>,
    },
    /// Stop the running bridge.
    Stop,
    /// Show (and on first use generate) the bridge token.
    Token,
    /// Send a direct message as the bridge persona.
    Dm {
        /// Recipient user id.
        user_id: String,
        message: String,
        /// Recipient display name.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, short)]
        url: Option<String>,
    },
    /// Post in the shared chat room.
    Chatroom {
        message: String,
        /// User id to @-mention.
        #[arg(long)]
        mention: Option<String>,
        #[arg(long, short)]
        url: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum SlackAction {
    /// Connect over Socket Mode and relay mentions, DMs and thread replies.
    Run {
        #[arg(long, short)]
        workspace: Option<String>,
        /// Answer messages; without this they are only logged to the inbox.
        #[arg(long, short)]
        auto: bool,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Whether a bridge is running.
    Status,
    /// Stop the running bridge.
    Stop,
    /// Show recent inbox entries.
    Inbox {
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
    /// Post a reply in a thread.
    Reply {
        channel: String,
        thread_ts: String,
        message: String,
        #[arg(long, short)]
        workspace: Option<String>,
    },
    /// Sweep stuck work items once and exit.
    Cleanup {
        #[arg(long, short)]
        workspace: Option<String>,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Replay inbox messages still carrying our working marker.
    Scan {
        #[arg(long, short)]
        workspace: Option<String>,
        #[command(flatten)]
        relay: RelayArgs,
    },
}

#[derive(Subcommand)]
pub enum TwilioAction {
    /// Serve the SMS webhook and relay incoming texts.
    Run {
        /// Port for the webhook server.
        #[arg(long, short)]
        port: Option<u16>,
        /// Address to bind the webhook server to.
        #[arg(long)]
        bind: Option<String>,
        /// Answer texts; without this they are only logged to the inbox.
        #[arg(long, short)]
        auto: bool,
        #[command(flatten)]
        relay: RelayArgs,
    },
    /// Whether a bridge is running.
    Status,
    /// Stop the running bridge.
    Stop,
    /// Show recent inbox entries.
    Inbox {
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
    /// Send an SMS, or an MMS with `--media`.
    Send {
        phone: String,
        #[arg(long, short)]
        message: String,
        #[arg(long)]
        media: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn slack_reply_takes_three_positionals() {
        let cli = Cli::try_parse_from(["skillrelay", "slack", "reply", "C1", "1.2", "hello there"]).unwrap();
        match cli.command {
            Commands::Slack {
                action:
                    SlackAction::Reply {
                        channel,
                        thread_ts,
                        message,
                        workspace,
                    },
            } => {
                assert_eq!(channel, "C1");
                assert_eq!(thread_ts, "1.2");
                assert_eq!(message, "hello there");
                assert!(workspace.is_none());
            }
            _ => panic!("expected slack reply"),
        }
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "skillrelay", "twilio", "run", "--port", "6000", "--auto", "--workdir", "/srv",
        ])
        .unwrap();
        assert_eq!(cli.command.default_log_level(), "info");
        match cli.command {
            Commands::Twilio {
                action: TwilioAction::Run { port, auto, relay, .. },
            } => {
                assert_eq!(port, Some(6000));
                assert!(auto);
                assert_eq!(relay.workdir, Some(PathBuf::from("/srv")));
            }
            _ => panic!("expected twilio run"),
        }
    }

    #[test]
    fn one_shot_commands_log_quietly() {
        let cli = Cli::try_parse_from(["skillrelay", "slack", "inbox", "-l", "3"]).unwrap();
        assert_eq!(cli.command.default_log_level(), "warn");
    }

    #[test]
    fn send_requires_message() {
        assert!(Cli::try_parse_from(["skillrelay", "twilio", "send", "+15550001"]).is_err());
    }

    #[test]
    fn login_collects_scopes() {
        let cli = Cli::try_parse_from([
            "skillrelay", "auth", "login", "google", "--scope", "a", "--scope", "b", "--no-browser",
        ])
        .unwrap();
        match cli.command {
            Commands::Auth {
                action: AuthAction::Login { scopes, no_browser, .. },
            } => {
                assert_eq!(scopes, ["a", "b"]);
                assert!(no_browser);
            }
            _ => panic!("expected auth login"),
        }
    }
}
