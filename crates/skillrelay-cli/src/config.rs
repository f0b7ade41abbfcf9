//! Data directory and `skillrelay.toml` settings.
//!
//! Reads the `[relay]`, `[crm]`, `[slack]` and `[twilio]` sections and
//! falls back to defaults when the file or a section is missing. Secrets
//! stay in each bridge's `config.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use skillrelay_bridge::RelayConfig;

/// Overrides the data directory.
pub const HOME_ENV: &str = "SKILLRELAY_HOME";

/// Relative to the working directory, then to the data directory.
pub const SETTINGS_FILE: &str = "config/skillrelay.toml";

/// Keys the media skills read; forwarded to the relay when set.
pub const MEDIA_ENV_KEYS: &[&str] = &["FAL_KEY", "GEMINI_API_KEY", "ELEVENLABS_API_KEY", "SUNO_COOKIE"];

pub const DEFAULT_CRM_URL: &str = "http://localhost:3000";

// ---------------------------------------------------------------------------
// Data directory
// ---------------------------------------------------------------------------

/// `$SKILLRELAY_HOME`, or `~/.skillrelay`.
pub fn data_dir() -> Result<PathBuf> {
    resolve_data_dir(std::env::var(HOME_ENV).ok(), dirs::home_dir())
}

fn resolve_data_dir(env: Option<String>, home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = env.filter(|d| !d.trim().is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    home.map(|h| h.join(".skillrelay"))
        .with_context(|| format!("cannot locate a home directory; set {HOME_ENV}"))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub program: String,
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the relay, from `[relay.env]`.
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrmSettings {
    pub url: String,
    pub poll_interval: Duration,
    /// Name the relay answers as.
    pub persona: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlackSettings {
    pub workspace: String,
    pub work_timeout: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwilioSettings {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub relay: RelaySettings,
    pub crm: CrmSettings,
    pub slack: SlackSettings,
    pub twilio: TwilioSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelaySettings {
                program: RelayConfig::default().program,
                working_dir: None,
                env: HashMap::new(),
            },
            crm: CrmSettings {
                url: DEFAULT_CRM_URL.to_string(),
                poll_interval: skillrelay_channels::crm::DEFAULT_POLL_INTERVAL,
                persona: "SkillRelay".to_string(),
            },
            slack: SlackSettings {
                workspace: "default".to_string(),
                work_timeout: skillrelay_bridge::bridge::DEFAULT_WORK_TIMEOUT,
                cleanup_interval: skillrelay_bridge::bridge::DEFAULT_CLEANUP_INTERVAL,
            },
            twilio: TwilioSettings {
                bind: "0.0.0.0".to_string(),
                port: skillrelay_channels::twilio::DEFAULT_PORT,
            },
        }
    }
}

/// Load settings from the first `skillrelay.toml` found.
pub fn load_settings(data_dir: &Path) -> Settings {
    for path in [PathBuf::from(SETTINGS_FILE), data_dir.join(SETTINGS_FILE)] {
        if let Ok(content) = std::fs::read_to_string(&path) {
            tracing::debug!(path = %path.display(), "settings loaded");
            return parse_settings(&content);
        }
    }
    Settings::default()
}

/// Parse settings text. Unparseable files and bad values fall back to the
/// defaults.
pub fn parse_settings(content: &str) -> Settings {
    let defaults = Settings::default();
    let table: toml::Table = match content.parse() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed skillrelay.toml");
            return defaults;
        }
    };
    let empty = toml::Table::new();
    let section = |name: &str| match table.get(name) {
        Some(toml::Value::Table(t)) => t,
        _ => &empty,
    };
    let string = |t: &toml::Table, key: &str| t.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let secs = |t: &toml::Table, key: &str| {
        t.get(key)
            .and_then(|v| v.as_integer())
            .filter(|v| *v > 0)
            .map(|v| Duration::from_secs(v as u64))
    };

    let relay = section("relay");
    let env = match relay.get("env") {
        Some(toml::Value::Table(t)) => t
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => HashMap::new(),
    };
    let crm = section("crm");
    let slack = section("slack");
    let twilio = section("twilio");

    Settings {
        relay: RelaySettings {
            program: string(relay, "program").unwrap_or(defaults.relay.program),
            working_dir: string(relay, "working_dir").map(PathBuf::from),
            env,
        },
        crm: CrmSettings {
            url: string(crm, "url").unwrap_or(defaults.crm.url),
            poll_interval: secs(crm, "poll_interval_secs").unwrap_or(defaults.crm.poll_interval),
            persona: string(crm, "persona").unwrap_or(defaults.crm.persona),
        },
        slack: SlackSettings {
            workspace: string(slack, "workspace").unwrap_or(defaults.slack.workspace),
            work_timeout: secs(slack, "work_timeout_secs").unwrap_or(defaults.slack.work_timeout),
            cleanup_interval: secs(slack, "cleanup_interval_secs")
                .unwrap_or(defaults.slack.cleanup_interval),
        },
        twilio: TwilioSettings {
            bind: string(twilio, "bind").unwrap_or(defaults.twilio.bind),
            port: twilio
                .get("port")
                .and_then(|v| v.as_integer())
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(defaults.twilio.port),
        },
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Base relay configuration. The working directory comes from the flag,
/// then the settings, then the current directory.
pub fn relay_base(settings: &RelaySettings, workdir: Option<PathBuf>) -> Result<RelayConfig> {
    let working_dir = match workdir.or_else(|| settings.working_dir.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let mut env = settings.env.clone();
    forward_media_keys(&mut env, |key| std::env::var(key).ok());

    Ok(RelayConfig {
        program: settings.program.clone(),
        working_dir: Some(working_dir),
        env,
        ..RelayConfig::default()
    })
}

fn forward_media_keys(env: &mut HashMap<String, String>, lookup: impl Fn(&str) -> Option<String>) {
    for key in MEDIA_ENV_KEYS {
        if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
            tracing::debug!(key, "forwarding media key to relay");
            env.entry((*key).to_string()).or_insert(value);
        }
    }
}
