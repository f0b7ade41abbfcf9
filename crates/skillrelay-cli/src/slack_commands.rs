//! `skillrelay slack ...`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};

use skillrelay_bridge::{Bridge, BridgeConfig, CliRelay, Shutdown, listen_for_signals, push_channel};
use skillrelay_channels::slack::{
    self, ActiveThreads, SlackClient, SlackPrompt, SlackSink, SlackTokens, SocketModeListener,
};

use crate::cli::SlackAction;
use crate::config::{self, Settings};
use crate::helpers;

const SLACK_DIR: &str = "slack";

/// Socket Mode events queued ahead of the dispatch loop.
const QUEUE_CAPACITY: usize = 64;

pub async fn run(action: SlackAction, data_dir: &Path, settings: &Settings) -> Result<Value> {
    let dir = data_dir.join(SLACK_DIR);
    let workspace = |flag: Option<String>| flag.unwrap_or_else(|| settings.slack.workspace.clone());
    match action {
        SlackAction::Run {
            workspace: ws,
            auto,
            relay,
        } => run_bridge(&dir, &workspace(ws), auto, relay.workdir, settings).await,
        SlackAction::Status => helpers::bridge_status(&dir),
        SlackAction::Stop => helpers::bridge_stop(&dir),
        SlackAction::Inbox { limit } => helpers::inbox(&dir, limit),
        SlackAction::Reply {
            channel,
            thread_ts,
            message,
            workspace: ws,
        } => {
            let tokens = slack::load_tokens(&dir, &workspace(ws))?;
            let client = SlackClient::new(tokens.bot_token()?);
            Ok(match client.post_message(&channel, &message, Some(thread_ts.as_str())).await {
                Ok(ts) => json!({
                    "success": true,
                    "channel": channel,
                    "thread_ts": thread_ts,
                    "message_ts": ts,
                    "text": message,
                }),
                Err(e) => json!({ "success": false, "error": e.to_string() }),
            })
        }
        SlackAction::Cleanup {
            workspace: ws,
            relay,
        } => {
            helpers::ensure_not_running(&dir)?;
            let (bridge, _) = build(&dir, &workspace(ws), true, relay.workdir, settings)?;
            let pending = bridge.tracker().len();
            tracing::info!(pending, "checking for stuck work items");
            let report = bridge.sweep_once(Utc::now()).await;
            Ok(json!({ "pending": pending, "report": report }))
        }
        SlackAction::Scan {
            workspace: ws,
            relay,
        } => {
            helpers::ensure_not_running(&dir)?;
            let (bridge, client) = build(&dir, &workspace(ws), true, relay.workdir, settings)?;
            let report = slack::scan_orphans(&bridge, &client).await?;
            Ok(serde_json::to_value(report)?)
        }
    }
}

struct Parts {
    bridge: Bridge,
    client: Arc<SlackClient>,
    threads: ActiveThreads,
    tokens: SlackTokens,
}

fn parts(
    dir: &Path,
    workspace: &str,
    auto: bool,
    workdir: Option<PathBuf>,
    settings: &Settings,
) -> Result<Parts> {
    let tokens = slack::load_tokens(dir, workspace)?;
    let client = Arc::new(SlackClient::new(tokens.bot_token()?));
    let threads = ActiveThreads::new();
    let relay = slack::relay_config(config::relay_base(&settings.relay, workdir)?);

    let mut bridge_config = BridgeConfig::new(SLACK_DIR, dir);
    bridge_config.auto_respond = auto;
    bridge_config.retry_enabled = true;
    bridge_config.work_timeout = settings.slack.work_timeout;
    bridge_config.cleanup_interval = settings.slack.cleanup_interval;

    let bridge = Bridge::new(
        bridge_config,
        Arc::new(CliRelay::new(relay)),
        Arc::new(SlackSink::new(Arc::clone(&client), threads.clone())),
        Arc::new(SlackPrompt),
    )
    .context("failed to load slack bridge state")?;

    Ok(Parts {
        bridge,
        client,
        threads,
        tokens,
    })
}

fn build(
    dir: &Path,
    workspace: &str,
    auto: bool,
    workdir: Option<PathBuf>,
    settings: &Settings,
) -> Result<(Bridge, Arc<SlackClient>)> {
    let parts = parts(dir, workspace, auto, workdir, settings)?;
    Ok((parts.bridge, parts.client))
}

async fn run_bridge(
    dir: &Path,
    workspace: &str,
    auto: bool,
    workdir: Option<PathBuf>,
    settings: &Settings,
) -> Result<Value> {
    helpers::ensure_not_running(dir)?;
    let parts = parts(dir, workspace, auto, workdir, settings)?;
    let app_token = parts.tokens.app_token()?.to_string();
    tracing::info!(workspace, auto_respond = auto, "starting slack bridge");

    let bridge = Arc::new(parts.bridge);
    let (tx, source) = push_channel(QUEUE_CAPACITY);
    let shutdown = Shutdown::new();
    let signals = listen_for_signals(shutdown.clone())?;

    let listener = SocketModeListener::new(parts.client, app_token, parts.threads, tx);
    let socket = tokio::spawn(listener.run(shutdown.clone()));

    let result = Arc::clone(&bridge).run(source, shutdown.clone()).await;
    shutdown.trigger();
    if let Err(e) = socket.await {
        tracing::warn!(error = %e, "socket task ended abnormally");
    }
    if let Err(e) = signals.await {
        tracing::debug!(error = %e, "signal task ended abnormally");
    }
    result?;

    Ok(json!({ "bridge": SLACK_DIR, "stopped": true }))
}
