//! `skillrelay crm ...`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use skillrelay_bridge::{Bridge, BridgeConfig, CliRelay, Shutdown, listen_for_signals};
use skillrelay_channels::crm::{self, CRM_CHANNEL, CrmClient, CrmPrompt, CrmSink};

use crate::cli::CrmAction;
use crate::config::{self, Settings};
use crate::helpers;

pub async fn run(action: CrmAction, data_dir: &Path, settings: &Settings) -> Result<Value> {
    let dir = data_dir.join(CRM_CHANNEL);
    match action {
        CrmAction::Run { url, interval, relay } => {
            let url = url.unwrap_or_else(|| settings.crm.url.clone());
            let interval = interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(settings.crm.poll_interval);
            run_bridge(&dir, url, interval, relay.workdir, settings).await
        }
        CrmAction::Status { url } => {
            let client = client(&dir, url, settings)?;
            Ok(serde_json::to_value(client.status().await)?)
        }
        CrmAction::Stop => helpers::bridge_stop(&dir),
        CrmAction::Token => {
            let (token, created) = crm::bridge_token(&dir)?;
            Ok(json!({
                "token": token,
                "created": created,
                "hint": format!("set BRIDGE_TOKEN={token} on the CRM server"),
            }))
        }
        CrmAction::Dm {
            user_id,
            message,
            name,
            url,
        } => {
            let client = client(&dir, url, settings)?;
            let result = client.send_dm(&user_id, &message, name.as_deref()).await?;
            Ok(json!({ "success": true, "to": user_id, "result": result }))
        }
        CrmAction::Chatroom {
            message,
            mention,
            url,
        } => {
            let client = client(&dir, url, settings)?;
            let result = client.post_to_chatroom(&message, mention.as_deref()).await?;
            Ok(json!({ "success": true, "result": result }))
        }
    }
}

fn client(dir: &Path, url: Option<String>, settings: &Settings) -> Result<CrmClient> {
    let (token, created) = crm::bridge_token(dir)?;
    if created {
        tracing::warn!("generated a new bridge token; configure it on the CRM server (`skillrelay crm token`)");
    }
    let url = url.unwrap_or_else(|| settings.crm.url.clone());
    Ok(CrmClient::new(url, token).with_backup_dir(dir.to_path_buf()))
}

async fn run_bridge(
    dir: &Path,
    url: String,
    interval: Duration,
    workdir: Option<PathBuf>,
    settings: &Settings,
) -> Result<Value> {
    helpers::ensure_not_running(dir)?;
    let client = Arc::new(client(dir, Some(url), settings)?);

    let mut relay = config::relay_base(&settings.relay, workdir)?;
    crm::configure_relay(&mut relay, &client);
    let working_dir = relay
        .working_dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_default();

    tracing::info!(
        url = %client.base_url(),
        work_dir = %working_dir,
        poll_interval_secs = interval.as_secs(),
        "starting crm bridge"
    );

    // Queued CRM messages are answered in the order the queue returns them.
    let mut bridge_config = BridgeConfig::new(CRM_CHANNEL, dir);
    bridge_config.max_concurrent = 1;

    let bridge = Arc::new(
        Bridge::new(
            bridge_config,
            Arc::new(CliRelay::new(relay)),
            Arc::new(CrmSink::new(Arc::clone(&client))),
            Arc::new(CrmPrompt::new(settings.crm.persona.clone(), working_dir)),
        )
        .context("failed to load crm bridge state")?,
    );

    let shutdown = Shutdown::new();
    let signals = listen_for_signals(shutdown.clone())?;
    let result = Arc::clone(&bridge)
        .run(crm::crm_source(client, interval), shutdown.clone())
        .await;
    shutdown.trigger();
    if let Err(e) = signals.await {
        tracing::debug!(error = %e, "signal task ended abnormally");
    }
    result?;

    Ok(json!({ "bridge": CRM_CHANNEL, "stopped": true }))
}
