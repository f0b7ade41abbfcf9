//! `skillrelay twilio ...`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use skillrelay_bridge::{Bridge, BridgeConfig, CliRelay, Shutdown, listen_for_signals, push_channel};
use skillrelay_channels::twilio::{self, TwilioClient, TwilioConfig, TwilioSink, WebhookState};

use crate::cli::TwilioAction;
use crate::config::{self, Settings};
use crate::helpers;

const TWILIO_DIR: &str = "twilio";

const QUEUE_CAPACITY: usize = 64;

pub async fn run(action: TwilioAction, data_dir: &Path, settings: &Settings) -> Result<Value> {
    let dir = data_dir.join(TWILIO_DIR);
    match action {
        TwilioAction::Run {
            port,
            bind,
            auto,
            relay,
        } => {
            let bind = bind.unwrap_or_else(|| settings.twilio.bind.clone());
            let port = port.unwrap_or(settings.twilio.port);
            run_bridge(&dir, &bind, port, auto, relay.workdir, settings).await
        }
        TwilioAction::Status => helpers::bridge_status(&dir),
        TwilioAction::Stop => helpers::bridge_stop(&dir),
        TwilioAction::Inbox { limit } => helpers::inbox(&dir, limit),
        TwilioAction::Send {
            phone,
            message,
            media,
        } => {
            let config = TwilioConfig::load(&dir)?;
            let client = TwilioClient::new(&config);
            let sid = client.send_sms(&phone, &message, media.as_deref()).await?;
            Ok(json!({
                "success": true,
                "sid": sid,
                "to": phone,
                "from": client.from_number(),
                "body": message,
            }))
        }
    }
}

fn bridge(dir: &Path, config: &TwilioConfig, auto: bool, workdir: Option<PathBuf>, settings: &Settings) -> Result<Bridge> {
    let relay = twilio::relay_config(config::relay_base(&settings.relay, workdir)?);
    let client = Arc::new(TwilioClient::new(config));

    let mut bridge_config = BridgeConfig::new(TWILIO_DIR, dir);
    bridge_config.auto_respond = auto;
    bridge_config.allowed_senders = config.allowed_numbers.clone();

    Bridge::new(
        bridge_config,
        Arc::new(CliRelay::new(relay)),
        Arc::new(TwilioSink::new(client)),
        Arc::new(twilio::sms_prompt()),
    )
    .context("failed to load twilio bridge state")
}

async fn run_bridge(
    dir: &Path,
    bind: &str,
    port: u16,
    auto: bool,
    workdir: Option<PathBuf>,
    settings: &Settings,
) -> Result<Value> {
    helpers::ensure_not_running(dir)?;
    let config = TwilioConfig::load(dir)?;
    let bridge = Arc::new(bridge(dir, &config, auto, workdir, settings)?);

    let listener = TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    tracing::info!(
        phone = %config.phone_number,
        port,
        auto_respond = auto,
        allowed = config.allowed_numbers.len(),
        "starting sms bridge"
    );

    let (tx, source) = push_channel(QUEUE_CAPACITY);
    let shutdown = Shutdown::new();
    let signals = listen_for_signals(shutdown.clone())?;

    let state = Arc::new(WebhookState {
        tx,
        auto_respond: auto,
    });
    let server = tokio::spawn(twilio::serve_webhook(listener, state, shutdown.clone()));

    let result = Arc::clone(&bridge).run(source, shutdown.clone()).await;
    shutdown.trigger();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "webhook server failed"),
        Err(e) => tracing::warn!(error = %e, "webhook task ended abnormally"),
    }
    if let Err(e) = signals.await {
        tracing::debug!(error = %e, "signal task ended abnormally");
    }
    result?;

    Ok(json!({ "bridge": TWILIO_DIR, "stopped": true }))
}
