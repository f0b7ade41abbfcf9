//! CLI entry point for SkillRelay.
//!
//! This binary provides the `skillrelay` command: OAuth token management
//! under `auth`, and `run` / `status` / `stop` / `inbox` style subcommands
//! for each chat bridge. Every invocation prints one JSON object on stdout
//! and exits 1 when that object reports an error.

mod auth_commands;
mod cli;
mod config;
mod crm_commands;
mod helpers;
mod slack_commands;
mod twilio_commands;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    helpers::init_tracing(cli.command.default_log_level());

    let output = match dispatch(cli.command).await {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            helpers::error_json(&e)
        }
    };

    helpers::print_json(&output);
    if helpers::is_failure(&output) {
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands) -> Result<Value> {
    let data_dir = config::data_dir()?;
    let settings = config::load_settings(&data_dir);

    match command {
        Commands::Auth { action } => auth_commands::run(action, &data_dir).await,
        Commands::Crm { action } => crm_commands::run(action, &data_dir, &settings).await,
        Commands::Slack { action } => slack_commands::run(action, &data_dir, &settings).await,
        Commands::Twilio { action } => twilio_commands::run(action, &data_dir, &settings).await,
    }
}
