//! streamgate Agent Daemon
//!
//! Connects every configured account to its chat service and answers
//! inbound messages with streamed replies. The bundled pipeline echoes the
//! message back word by word; embedders plug in their own through the
//! library.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sg_agent::dispatch::{EchoPipeline, ReplyPipeline};
use sg_agent::AccountRuntime;
use sg_core::config::{self, AccountConfig, AgentConfig};
use sg_core::AccountId;

#[derive(Parser)]
#[command(name = "sg-agent")]
#[command(about = "streamgate agent - streams chat replies over one websocket per account")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Websocket endpoint for the selected account
    /// Example: wss://chat.example.com/agent
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Bearer credential for the selected account
    #[arg(short, long, env = "STREAMGATE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Account the overrides apply to (created if missing)
    #[arg(short, long, default_value = "default")]
    account: String,

    /// Pause between echoed words, in milliseconds
    #[arg(long, default_value_t = 0)]
    echo_delay_ms: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("streamgate agent starting...");

    // Load configuration
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config: AgentConfig = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::debug!("No config at {:?}, using command-line settings", config_path);
        AgentConfig::default()
    };

    apply_overrides(&mut config, &args);
    if config.accounts.is_empty() {
        anyhow::bail!(
            "No accounts configured. Pass --endpoint and --token, or add an [[accounts]] entry to {:?}",
            config_path
        );
    }

    let pipeline: Arc<dyn ReplyPipeline> = Arc::new(EchoPipeline::with_delay(
        Duration::from_millis(args.echo_delay_ms),
    ));

    let mut runtimes = Vec::with_capacity(config.accounts.len());
    for account in config.accounts {
        let account_id = account.account_id.clone();
        let runtime = AccountRuntime::start(account, Arc::clone(&pipeline))
            .with_context(|| format!("Failed to start account {}", account_id))?;
        runtimes.push(runtime);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down...");

    for runtime in runtimes {
        runtime.shutdown().await;
    }
    Ok(())
}

/// Apply `--endpoint`/`--token` to the account named by `--account`
fn apply_overrides(config: &mut AgentConfig, args: &Args) {
    if args.endpoint.is_none() && args.token.is_none() {
        return;
    }

    let account_id = AccountId::new(args.account.clone());
    let index = match config
        .accounts
        .iter()
        .position(|a| a.account_id == account_id)
    {
        Some(index) => index,
        None => {
            config.accounts.push(AccountConfig {
                account_id,
                ..AccountConfig::default()
            });
            config.accounts.len() - 1
        }
    };

    let account = &mut config.accounts[index];
    if let Some(endpoint) = &args.endpoint {
        account.endpoint = endpoint.clone();
    }
    if let Some(token) = &args.token {
        account.credential = Some(token.clone());
    }
}
