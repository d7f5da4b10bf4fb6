//! Relay CLI
//!
//! Command-line entry point for the Telegram relay bot.

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use relay_config::Config;
use relay_core::catalog::ModelCatalog;
use relay_core::throughput::HttpProbe;
use relay_core::{build_completion_service, RelayRuntime};
use relay_ipc::{EventBus, Messenger};
use relay_telegram::TelegramAdapter;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Telegram group-chat relay to a completion service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides `core.log_level`)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,

    /// Validate the config file and print a summary
    Check,

    /// List the model catalog
    Models,

    /// Run the HTTP speed probe once against `speedtest.probe_url`
    Probe {
        /// Upload payload size in bytes (defaults to `speedtest.payload_bytes`)
        #[arg(long)]
        bytes: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    let log_level = cli
        .log_level
        .unwrap_or_else(|| config.log_level().to_string());

    match cli.command {
        Commands::Start => {
            let data_dir = config.data_dir()?;
            let log_dir = data_dir.join("logs");
            let _logging_guard = logging::init_logging(&log_dir, &log_level)?;
            run(config).await?;
        }

        Commands::Check => {
            let catalog = ModelCatalog::from_config(&config.completion)?;
            println!("Config OK");
            println!("  account:     {}", config.telegram.account_tag());
            println!(
                "  bot handle:  {}",
                config
                    .telegram
                    .bot_username()
                    .map(|name| format!("@{}", name))
                    .unwrap_or_else(|| "(resolved at start)".to_string())
            );
            println!("  provider:    {:?}", config.completion.provider_type);
            println!("  models:      {}", catalog.entries().len());
            println!("  default:     {}", catalog.default_id());
            println!("  timeout:     {}s", config.completion.timeout_secs);
            println!("  selector:    {:?}", config.selector.source);
            println!(
                "  probe:       {}",
                config.speedtest.probe_url().unwrap_or("(none)")
            );
        }

        Commands::Models => {
            let catalog = ModelCatalog::from_config(&config.completion)?;
            for entry in catalog.entries() {
                let marker = if entry.id == catalog.default_id() {
                    "*"
                } else {
                    " "
                };
                println!("{} {:<24} {}", marker, entry.id, entry.label);
            }
        }

        Commands::Probe { bytes } => {
            logging::init_console_logging(&log_level);
            let url = config
                .speedtest
                .probe_url()
                .ok_or_else(|| anyhow!("speedtest.probe_url is not configured"))?;
            let probe = HttpProbe::new(url, Duration::from_secs(120))?;
            let report = probe
                .run(bytes.unwrap_or(config.speedtest.payload_bytes))
                .await?;
            println!("{}", report.render(&format!("Probe {}", url)));
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let (event_bus, inbound_rx) = EventBus::channel();
    let adapter = Arc::new(TelegramAdapter::new(&config.telegram)?.with_event_bus(event_bus));

    let identity = adapter
        .get_me()
        .await
        .context("failed to resolve bot identity via getMe")?;
    info!(bot_id = identity.id, "Authenticated as @{}", identity.username);

    let completion = build_completion_service(&config.completion)?;
    let runtime = Arc::new(RelayRuntime::new(
        &config,
        adapter.clone(),
        completion,
        identity,
    )?);

    let poller = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move { adapter.poll().await })
    };

    info!("Starting relay runtime...");
    tokio::select! {
        _ = Arc::clone(&runtime).run(inbound_rx) => {
            info!("Relay runtime stopped");
        }
        result = poller => {
            match result {
                Ok(Ok(())) => info!("Telegram poller stopped"),
                Ok(Err(e)) => return Err(e.context("telegram poller failed")),
                Err(e) => return Err(anyhow!("telegram poller aborted: {}", e)),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    Ok(())
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        Config::load(&path)
    } else if let Some(default_path) = Config::default_path() {
        Config::load(&default_path)
            .with_context(|| format!("failed to load {}", default_path.display()))
    } else {
        anyhow::bail!("No config file found")
    }
}
