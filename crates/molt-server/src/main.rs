use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use molt::{BindAddress, Coordinator, ExchangeClient, LoopExit};
use tracing::{info, warn};

mod admin;
mod app;
mod config;
mod telemetry;

use crate::config::{LogFormat, Overrides, ServerConfig};

/// molt - pre-forking server with zero-downtime generation handoff
#[derive(Parser)]
#[command(name = "molt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a generation, taking over from a running one if there is one
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to serve on (host:port or a socket path); repeatable
        #[arg(short, long = "bind")]
        bind: Vec<BindAddress>,

        /// Descriptor exchange socket path
        #[arg(short, long)]
        exchange: Option<PathBuf>,

        /// Admin HTTP front-end address
        #[arg(long)]
        admin: Option<BindAddress>,

        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Log output format
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },

    /// Ask the running generation who it is and what it holds
    Status {
        /// Descriptor exchange socket path
        #[arg(short, long)]
        exchange: PathBuf,

        /// Seconds to wait for the exchange to answer
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bind,
            exchange,
            admin,
            workers,
            log_format,
        } => run(
            config,
            Overrides {
                listen: bind,
                exchange_path: exchange,
                admin,
                workers,
                log_format,
            },
        ),
        Commands::Status { exchange, timeout } => status(exchange, Duration::from_secs(timeout)),
    }
}

/// Runs on the main thread without an async runtime: workers are forked
/// from here.
fn run(config_path: Option<PathBuf>, overrides: Overrides) -> Result<()> {
    let mut server_config = ServerConfig::load(config_path.as_deref())
        .context("Failed to load configuration")?;
    server_config
        .apply(overrides)
        .context("Invalid command-line option")?;

    telemetry::init(server_config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("molt starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    server_config.log_config();

    let hooks = app::hooks().context("Failed to register worker hooks")?;
    let mut coordinator = Coordinator::new(server_config.generation.clone(), Arc::new(app::EchoHandler))
        .with_hooks(hooks);
    if let Some(address) = server_config.admin.clone() {
        coordinator = coordinator.with_admin(Box::new(admin::AdminServer::new(address)));
    }

    let outcome = coordinator.run().context("Generation failed")?;
    match outcome.exit {
        LoopExit::NoChildren if !outcome.superseded => {
            warn!(pid = outcome.pid, "every worker exited and none can be spawned")
        }
        exit => info!(pid = outcome.pid, ?exit, superseded = outcome.superseded, "generation finished"),
    }
    if outcome.unreaped > 0 {
        anyhow::bail!("{} workers could not be reaped", outcome.unreaped);
    }
    Ok(())
}

fn status(exchange: PathBuf, timeout: Duration) -> Result<()> {
    let client = ExchangeClient::new(&exchange).with_timeout(timeout);

    let pid = client
        .request_pid()
        .with_context(|| format!("No generation answering on {}", exchange.display()))?;
    let addresses = client.request_addrs().context("Failed to list addresses")?;
    let handoff = client
        .request_handoff_addr()
        .context("Failed to get handoff address")?;

    println!("pid:      {pid}");
    println!("handoff:  {}", handoff.display());
    println!("addresses:");
    for address in addresses {
        println!("  {address}");
    }
    Ok(())
}
