//! Settlement Core Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Serve the HTTP API with the background scheduler
//! settlement-core serve
//!
//! # Custom config and port
//! settlement-core --config /path/to/config.toml serve --http-port 8096
//!
//! # One-off jobs
//! settlement-core sweep --dry-run
//! settlement-core settle-day 2025-03-31
//! settlement-core settle-wagers 2025-03-31
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use settlement_core::db::SettlementDb;
use settlement_core::scheduler::spawn_scheduler;
use settlement_core::services::category_service::SweepRequest;
use settlement_core::services::events::spawn_logging_listener;
use settlement_core::{Actor, Config, HttpServer, Services};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "settlement-core")]
#[command(about = "Revenue-split, ledger and daily ranking settlement engine")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "SETTLEMENT_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "SETTLEMENT_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the scheduler
    Serve {
        /// HTTP API port
        #[arg(long, env = "SETTLEMENT_HTTP_PORT")]
        http_port: Option<u16>,

        /// Do not start the background scheduler
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run one category sweep as the system actor
    Sweep {
        /// Report transitions without applying them
        #[arg(long)]
        dry_run: bool,
    },
    /// Settle rankings and the pot for a date (YYYY-MM-DD)
    SettleDay { date: NaiveDate },
    /// Settle the wagers of the month containing a settled date
    SettleWagers { date: NaiveDate },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("settlement_core=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Command::Serve { http_port: Some(port), .. } = &args.command {
        config.http_port = *port;
    }
    config.validate()?;

    let db = Arc::new(SettlementDb::open(&config.storage_dir)?);
    let services = Arc::new(Services::new(db.clone(), &config));
    let now = Utc::now();

    match args.command {
        Command::Serve { no_scheduler, .. } => serve(config, db, services, no_scheduler).await?,
        Command::Sweep { dry_run } => {
            let report = services.categories.sweep(
                &Actor::System,
                &SweepRequest {
                    dry_run,
                    category_ids: None,
                },
                now,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SettleDay { date } => {
            let settlement = services.rankings.settle_day(&Actor::System, date, now)?;
            println!("{}", serde_json::to_string_pretty(&settlement)?);
        }
        Command::SettleWagers { date } => {
            let report = services.rankings.settle_wagers(&Actor::System, date, now)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn serve(
    config: Config,
    db: Arc<SettlementDb>,
    services: Arc<Services>,
    no_scheduler: bool,
) -> anyhow::Result<()> {
    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        operators = config.authorized_operators.len(),
        "Starting settlement-core"
    );

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let _listener = spawn_logging_listener(services.events.clone());

    let scheduler = if no_scheduler {
        info!("Scheduler disabled via --no-scheduler");
        None
    } else {
        info!(interval_secs = config.sweep_interval_secs, "Scheduler enabled");
        Some(spawn_scheduler(
            services.clone(),
            Duration::from_secs(config.sweep_interval_secs.max(1)),
        ))
    };

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(services, db.clone(), http_addr));
    info!("HTTP API available at http://{}", http_addr);
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    if let Some(handle) = scheduler {
        handle.abort();
    }

    if let Ok(stats) = db.stats() {
        info!(
            events = stats.monetary_events,
            ledger_entries = stats.ledger_entries,
            pending = stats.pending_entries,
            settled_days = stats.settled_days,
            "Final settlement stats"
        );
    }

    Ok(())
}
