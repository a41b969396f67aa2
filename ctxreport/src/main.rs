//! ctxreport - context collection and reporting agent
//!
//! Samples ambient context (network connectivity, location) on a schedule,
//! buffers samples locally and reports them in batches to a context collector.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/ctxreport/samples.db (~/.local/share/ctxreport/samples.db)
//! - Logs: $XDG_STATE_HOME/ctxreport/ctxreport.log (~/.local/state/ctxreport/ctxreport.log)
//! - Config: $XDG_CONFIG_HOME/ctxreport/config.toml (~/.config/ctxreport/config.toml)

mod process_lock;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctxreport_core::source::location::LOCATION_TYPE_ID;
use ctxreport_core::source::network::NETWORK_TYPE_ID;
use ctxreport_core::source::{ContextSource, LocationSensor, NetworkSensor};
use ctxreport_core::{Config, ContextManager, ManagedSource, RefreshDelay, Session, StoreBackend};
use process_lock::acquire_reporter_guard;

#[derive(Parser)]
#[command(name = "ctxreport")]
#[command(about = "Collect and report device context")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/ctxreport/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Collector access token (overrides collector.token)
    #[arg(long, env = "CTXREPORT_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and buffered sample counts
    Status,

    /// Take one sample from every enabled source
    Collect,

    /// Deliver buffered samples to the collector once
    Report,

    /// Collect and report continuously until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard =
        ctxreport_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("ctxreport starting");

    let token = args.token.clone().or_else(|| config.collector.token.clone());

    match args.command {
        Command::Status => cmd_status(&config, token.is_some()),
        Command::Collect => cmd_collect(&config).await,
        Command::Report => cmd_report(&config, token).await,
        Command::Run => cmd_run(&config, token).await,
    }
}

/// Build every enabled source, each with its store in `backend`
fn build_sources(config: &Config, backend: &StoreBackend) -> Result<Vec<Arc<dyn ManagedSource>>> {
    let mut sources: Vec<Arc<dyn ManagedSource>> = Vec::new();

    let network = &config.sources.network;
    if network.enabled {
        let sensor =
            NetworkSensor::from_config(network).context("invalid [sources.network] settings")?;
        let settings = network
            .settings
            .to_source_config()
            .context("invalid [sources.network] settings")?;
        sources.push(Arc::new(ContextSource::open(sensor, settings, backend)));
    }

    let location = &config.sources.location;
    if location.enabled {
        let sensor =
            LocationSensor::from_config(location).context("invalid [sources.location] settings")?;
        let settings = location
            .settings
            .to_source_config()
            .context("invalid [sources.location] settings")?;
        sources.push(Arc::new(ContextSource::open(sensor, settings, backend)));
    }

    Ok(sources)
}

fn describe_delay(delay: RefreshDelay) -> String {
    match delay {
        RefreshDelay::OneTime => "once".to_string(),
        RefreshDelay::Every(d) => format!("{}ms", d.as_millis()),
    }
}

fn cmd_status(config: &Config, has_token: bool) -> Result<()> {
    println!("Context Report Configuration");
    println!("============================");
    println!();

    let collector = &config.collector;
    println!("Endpoint:        {}", collector.endpoint);
    println!(
        "Access Token:    {}",
        if has_token { "<set>" } else { "<not set>" }
    );
    println!("Report Delay:    {}ms", collector.report_delay_ms);
    println!("Timeout:         {}s", collector.timeout_secs);
    println!("Max Retries:     {}", collector.max_retries);
    println!();

    println!("Sources:");
    let network = &config.sources.network;
    println!(
        "  {:<20} enabled={:<5} refresh={} check={}",
        NETWORK_TYPE_ID,
        network.enabled,
        describe_delay(network.settings.refresh_delay),
        if network.hard_check { "http" } else { "tcp" }
    );
    let location = &config.sources.location;
    println!(
        "  {:<20} enabled={:<5} refresh={}",
        LOCATION_TYPE_ID,
        location.enabled,
        describe_delay(location.settings.refresh_delay)
    );
    println!();

    if config.storage.in_memory {
        println!("Storage:         in-memory (nothing buffered between runs)");
        return Ok(());
    }

    let db_path = config.database_path();
    println!("Database:        {}", db_path.display());
    if !db_path.exists() {
        println!("Buffered:        0 (database not created yet)");
        return Ok(());
    }

    let db = ctxreport_core::Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let counts = db.namespace_counts()?;
    if counts.is_empty() {
        println!("Buffered:        0");
    } else {
        println!("Buffered:");
        for (namespace, count) in counts {
            println!("  {:<20} {}", namespace, count);
        }
    }

    Ok(())
}

async fn cmd_collect(config: &Config) -> Result<()> {
    let backend = StoreBackend::open(config);
    let sources = build_sources(config, &backend)?;
    if sources.is_empty() {
        println!("No sources enabled.");
        return Ok(());
    }

    let mut failed = 0;
    for source in &sources {
        let outcome = match source.is_supported().await {
            Ok(()) => source.collect_once().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(key) => {
                let buffered = source.buffered_count().await.unwrap_or_default();
                println!(
                    "Collected {} at {} ({} buffered)",
                    source.type_id(),
                    key,
                    buffered
                );
            }
            Err(e) => {
                failed += 1;
                eprintln!("Failed to collect {}: {}", source.type_id(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} source(s) failed to collect", failed, sources.len());
    }
    Ok(())
}

async fn cmd_report(config: &Config, token: Option<String>) -> Result<()> {
    let Some(token) = token else {
        anyhow::bail!("no access token: set collector.token or CTXREPORT_TOKEN");
    };

    let _reporter = acquire_reporter_guard(&config.database_path())?;

    let backend = StoreBackend::open(config);
    let session = Arc::new(Session::with_token(token));
    let manager = ContextManager::from_config(&config.collector, session)
        .context("invalid [collector] settings")?;

    for source in build_sources(config, &backend)? {
        manager.adopt(source)?;
    }

    let summary = manager.report().await.context("context report failed")?;
    println!(
        "Reported {} sample(s) from {} source(s); {} deleted",
        summary.sent, summary.sources, summary.deleted
    );
    Ok(())
}

async fn cmd_run(config: &Config, token: Option<String>) -> Result<()> {
    let _reporter = acquire_reporter_guard(&config.database_path())?;

    let backend = StoreBackend::open(config);
    let session = Arc::new(Session::new());
    session.set_token(token);
    let manager = ContextManager::from_config(&config.collector, session)
        .context("invalid [collector] settings")?;

    for source in build_sources(config, &backend)? {
        let type_id = source.type_id().to_string();
        match manager.register_dyn(source).await {
            Ok(()) => println!("Registered {}", type_id),
            Err(e) => eprintln!("Skipping {}: {}", type_id, e),
        }
    }

    match manager.start_reporting().await {
        Ok(()) => println!(
            "Reporting every {}ms to {}",
            manager.report_delay().as_millis(),
            config.collector.endpoint
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Reporting disabled");
            eprintln!("Reporting disabled ({}); samples will be buffered", e);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    println!("Shutting down...");
    manager.shutdown().await;
    match manager.report().await {
        Ok(summary) => println!("Flushed {} sample(s)", summary.sent),
        Err(ctxreport_core::Error::Unauthenticated) => {}
        Err(e) => tracing::warn!(error = %e, "Final report failed"),
    }
    tracing::info!("ctxreport stopped");
    Ok(())
}
