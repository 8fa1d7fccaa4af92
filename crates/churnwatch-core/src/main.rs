//! churnwatch CLI
//!
//! Command-line interface for the churnwatch alert engine.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use churnwatch::alerting::{notifier_from_config, AlertOrchestrator, PlainFormatter};
use churnwatch::api::HttpServer;
use churnwatch::config::LoggingConfig;
use churnwatch::db::Database;
use churnwatch::Config;

/// churnwatch - membership churn alerts and digests
#[derive(Parser)]
#[command(name = "churnwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "CHURNWATCH_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the periodic digest sweep
    Serve {
        /// HTTP API port (overrides server.http_port)
        #[arg(long, env = "CHURNWATCH_HTTP_PORT")]
        http_port: Option<u16>,

        /// Skip running migrations on startup
        #[arg(long)]
        no_migrate: bool,
    },

    /// Run a single digest sweep and exit
    Sweep {
        /// Evaluate schedules at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Check database connectivity
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let _guard = match init_logging(&config.logging, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Serve {
            http_port,
            no_migrate,
        } => run_serve(config, http_port, no_migrate).await,
        Commands::Sweep { at } => run_sweep(config, at).await,
        Commands::Db { command } => run_db(config, command).await,
        Commands::Config => print_config(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout = if config.format == "json" {
        fmt::layer().json().with_filter(filter()).boxed()
    } else {
        fmt::layer().pretty().with_filter(filter()).boxed()
    };

    let (file, guard) = match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "churnwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(guard)
}

fn install_metrics(config: &Config) -> anyhow::Result<()> {
    if config.server.metrics_port == 0 {
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.metrics_port)
        .parse()
        .context("invalid metrics listen address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn build_orchestrator(config: &Config, db: Database) -> anyhow::Result<AlertOrchestrator> {
    let notifier = notifier_from_config(&config.notifier, Arc::new(PlainFormatter))?;
    Ok(AlertOrchestrator::new(db, &config.alerting, notifier))
}

async fn run_serve(config: Config, http_port: Option<u16>, no_migrate: bool) -> anyhow::Result<()> {
    install_metrics(&config)?;

    let db = Database::new(&config)
        .await
        .context("failed to open database")?;
    if !no_migrate {
        db.migrate().await.context("failed to run migrations")?;
    }

    let orchestrator = Arc::new(build_orchestrator(&config, db.clone())?);
    let cancel = CancellationToken::new();

    let sweeper = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.start(cancel).await })
    };

    let addr = format!(
        "{}:{}",
        config.server.host,
        http_port.unwrap_or(config.server.http_port)
    );
    let server = HttpServer::new(db, orchestrator);
    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move { server.serve(&addr, cancel).await }
    });

    info!("churnwatch running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();

    server.await??;
    sweeper.await?;
    Ok(())
}

async fn run_sweep(config: Config, at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
    let db = Database::new(&config)
        .await
        .context("failed to open database")?;
    let orchestrator = build_orchestrator(&config, db)?;

    let at = at.unwrap_or_else(|| orchestrator.now());
    let report = orchestrator.run_digest_sweep(at).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    let db = Database::new(&config)
        .await
        .context("failed to open database")?;

    match command {
        DbCommands::Migrate => {
            db.migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Health => {
            db.health_check().await?;
            println!("Database: ok");
        }
    }
    Ok(())
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
