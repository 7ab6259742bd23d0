//! cf1400d - CF1400 vessel entrance report harvester.
//!
//! `cf1400d run` executes one reconciliation pass and exits; `cf1400d
//! serve` keeps the HTTP trigger surface up for schedulers and the
//! downstream PDF conversion step.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cf1400_harvester::api;
use cf1400_harvester::config::Config;
use cf1400_harvester::engine::ReconcileEngine;
use cf1400_harvester::fetcher::{FetchLimits, HttpFetcher};
use cf1400_harvester::history::SqliteHistoryStore;

#[derive(Parser)]
#[command(
    name = "cf1400d",
    version,
    about = "Harvests CF1400 vessel entrance PDF reports into a local archive"
)]
struct Cli {
    /// TOML config file (falls back to CF1400_CONFIG, then defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reconciliation pass, print the outcome as JSON, exit
    ///
    /// Exit code is non-zero only on hard failures; exhausted periods
    /// are normal near publication boundaries.
    Run {
        /// Write the outcome JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve the HTTP trigger surface
    Serve {
        /// Listen port (overrides config and PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { output } => run_once(config, output).await,
        Command::Serve { port } => serve(config, port).await,
    }
}

fn build_engine(config: &Config) -> Result<(Arc<SqliteHistoryStore>, Arc<ReconcileEngine>)> {
    let store = Arc::new(SqliteHistoryStore::open(&config.database_path)?);
    let fetcher = Arc::new(HttpFetcher::new(FetchLimits {
        timeout: config.fetch.timeout(),
        min_pdf_bytes: config.download.min_pdf_bytes,
        max_pdf_bytes: config.download.max_pdf_bytes,
    })?);
    let engine = ReconcileEngine::from_config(config, store.clone(), fetcher)?;
    Ok((store, Arc::new(engine)))
}

async fn run_once(config: Config, output: Option<PathBuf>) -> Result<()> {
    let (_store, engine) = build_engine(&config)?;

    let outcome = tokio::select! {
        result = engine.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            // In-flight probes are dropped; files and records on disk
            // stay consistent.
            warn!("Interrupted, aborting pass");
            std::process::exit(130);
        }
    };

    let json = serde_json::to_string_pretty(&outcome).context("Failed to encode outcome")?;
    match output {
        Some(path) => {
            std::fs::write(&path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Outcome written to {}", path.display());
        }
        None => println!("{}", json),
    }

    if outcome.has_hard_failures() {
        error!(
            "Pass completed with {} hard failure(s)",
            outcome.hard_failures.len()
        );
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(mut config: Config, port_override: Option<u16>) -> Result<()> {
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let (store, engine) = build_engine(&config)?;
    let app = api::create_router(store, engine).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚢 cf1400d listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

/// Initialize tracing with env-filter overrides
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cf1400_harvester=debug,cf1400d=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv::dotenv();

    // Also try the crate root .env (common when running with
    // --manifest-path from elsewhere)
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
