//! Courier engine - main entry point.
//!
//! - `run`: start the production from a config file, reload on SIGHUP,
//!   drain and stop on Ctrl+C.
//! - `worker`: serve one isolated host over stdin/stdout (spawned by the
//!   engine for `isolated_process` items).
//! - `check`: validate a config file and exit.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use courier_core::engine::{JsonFileSource, ProductionEngine};
use courier_core::observability::init_tracing;
use courier_core::supervisor::serve_stdio;
use courier_core::types::{IsolationConfig, ObservabilityConfig};
use courier_core::{Config, HostCatalog, ParserRegistry};

/// Courier message routing engine
#[derive(Parser, Debug)]
#[command(name = "courier-engine")]
#[command(about = "Message routing engine for healthcare integration")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the production described by a config file
    Run {
        #[arg(long, env = "COURIER_CONFIG")]
        config: PathBuf,
    },
    /// Serve one isolated host over stdio
    Worker {
        /// Maximum frame payload size in bytes
        #[arg(long, env = "COURIER_MAX_FRAME_BYTES")]
        max_frame_bytes: Option<u32>,
    },
    /// Validate a config file
    Check {
        #[arg(long, env = "COURIER_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    match args.command {
        Command::Run { config } => run(config).await,
        Command::Worker { max_frame_bytes } => {
            init_tracing(&ObservabilityConfig::default());
            let mut isolation = IsolationConfig::default();
            if let Some(max) = max_frame_bytes {
                isolation.max_frame_bytes = max;
            }
            serve_stdio(
                &HostCatalog::with_builtins(),
                Arc::new(ParserRegistry::with_builtins()),
                &isolation,
            )
            .await?;
            Ok(())
        }
        Command::Check { config } => {
            let loaded = Config::from_json_file(&config)?;
            println!(
                "{}: production '{}' with {} items is valid",
                config.display(),
                loaded.production.name,
                loaded.production.items.len()
            );
            Ok(())
        }
    }
}

async fn run(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_json_file(&path)?;
    init_tracing(&config.observability);

    let engine = ProductionEngine::builder().config(&config).build();
    engine.start(config.production.clone()).await?;
    tracing::info!(config = %path.display(), "courier engine running");

    let source = JsonFileSource::new(&path);
    wait_for_shutdown(&engine, &source).await;

    tracing::info!("shutdown signal received, draining");
    let reports = engine.shutdown().await;
    for report in &reports {
        tracing::info!(
            item = %report.item,
            drained_cleanly = report.drained_cleanly,
            abandoned = report.abandoned,
            dead_lettered = report.dead_lettered,
            "host stopped"
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(engine: &ProductionEngine, source: &JsonFileSource) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            tracing::warn!(error = %err, "SIGHUP reload unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => match engine.reload_from(source).await {
                Ok(report) => tracing::info!(?report, "configuration reloaded"),
                Err(err) => tracing::error!(error = %err, "reload rejected, keeping current graph"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_engine: &ProductionEngine, _source: &JsonFileSource) {
    let _ = tokio::signal::ctrl_c().await;
}
