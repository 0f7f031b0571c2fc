//! garnet-server: Redis-compatible in-memory key-value server.
//!
//! Boot sequence: parse CLI + config file, load the RDB snapshot,
//! replay the AOF through the dispatcher, then serve. Periodic timers
//! drive the active expiration sweep, snapshotting and the AOF
//! auto-rewrite check. SIGINT/SIGTERM trigger a graceful shutdown:
//! final snapshot, AOF drain + fsync, exit 0.

mod config;
mod dispatcher;
mod listener;
mod replication;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use garnet_core::Engine;
use garnet_persistence::{aof::Aof, rdb};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::replication::{ReplicaClient, ReplicationHub};

/// How often the active expiration sweep runs, and how many TTL index
/// entries each tick may visit.
const EXPIRE_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const EXPIRE_SWEEP_STEPS: usize = 20;

/// Periodic snapshot interval when RDB is enabled.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// How often the AOF growth thresholds are checked.
const AUTO_REWRITE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "garnet-server", version, about = "Redis-compatible in-memory key-value server")]
struct Args {
    /// Port to listen on (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "garnet=info".into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // -h/--help and --version print and exit clean; anything
            // else is a usage error
            let clean = e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion;
            let _ = e.print();
            return if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE };
        }
    };

    let mut cfg = match &args.config {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(bind) = args.bind {
        cfg.bind_address = bind;
    }

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new();
    let rdb_opts = cfg.rdb_options();
    let aof = Arc::new(Aof::open(cfg.aof_options()?)?);
    let hub = Arc::new(ReplicationHub::new());
    let dispatcher = Arc::new(Dispatcher::new(
        engine.clone(),
        Arc::clone(&aof),
        rdb_opts.clone(),
        Arc::clone(&hub),
    ));

    // recovery: snapshot first, then the command log on top
    if rdb_opts.enabled {
        rdb::load(&rdb_opts.path(), &engine)?;
    }
    let replayer = Arc::clone(&dispatcher);
    aof.load(move |frame, _raw| replayer.replay(frame))?;

    if cfg.replica.enabled {
        ReplicaClient::start(engine.clone(), &cfg.replica);
    }

    let addr = format!("{}:{}", cfg.bind_address, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    tokio::spawn(listener::run(listener, Arc::clone(&dispatcher)));

    // periodic maintenance
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EXPIRE_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                engine.expire_scan_step(EXPIRE_SWEEP_STEPS);
            }
        });
    }
    if rdb_opts.enabled {
        let engine = engine.clone();
        let opts = rdb_opts.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                if let Err(e) = rdb::save(&opts.path(), &engine) {
                    error!("periodic snapshot failed: {e}");
                }
            }
        });
    }
    if aof.enabled() {
        let aof = Arc::clone(&aof);
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(AUTO_REWRITE_CHECK_INTERVAL);
            loop {
                tick.tick().await;
                if aof.should_auto_rewrite() {
                    info!(bytes = aof.live_size(), "aof growth threshold reached");
                    if let Err(e) = aof.bg_rewrite(engine.clone()) {
                        error!("auto rewrite failed to start: {e}");
                    }
                }
            }
        });
    }

    shutdown_signal().await;
    info!("shutting down");
    if rdb_opts.enabled {
        if let Err(e) = rdb::save(&rdb_opts.path(), &engine) {
            error!("final snapshot failed: {e}");
        }
    }
    aof.shutdown();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
