// src/main.rs

//! The main entry point for the clustercache node process.

use std::env;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

use clustercache::config::Config;
use clustercache::peer::PeerIdentity;
use clustercache::reload::{Coordinator, ProgressChecker};
use clustercache::server::{self, ServerContext};

#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = unix_signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    #[cfg(unix)]
    let mut sigterm = unix_signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("failed to install Ctrl-C handler");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, shutting down."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, shutting down."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, shutting down."); } } => {},
    }
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("clustercache version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {err}");
            std::process::exit(1);
        }
    };

    let local_id: u16 = args
        .iter()
        .position(|arg| arg == "--id")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    let local_ip: IpAddr = args
        .iter()
        .position(|arg| arg == "--bind")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

    // Reloadable filter layer so an RPC reload of the diagnostics level
    // (mirroring `proxy.config.diags.debug.*` in the original) can change
    // the effective log level at runtime without a restart.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let local = PeerIdentity { ip: local_ip, port: config.cluster.cluster_port, id: local_id };
    let listener = TcpListener::bind((local_ip, config.cluster.cluster_port))
        .await
        .with_context(|| format!("failed to bind cluster port {}", config.cluster.cluster_port))?;
    info!(port = config.cluster.cluster_port, id = local_id, "cluster node listening");

    let ctx = Arc::new(ServerContext::new(local, config.cluster.clone()));
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut background: JoinSet<clustercache::Result<()>> = JoinSet::new();

    server::spawn_all(listener, ctx, &shutdown_tx, &mut background);

    let coordinator = Arc::new(Coordinator::new());
    let progress_shutdown = {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let mut broadcast_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = broadcast_rx.recv().await;
            let _ = tx.send(true);
        });
        rx
    };
    let progress_checker = ProgressChecker::new(coordinator, config.reload.clone(), progress_shutdown);
    background.spawn(async move {
        progress_checker.run().await;
        Ok(())
    });

    await_shutdown_signal().await;
    let _ = shutdown_tx.send(());

    while let Some(res) = background.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%err, "background task returned an error"),
            Err(err) => error!(%err, "background task panicked"),
        }
    }

    Ok(())
}
