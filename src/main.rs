//! Honeypot - low-interaction TCP port honeypot
//!
//! Opens listeners on a set of ports, records every connection and closes
//! it without emulating a service. A loopback-only control port stops every
//! listener and removes the firewall rules that exposed them.

mod cli;
mod config;
mod db;
mod error;
mod events;
mod firewall;
mod handlers;

use anyhow::Result;
use clap::Parser;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::events::{FanoutSink, LogSink, SharedSink};
use crate::handlers::{ListenerManager, ManagerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_logging(&config.logging.level);

    match cli.command {
        Command::Start { ports, detach } => start(&cli.config, config, ports, detach).await,
        Command::Stop => stop(&config).await,
        Command::Events { limit } => print_events(&config, limit).await,
    }
}

/// Initialize logging based on LOG_FORMAT env var.
/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging; RUST_LOG overrides the level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn start(config_path: &str, config: Config, cli_ports: Vec<u16>, detach: bool) -> Result<()> {
    let ports = if cli_ports.is_empty() {
        config.listener.ports.clone()
    } else {
        cli_ports
    };
    if ports.contains(&0) {
        anyhow::bail!("Invalid port: 0 is not allowed");
    }
    config.check_control_port(&ports)?;

    if detach {
        let pid = spawn_detached(config_path, &ports)?;
        println!("Honeypot running in background (pid {})", pid);
        return Ok(());
    }

    info!("Starting Honeypot...");

    let mut sink = FanoutSink::new().with(Arc::new(LogSink));
    let mut write_task = None;
    if config.database.enabled {
        let db = db::Database::new(&config.database).await?;
        db.run_migrations().await?;
        info!("Database initialized");

        let (write_tx, handle) = db::start_write_buffer(Arc::new(db));
        sink = sink.with(Arc::new(db::DbSink::new(write_tx)));
        write_task = Some(handle);
    }
    let sink: SharedSink = Arc::new(sink);

    let firewall = firewall::from_config(&config.firewall);
    let mut manager = ListenerManager::new(ManagerSettings::from_config(&config), firewall, sink.clone());

    let report = manager.run(ports).await?;
    info!(
        stopped = report.stopped.len(),
        failed = report.failed.len(),
        timed_out = report.timed_out.len(),
        "Honeypot stopped"
    );

    // Abandoned listeners may still hold a sender, so the final flush is bounded
    drop(manager);
    drop(sink);
    if let Some(handle) = write_task {
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            warn!("Write buffer did not flush before exit");
        }
    }

    Ok(())
}

/// Re-run `start` as a background process with detached stdio
fn spawn_detached(config_path: &str, ports: &[u16]) -> Result<u32> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--config").arg(config_path).arg("start");
    if !ports.is_empty() {
        let list: Vec<String> = ports.iter().map(u16::to_string).collect();
        cmd.arg("--ports").arg(list.join(","));
    }
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child.id())
}

async fn stop(config: &Config) -> Result<()> {
    handlers::request_stop(config.control.port)
        .await
        .map_err(|e| anyhow::anyhow!("No honeypot answering on control port {}: {}", config.control.port, e))?;
    info!("Stop requested on control port {}", config.control.port);
    Ok(())
}

async fn print_events(config: &Config, limit: i32) -> Result<()> {
    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    let total = db.count_events().await?;
    let mut events = db.recent_events(limit).await?;
    events.reverse();
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    // stdout carries only the JSON lines
    eprintln!("{} of {} stored events", events.len(), total);
    Ok(())
}
