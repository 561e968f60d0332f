//! nettee: relay a local TCP/UDP port to a remote host and log both
//! directions of every connection.

mod addr;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Overrides, Settings};
use nettee_core::RelayEngine;
use output::OutputFormat;
use std::path::PathBuf;
use tracing::{error, info};

/// nettee: network tee
#[derive(Parser)]
#[command(
    name = "nettee",
    version,
    about = "Relay a local port to a remote host, duplicating both directions into logs"
)]
struct Cli {
    /// Append to the log files instead of truncating them
    #[arg(short, long)]
    append: bool,

    /// Keep accepting connections after the first one
    #[arg(short, long)]
    keep_listening: bool,

    /// Maximum simultaneous connections (implies --keep-listening; 0 = unbounded)
    #[arg(short = 'n', long, value_name = "N")]
    max_connections: Option<usize>,

    /// Relay UDP datagrams instead of TCP
    #[arg(short, long)]
    udp: bool,

    /// Close a direction after this many idle seconds (0 = never)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Copy buffer size in bytes
    #[arg(long, value_name = "BYTES")]
    buffer_size: Option<usize>,

    /// Log framing
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Config file path
    #[arg(long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// [bind_address:]port:host:hostport
    spec: String,

    /// Log for client→remote traffic (both directions if it is the only one)
    log_file: Option<PathBuf>,

    /// Log for remote→client traffic
    response_log_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            append: self.append,
            keep_listening: self.keep_listening,
            max_connections: self.max_connections,
            udp: self.udp,
            idle_timeout: self.idle_timeout,
            buffer_size: self.buffer_size,
            format: self.format,
        }
    }

    fn logs(&self) -> Vec<PathBuf> {
        self.log_file
            .iter()
            .chain(self.response_log_file.iter())
            .cloned()
            .collect()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Stdout is the default tee sink, so diagnostics go to stderr.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref(), &cli.overrides())?;
    let (bind, remote) = addr::parse_connection_spec(&cli.spec)?;
    let sinks = output::open_sinks(&cli.logs(), settings.append, settings.format).await?;

    let relay_config = settings.relay_config(bind, remote);
    relay_config.validate().context("invalid relay settings")?;

    info!(
        protocol = %relay_config.protocol,
        bind = %relay_config.bind,
        remote = %relay_config.remote,
        single_shot = relay_config.single_shot(),
        max_connections = relay_config.max_connections,
        "nettee starting"
    );

    let engine = RelayEngine::new(relay_config, sinks.send, sinks.recv);

    tokio::select! {
        result = engine.run() => {
            result?;
            info!("nettee finished");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
