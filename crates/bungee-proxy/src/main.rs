// Allow dead_code for the binary target - some library surface is only
// exercised by tests
#![allow(dead_code)]

//! Bungee - a programmable reverse HTTP proxy
//!
//! Bungee matches inbound requests against configured routes, selects an
//! upstream by weighted + priority load balancing with failover, applies
//! a layered chain of request/response mutations (headers, JSON bodies,
//! path rewrites, API-format transformations, SSE rewriting), and
//! forwards the request. A supervisor process manages a pool of workers
//! sharing one port and rolls them over on config changes.
//!
//! # Examples
//!
//! ```bash
//! bungee                                  # Supervisor on port 8088, config.json
//! bungee --config proxy.json --port 9000  # Explicit config and port
//! WORKER_COUNT=4 bungee                   # Four workers
//! ```

mod balance;
mod config;
mod expression;
mod health;
mod proxy;
mod routing;
mod rules;
mod supervisor;
mod transformer;
mod worker;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const WORKER_COUNT_CAP: usize = 32;

/// Bungee - programmable reverse HTTP proxy with rolling reloads
#[derive(Parser, Debug)]
#[command(name = "bungee")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path (falls back to ./config.json, ~/.bungee/config.json)
    #[arg(long, value_name = "FILE", env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listening port shared by all workers
    #[arg(long, default_value = "8088", env = "PORT")]
    port: u16,

    /// Worker pool size (capped at 32)
    #[arg(long, default_value = "2", env = "WORKER_COUNT")]
    workers: usize,

    /// Log level (trace, debug, info, warn, error, fatal)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Process role; `worker` is used internally by the supervisor
    #[arg(long, default_value = "master", env = "BUNGEE_ROLE")]
    role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Master,
    Worker,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Install default cryptographic provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    // Workers log to stderr only: stdout carries the supervisor protocol.
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config_path = config::resolve_config_path(cli.config.clone())?;

    match cli.role {
        Role::Master => run_master(cli, config_path),
        Role::Worker => run_worker_role(cli, config_path),
    }
}

fn run_master(cli: Cli, config_path: PathBuf) -> Result<(), anyhow::Error> {
    let worker_count = cli.workers.clamp(1, WORKER_COUNT_CAP);
    info!(
        port = cli.port,
        workers = worker_count,
        config = %config_path.display(),
        "starting Bungee supervisor"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(supervisor::run(supervisor::SupervisorOptions {
        config_path,
        port: cli.port,
        worker_count,
    }))
}

fn run_worker_role(cli: Cli, config_path: PathBuf) -> Result<(), anyhow::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(worker::run_worker(config_path, cli.port))
}
