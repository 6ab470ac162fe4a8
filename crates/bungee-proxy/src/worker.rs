//! Worker-side entry point and shutdown plumbing.
//!
//! A worker loads the config, binds the shared port, reports ready on
//! stdout, and serves until it receives a shutdown command on stdin or a
//! termination signal. Logs go to stderr; stdout belongs to the
//! supervisor protocol.

use crate::config::Config;
use crate::proxy::ProxyServer;
use crate::supervisor::{SupervisorCommand, WorkerReport};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run_worker(config_path: PathBuf, port: u16) -> Result<(), anyhow::Error> {
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            report(&WorkerReport::Error {
                error: e.to_string(),
            });
            return Err(e.into());
        }
    };

    let server = match ProxyServer::new(config, port).await {
        Ok(server) => server,
        Err(e) => {
            report(&WorkerReport::Error {
                error: e.to_string(),
            });
            return Err(e);
        }
    };

    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            report(&WorkerReport::Error {
                error: format!("failed to bind port {port}: {e}"),
            });
            return Err(e.into());
        }
    };

    report(&WorkerReport::Ready {
        pid: std::process::id(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_listener(shutdown_tx);

    let worker_id = std::env::var("BUNGEE_WORKER_ID").unwrap_or_default();
    info!(pid = std::process::id(), worker = %worker_id, "worker serving");
    server.run(listener, shutdown_rx).await
}

fn report(message: &WorkerReport) {
    match serde_json::to_string(message) {
        Ok(line) => println!("{line}"),
        Err(e) => error!("failed to serialize worker report: {e}"),
    }
}

/// One task owns every shutdown source: the supervisor's stdin command
/// and the worker's own SIGINT/SIGTERM handlers all trigger the same
/// drain.
fn spawn_shutdown_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");

        loop {
            tokio::select! {
                line = stdin_lines.next_line() => match line {
                    Ok(Some(line)) => {
                        match serde_json::from_str::<SupervisorCommand>(&line) {
                            Ok(SupervisorCommand::Shutdown) => {
                                info!("shutdown command received");
                                break;
                            }
                            Err(_) => continue,
                        }
                    }
                    // stdin closed: the supervisor is gone, keep serving
                    // until a signal arrives.
                    _ => {
                        sigwait(&mut sigint, &mut sigterm).await;
                        break;
                    }
                },
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
    });
}

async fn sigwait(
    sigint: &mut tokio::signal::unix::Signal,
    sigterm: &mut tokio::signal::unix::Signal,
) {
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}
