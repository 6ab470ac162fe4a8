//! The worker-pool supervisor.
//!
//! Spawns N worker processes sharing one listening port, watches the
//! config file, and performs zero-downtime rolling reloads: validate the
//! new document, then replace workers one at a time (stop-then-start),
//! rolling back on the first failed replacement.

mod protocol;

pub use protocol::{SupervisorCommand, WorkerReport};

use crate::config::Config;
use anyhow::{bail, Context};
use notify::Watcher;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Spacing between serial spawns; port reuse semantics on some
/// platforms only take effect after the first binder is live.
const SPAWN_DELAY: Duration = Duration::from_millis(100);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

pub struct SupervisorOptions {
    pub config_path: PathBuf,
    pub port: u16,
    pub worker_count: usize,
}

struct WorkerHandle {
    id: usize,
    child: Child,
    stdin: ChildStdin,
}

/// Boot the pool and serve until SIGINT/SIGTERM.
pub async fn run(opts: SupervisorOptions) -> Result<(), anyhow::Error> {
    // Startup validation is fatal; reload validation merely aborts the
    // reload later on.
    let config = Config::from_file(&opts.config_path)
        .with_context(|| format!("loading config from {:?}", opts.config_path))?;

    let mut supervisor = Supervisor {
        opts,
        config,
        workers: Vec::new(),
    };

    supervisor.boot().await?;
    supervisor.serve().await;
    supervisor.shutdown_all().await;
    Ok(())
}

struct Supervisor {
    opts: SupervisorOptions,
    #[allow(dead_code)] // swapped on successful reloads; read by operators via logs
    config: Config,
    workers: Vec<WorkerHandle>,
}

impl Supervisor {
    /// Spawn the initial pool, serially with a small delay between
    /// spawns. A worker that fails to come up aborts the boot.
    async fn boot(&mut self) -> Result<(), anyhow::Error> {
        info!(
            workers = self.opts.worker_count,
            port = self.opts.port,
            "booting worker pool"
        );
        for id in 0..self.opts.worker_count {
            if id > 0 {
                tokio::time::sleep(SPAWN_DELAY).await;
            }
            let worker = spawn_worker(&self.opts, id).await?;
            self.workers.push(worker);
        }
        Ok(())
    }

    /// Main loop: debounced config-change events trigger rolling
    /// reloads; SIGINT/SIGTERM ends the loop. Reloads run inline, so a
    /// second reload can never start while one is in progress.
    async fn serve(&mut self) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        // Held so recv() never yields None, even with watching disabled.
        let _keep_alive = event_tx.clone();
        let _watcher = match start_config_watcher(&self.opts.config_path, event_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("config watching disabled: {e}");
                None
            }
        };

        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    if event.is_none() {
                        continue;
                    }
                    debounce(&mut event_rx).await;
                    self.rolling_reload().await;
                }
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
    }

    /// Stop-then-start replacement of each worker in order. The new
    /// config is validated up front; a failed replacement aborts the
    /// reload, restores the torn-down worker, and leaves the rest of
    /// the pool untouched.
    async fn rolling_reload(&mut self) {
        info!("config change detected, validating new config");
        let new_config = match Config::from_file(&self.opts.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("reload aborted, previous config stays active: {e}");
                return;
            }
        };

        for idx in 0..self.workers.len() {
            let id = self.workers[idx].id;
            info!(worker = id, "recycling worker");
            shutdown_worker(&mut self.workers[idx]).await;

            match spawn_worker(&self.opts, id).await {
                Ok(replacement) => {
                    self.workers[idx] = replacement;
                }
                Err(e) => {
                    error!(worker = id, "replacement failed: {e}");
                    match spawn_worker(&self.opts, id).await {
                        Ok(restored) => {
                            self.workers[idx] = restored;
                            warn!(worker = id, "torn-down worker restored");
                        }
                        Err(e) => error!(worker = id, "failed to restore worker: {e}"),
                    }
                    error!("rolling reload failed; remaining workers were not touched");
                    return;
                }
            }
        }

        self.config = new_config;
        info!("rolling reload complete");
    }

    /// Parallel shutdown of the whole pool, each bounded individually.
    async fn shutdown_all(&mut self) {
        info!("shutting down worker pool");
        let shutdowns = self.workers.iter_mut().map(shutdown_worker);
        futures::future::join_all(shutdowns).await;
    }
}

/// Re-exec this binary as a worker and wait for its ready report.
async fn spawn_worker(
    opts: &SupervisorOptions,
    id: usize,
) -> Result<WorkerHandle, anyhow::Error> {
    let exe = std::env::current_exe().context("resolving current executable")?;

    let mut child = Command::new(exe)
        .arg("--role")
        .arg("worker")
        .env("BUNGEE_ROLE", "worker")
        .env("CONFIG_PATH", &opts.config_path)
        .env("PORT", opts.port.to_string())
        .env("BUNGEE_WORKER_ID", id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("spawning worker process")?;

    let stdin = child.stdin.take().context("worker stdin unavailable")?;
    let stdout = child.stdout.take().context("worker stdout unavailable")?;
    let mut lines = BufReader::new(stdout).lines();

    let report = tokio::time::timeout(READY_TIMEOUT, async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Ok(report) = serde_json::from_str::<WorkerReport>(&line) {
                        return Some(report);
                    }
                }
                _ => return None,
            }
        }
    })
    .await;

    match report {
        Ok(Some(WorkerReport::Ready { pid })) => {
            info!(worker = id, pid, "worker ready");
            // Keep draining stdout so the worker never blocks on a full
            // pipe.
            tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
            Ok(WorkerHandle { id, child, stdin })
        }
        Ok(Some(WorkerReport::Error { error })) => {
            let _ = child.kill().await;
            bail!("worker {id} failed to start: {error}");
        }
        Ok(None) => {
            let _ = child.kill().await;
            bail!("worker {id} exited before reporting ready");
        }
        Err(_) => {
            let _ = child.kill().await;
            bail!(
                "worker {id} did not become ready within {}s",
                READY_TIMEOUT.as_secs()
            );
        }
    }
}

/// Graceful stop: shutdown command, bounded wait for the natural exit,
/// then force-terminate.
async fn shutdown_worker(worker: &mut WorkerHandle) {
    let mut command = serde_json::to_string(&SupervisorCommand::Shutdown)
        .expect("command serializes");
    command.push('\n');

    if worker.stdin.write_all(command.as_bytes()).await.is_ok() {
        let _ = worker.stdin.flush().await;
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, worker.child.wait()).await {
        Ok(Ok(status)) => debug!(worker = worker.id, %status, "worker exited"),
        Ok(Err(e)) => warn!(worker = worker.id, "error waiting for worker exit: {e}"),
        Err(_) => {
            warn!(worker = worker.id, "shutdown timed out, force-terminating");
            let _ = worker.child.kill().await;
        }
    }
}

/// Watch the config path; any change event lands on the channel.
fn start_config_watcher(
    path: &PathBuf,
    event_tx: mpsc::UnboundedSender<()>,
) -> Result<notify::RecommendedWatcher, anyhow::Error> {
    let mut watcher =
        notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            if result.is_ok() {
                let _ = event_tx.send(());
            }
        })?;
    watcher.watch(path, notify::RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Absorb the burst of change events an editor save produces; returns
/// once the window stays quiet.
async fn debounce(event_rx: &mut mpsc::UnboundedReceiver<()>) {
    loop {
        match tokio::time::timeout(WATCH_DEBOUNCE, event_rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) => break,
            Err(_) => break,
        }
    }
}
