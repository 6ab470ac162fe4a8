//! ProxyServer struct and the worker accept loop.

use super::client::create_http_client;
use super::handler::{handle_request, AppState};
use super::network::create_reusable_listener;
use crate::config::Config;
use crate::expression::Evaluator;
use crate::health::{spawn_prober, spawn_recovery_listener, HealthRegistry};
use crate::routing::Router;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Bound on draining in-flight connections (open SSE streams included)
/// at worker shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(25);

/// One worker's server: compiled routes, shared client, health state.
pub struct ProxyServer {
    state: Arc<AppState>,
    port: u16,
}

impl ProxyServer {
    pub async fn new(config: Config, port: u16) -> Result<Self, anyhow::Error> {
        let router = Router::new(&config)?;
        let health = Arc::new(HealthRegistry::new(&config));

        // The prober gets its own client so probe traffic never contends
        // with request-path connections; recovery reports flow back over
        // a channel and flip registry entries.
        let (probe_tx, report_rx) = spawn_prober(create_http_client());
        spawn_recovery_listener(Arc::clone(&health), report_rx);

        let env: BTreeMap<String, String> = std::env::vars().collect();

        let upstream_timeout = std::env::var("UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let state = Arc::new(AppState {
            router,
            client: create_http_client(),
            evaluator: Arc::new(Evaluator::new()),
            health,
            probe_tx,
            body_limit: config.body_limit_bytes(),
            env: Arc::new(env),
            upstream_timeout,
        });

        Ok(Self { state, port })
    }

    /// Bind the shared port. Failure here is fatal for the worker.
    pub fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        create_reusable_listener(addr)
    }

    /// Accept connections until the shutdown signal flips, then drain.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), anyhow::Error> {
        info!("Listening on http://0.0.0.0:{}", self.port);

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = accepted?;
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&self.state);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, req).await }
                    });

                    let conn = http1::Builder::new().serve_connection(io, service);
                    let watched = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(err) = watched.await {
                            error!("Error serving connection from {}: {}", remote_addr, err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        // Stop accepting, then drain in-flight requests within the grace
        // period.
        drop(listener);
        info!("shutting down, draining in-flight connections");
        tokio::select! {
            _ = graceful.shutdown() => info!("all connections drained"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("grace period expired with connections still open");
            }
        }

        Ok(())
    }
}
