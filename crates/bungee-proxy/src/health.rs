//! Runtime upstream health tracking and recovery probing.
//!
//! Each route with failover enabled gets a worker-lifetime list of
//! `RuntimeUpstream` records. Request handlers flip them UNHEALTHY on
//! failure; only a successful recovery probe flips them back. Health
//! flags are atomics: selection may race with a flip, which is benign:
//! the losing request simply retries or fails over.

use crate::config::{Config, Upstream};
use crate::proxy::client::HttpClient;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A configured upstream plus its runtime health state.
#[derive(Debug)]
pub struct RuntimeUpstream {
    pub upstream: Upstream,
    pub route_path: String,
    /// Index into the route's configured upstream list.
    pub slot: usize,
    healthy: AtomicBool,
    last_failure_ms: AtomicU64,
    last_probe_ms: AtomicU64,
}

impl RuntimeUpstream {
    pub fn new(upstream: Upstream, route_path: String, slot: usize) -> Self {
        Self {
            upstream,
            route_path,
            slot,
            healthy: AtomicBool::new(true),
            last_failure_ms: AtomicU64::new(0),
            last_probe_ms: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.last_failure_ms.store(now_ms(), Ordering::Release);
        self.healthy.store(false, Ordering::Release);
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
    }

    pub fn last_failure_ms(&self) -> u64 {
        self.last_failure_ms.load(Ordering::Acquire)
    }

    /// Claim the right to dispatch one recovery probe. Succeeds at most
    /// once per `interval`, so repeated observations of an unhealthy
    /// upstream do not stampede the prober.
    pub fn try_claim_probe(&self, interval: Duration) -> bool {
        let now = now_ms();
        let last = self.last_probe_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < interval.as_millis() as u64 {
            return false;
        }
        self.last_probe_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-worker registry of runtime upstreams, keyed by route path.
/// Routes without failover are absent; they use transient copies.
pub struct HealthRegistry {
    routes: HashMap<String, Vec<Arc<RuntimeUpstream>>>,
}

impl HealthRegistry {
    pub fn new(config: &Config) -> Self {
        let mut routes = HashMap::new();
        for route in &config.routes {
            if !route.failover.enabled {
                continue;
            }
            let upstreams: Vec<Arc<RuntimeUpstream>> = route
                .upstreams
                .iter()
                .enumerate()
                .map(|(slot, u)| Arc::new(RuntimeUpstream::new(u.clone(), route.path.clone(), slot)))
                .collect();
            routes.insert(route.path.clone(), upstreams);
        }
        Self { routes }
    }

    pub fn upstreams_for(&self, route_path: &str) -> Option<&[Arc<RuntimeUpstream>]> {
        self.routes.get(route_path).map(|v| v.as_slice())
    }

    /// Flip the first unhealthy upstream with this target back to
    /// HEALTHY, across all routes. Returns whether anything changed.
    pub fn recover(&self, target: &str) -> bool {
        for upstreams in self.routes.values() {
            for upstream in upstreams {
                if upstream.upstream.target == target && !upstream.is_healthy() {
                    upstream.mark_healthy();
                    info!(target, route = %upstream.route_path, "upstream recovered");
                    return true;
                }
            }
        }
        false
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RuntimeUpstream>> {
        self.routes.values().flatten()
    }
}

/// Probe dispatch message: the request the prober should replay against
/// the unhealthy target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    pub target: String,
    pub retryable_status_codes: Vec<u16>,
    pub request_data: ProbeRequestData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequestData {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Posted back by the prober when a probe comes back clean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub status: String,
    pub target: String,
}

impl ProbeReport {
    pub fn recovered(target: &str) -> Self {
        Self {
            status: "recovered".to_string(),
            target: target.to_string(),
        }
    }
}

/// Spawn the recovery prober task. It shares nothing with the request
/// path except the two channels: probe requests in, recovery reports
/// out. Failed probes are silent.
pub fn spawn_prober(
    client: HttpClient,
) -> (
    mpsc::UnboundedSender<ProbeRequest>,
    mpsc::UnboundedReceiver<ProbeReport>,
) {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<ProbeRequest>();
    let (report_tx, report_rx) = mpsc::unbounded_channel::<ProbeReport>();

    tokio::spawn(async move {
        while let Some(probe) = request_rx.recv().await {
            let client = client.clone();
            let report_tx = report_tx.clone();
            tokio::spawn(async move {
                if let Some(status) = issue_probe(&client, &probe).await {
                    if !probe.retryable_status_codes.contains(&status) {
                        debug!(target = %probe.target, status, "probe succeeded");
                        let _ = report_tx.send(ProbeReport::recovered(&probe.target));
                    } else {
                        debug!(target = %probe.target, status, "probe still failing");
                    }
                }
            });
        }
    });

    (request_tx, report_rx)
}

async fn issue_probe(client: &HttpClient, probe: &ProbeRequest) -> Option<u16> {
    let method: hyper::Method = probe.request_data.method.parse().ok()?;
    let mut builder = Request::builder()
        .method(method)
        .uri(probe.request_data.url.as_str());
    for (name, value) in &probe.request_data.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let body_bytes = probe
        .request_data
        .body
        .as_ref()
        .map(|b| Bytes::from(b.clone()))
        .unwrap_or_default();
    let request = builder
        .body(BoxBody::new(
            Full::new(body_bytes).map_err(|never: Infallible| match never {}),
        ))
        .ok()?;

    match tokio::time::timeout(PROBE_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            // Drain the body so the connection can be reused.
            let _ = response.into_body().collect().await;
            Some(status)
        }
        _ => None,
    }
}

/// Spawn the report listener that applies recovery flips to the
/// registry.
pub fn spawn_recovery_listener(
    registry: Arc<HealthRegistry>,
    mut report_rx: mpsc::UnboundedReceiver<ProbeReport>,
) {
    tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            if report.status == "recovered" {
                registry.recover(&report.target);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(failover: bool) -> Config {
        serde_json::from_value(json!({
            "routes": [{
                "path": "/api",
                "upstreams": [
                    {"target": "http://a.example.com"},
                    {"target": "http://b.example.com"}
                ],
                "failover": {"enabled": failover, "retryableStatusCodes": [500]}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_registry_only_tracks_failover_routes() {
        let registry = HealthRegistry::new(&config(false));
        assert!(registry.upstreams_for("/api").is_none());

        let registry = HealthRegistry::new(&config(true));
        let upstreams = registry.upstreams_for("/api").unwrap();
        assert_eq!(upstreams.len(), 2);
        assert!(upstreams.iter().all(|u| u.is_healthy()));
    }

    #[test]
    fn test_health_transitions() {
        let registry = HealthRegistry::new(&config(true));
        let upstream = registry.upstreams_for("/api").unwrap()[0].clone();

        assert_eq!(upstream.last_failure_ms(), 0);
        upstream.mark_unhealthy();
        assert!(!upstream.is_healthy());
        assert!(upstream.last_failure_ms() > 0);

        assert!(registry.recover("http://a.example.com"));
        assert!(upstream.is_healthy());
        // Nothing left to recover.
        assert!(!registry.recover("http://a.example.com"));
    }

    #[test]
    fn test_recover_flips_first_match_only() {
        let registry = HealthRegistry::new(&config(true));
        for upstream in registry.iter() {
            upstream.mark_unhealthy();
        }
        registry.recover("http://b.example.com");
        let healthy: Vec<bool> = registry
            .upstreams_for("/api")
            .unwrap()
            .iter()
            .map(|u| u.is_healthy())
            .collect();
        assert_eq!(healthy, vec![false, true]);
    }

    #[test]
    fn test_probe_claim_rate_limited() {
        let registry = HealthRegistry::new(&config(true));
        let upstream = registry.upstreams_for("/api").unwrap()[0].clone();
        let interval = Duration::from_secs(30);

        assert!(upstream.try_claim_probe(interval));
        assert!(!upstream.try_claim_probe(interval));
    }

    #[test]
    fn test_probe_protocol_shapes() {
        let probe = ProbeRequest {
            target: "http://a".into(),
            retryable_status_codes: vec![500],
            request_data: ProbeRequestData {
                url: "http://a/v1/x".into(),
                method: "POST".into(),
                headers: vec![("content-type".into(), "application/json".into())],
                body: Some("{}".into()),
            },
        };
        let encoded = serde_json::to_value(&probe).unwrap();
        assert_eq!(encoded["retryableStatusCodes"], json!([500]));
        assert_eq!(encoded["requestData"]["url"], json!("http://a/v1/x"));

        let report = ProbeReport::recovered("http://a");
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"status": "recovered", "target": "http://a"})
        );
    }
}
