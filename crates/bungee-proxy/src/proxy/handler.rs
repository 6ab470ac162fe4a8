//! The per-request pipeline.
//!
//! Each request flows through: short-circuits (`/health`, admin prefix),
//! route match, healthy-upstream snapshot, weighted first-try pick, the
//! layered rule application (route + upstream outer layer, transformer
//! inner layer), the upstream call, and response shaping, with failover
//! iteration over the retry queue on transport errors and retryable
//! statuses.

use super::client::HttpClient;
use super::sse::SseTransformer;
use crate::balance::{retry_queue, select_upstream};
use crate::config::ModificationRules;
use crate::expression::{Evaluator, RequestContext, UrlParts};
use crate::health::{HealthRegistry, ProbeRequest, ProbeRequestData, RuntimeUpstream};
use crate::routing::{CompiledRoute, CompiledUpstream, Router};
use crate::rules::{apply_body_rules, apply_header_rules};
use crate::transformer::{self, CompiledTransformer};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Frame};
use hyper::header::{
    HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Reserved prefix for the admin surface. The surface itself is an
/// external collaborator; without one mounted these requests 404.
const ADMIN_PREFIX: &str = "/__bungee";

/// Per-worker state shared by all request handlers.
pub struct AppState {
    pub router: Router,
    pub client: HttpClient,
    pub evaluator: Arc<Evaluator>,
    pub health: Arc<HealthRegistry>,
    pub probe_tx: mpsc::UnboundedSender<ProbeRequest>,
    pub body_limit: u64,
    pub env: Arc<BTreeMap<String, String>>,
    pub upstream_timeout: Option<Duration>,
}

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Helper to create a JSON error response.
pub fn error_response(status: u16, message: &str) -> ProxyResponse {
    let body = format!(r#"{{"error":"{message}"}}"#);
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(boxed_full(Bytes::from(body)))
        .unwrap()
}

fn boxed_full(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    BoxBody::new(Full::new(bytes).map_err(|never: Infallible| match never {}))
}

/// Entry point for every inbound request.
pub async fn handle_request(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> Result<ProxyResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!("Received request: {} {}", method, path);

    if path == "/health" {
        let body = serde_json::json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(boxed_full(Bytes::from(body.to_string())))
            .unwrap());
    }

    if path.starts_with(ADMIN_PREFIX) {
        return Ok(error_response(404, "admin surface not mounted"));
    }

    let Some(route) = state.router.match_route(&path) else {
        return Ok(error_response(404, "Route not found"));
    };

    // Snapshot the healthy candidates. Failover routes read the
    // worker-lifetime registry; other routes get transient copies.
    let registry_backed = state.health.upstreams_for(&route.config.path).is_some();
    let candidates: Vec<Arc<RuntimeUpstream>> = match state.health.upstreams_for(&route.config.path)
    {
        Some(list) => {
            for unhealthy in list.iter().filter(|u| !u.is_healthy()) {
                dispatch_probe(
                    &state,
                    route,
                    unhealthy,
                    &method,
                    &path,
                    query.as_deref(),
                    req.headers(),
                    None,
                );
            }
            list.iter().filter(|u| u.is_healthy()).cloned().collect()
        }
        None => route
            .config
            .upstreams
            .iter()
            .enumerate()
            .map(|(slot, u)| {
                Arc::new(RuntimeUpstream::new(u.clone(), route.config.path.clone(), slot))
            })
            .collect(),
    };

    if candidates.is_empty() {
        return Ok(error_response(503, "Service Unavailable"));
    }

    // Collect the request body up to the configured cap.
    let (parts, body) = req.into_parts();
    let body_bytes = match Limited::new(body, state.body_limit as usize).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                return Ok(error_response(413, "Payload too large"));
            }
            return Ok(error_response(400, "Failed to read request body"));
        }
    };

    let (parsed_body, body_is_json) = parse_request_body(&body_bytes);
    let streaming = parsed_body.get("stream").map(is_truthy).unwrap_or(false);

    let first = {
        let mut rng = rand::thread_rng();
        select_upstream(&candidates, &mut rng)
    };
    let Some(first) = first else {
        return Ok(error_response(503, "Service Unavailable"));
    };

    let mut attempts = Vec::with_capacity(candidates.len());
    attempts.push(Arc::clone(&first));
    attempts.extend(retry_queue(&candidates, &first));

    for upstream in attempts {
        let outcome = try_upstream(
            &state,
            route,
            &upstream,
            &parts,
            &body_bytes,
            &parsed_body,
            body_is_json,
            streaming,
            &path,
            query.as_deref(),
        )
        .await;

        match outcome {
            Outcome::Respond(response) => return Ok(response),
            Outcome::Retry => {
                warn!(
                    target = %upstream.upstream.target,
                    route = %route.config.path,
                    "upstream attempt failed, trying next candidate"
                );
                if registry_backed {
                    upstream.mark_unhealthy();
                    dispatch_probe(
                        &state,
                        route,
                        &upstream,
                        &method,
                        &path,
                        query.as_deref(),
                        &parts.headers,
                        Some(&body_bytes),
                    );
                }
                if !route.config.failover.enabled {
                    break;
                }
            }
        }
    }

    Ok(error_response(503, "Service Unavailable"))
}

enum Outcome {
    Respond(ProxyResponse),
    Retry,
}

/// One full attempt against a single upstream: URL construction, the
/// request-side rule layers, the forward, and response shaping.
#[allow(clippy::too_many_arguments)]
async fn try_upstream(
    state: &Arc<AppState>,
    route: &CompiledRoute,
    upstream: &Arc<RuntimeUpstream>,
    parts: &hyper::http::request::Parts,
    body_bytes: &Bytes,
    parsed_body: &Value,
    body_is_json: bool,
    streaming: bool,
    path: &str,
    query: Option<&str>,
) -> Outcome {
    let compiled: &CompiledUpstream = &route.upstreams[upstream.slot];

    let target = match compiled.config.target_parts() {
        Ok(target) => target,
        Err(e) => {
            error!(target = %compiled.config.target, "unusable upstream target: {e}");
            return Outcome::Retry;
        }
    };

    // Route-level path rewrite, then the request context over the
    // rewritten path.
    let mut pathname = route.rewrite_path(path);
    let mut search = query.map(|q| format!("?{q}")).unwrap_or_default();

    let mut ctx = RequestContext {
        headers: lowercase_headers(&parts.headers),
        body: parsed_body.clone(),
        url: UrlParts {
            pathname: pathname.clone(),
            search: search.clone(),
            host: target.host.clone(),
            protocol: target.scheme.clone(),
        },
        method: parts.method.as_str().to_string(),
        env: Arc::clone(&state.env),
        stream: None,
    };

    let active_transformer: Option<&CompiledTransformer> = compiled
        .transformer
        .as_deref()
        .and_then(|chain| transformer::select(chain, &pathname));

    // Outer layer (route + upstream) body rules. Tracking whether the
    // body was actually rewritten lets untouched requests pass through
    // byte-identical.
    let mut body_mutated = false;
    if body_is_json && !compiled.outer_body.is_empty() {
        ctx.body = apply_body_rules(
            ctx.body.clone(),
            &compiled.outer_body,
            &ctx,
            &state.evaluator,
        )
        .into_single();
        body_mutated = true;
    }

    // Transformer layer: path rewrite, then request-side body rules.
    if let Some(t) = active_transformer {
        match state.evaluator.render_str(&t.path_replace, &ctx) {
            Ok(replacement) => {
                let replacement = match replacement {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let rewritten = t
                    .path_match
                    .replace(&pathname, replacement.as_str())
                    .into_owned();
                match rewritten.split_once('?') {
                    Some((p, q)) => {
                        pathname = p.to_string();
                        search = format!("?{q}");
                    }
                    None => pathname = rewritten,
                }
                info!(
                    original = %ctx.url.pathname,
                    rewritten = %pathname,
                    "transformer path rewrite"
                );
                ctx.url.pathname = pathname.clone();
                ctx.url.search = search.clone();
            }
            Err(e) => error!("transformer path rewrite skipped: {e}"),
        }

        if body_is_json {
            if let Some(ref body_rules) = t.request.body {
                ctx.body =
                    apply_body_rules(ctx.body.clone(), body_rules, &ctx, &state.evaluator)
                        .into_single();
                body_mutated = true;
            }
        }
    }

    // Final request headers: outer merged with transformer, applied after the
    // Host drop.
    let header_rules = ModificationRules::merge_opt(
        Some(&compiled.outer_headers),
        active_transformer.and_then(|t| t.request.headers.as_ref()),
    );

    let mut headers = parts.headers.clone();
    headers.remove(HOST);
    apply_header_rules(&mut headers, &header_rules, &ctx, &state.evaluator);

    let out_bytes: Bytes = if body_is_json && body_mutated {
        match serde_json::to_vec(&ctx.body) {
            Ok(serialized) => Bytes::from(serialized),
            Err(e) => {
                error!("failed to serialize request body: {e}");
                return Outcome::Retry;
            }
        }
    } else {
        body_bytes.clone()
    };

    set_body_framing(&mut headers, body_is_json, body_mutated, out_bytes.len());

    let uri_text = format!(
        "{}://{}{}{}{}",
        target.scheme, target.host, target.base_path, pathname, search
    );
    let uri: hyper::Uri = match uri_text.parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!(uri = %uri_text, "constructed an invalid upstream URI: {e}");
            return Outcome::Retry;
        }
    };

    debug!("Forwarding to: {}", uri);

    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(boxed_full(out_bytes))
        .expect("request construction from verified parts");
    *upstream_req.headers_mut() = headers;

    let call = state.client.request(upstream_req);
    let result = match state.upstream_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(target = %compiled.config.target, "upstream call timed out");
                return Outcome::Retry;
            }
        },
        None => call.await,
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            error!(target = %compiled.config.target, "upstream request failed: {e}");
            return Outcome::Retry;
        }
    };

    let status = response.status();
    if route.config.failover.enabled
        && route
            .config
            .failover
            .retryable_status_codes
            .contains(&status.as_u16())
    {
        info!(
            target = %compiled.config.target,
            status = status.as_u16(),
            "retryable status from upstream"
        );
        return Outcome::Retry;
    }

    shape_response(state, compiled, active_transformer, ctx, response, streaming).await
}

/// Response side: match the transformer response rule, then either
/// attach the SSE transformer or rewrite the buffered body.
async fn shape_response(
    state: &Arc<AppState>,
    compiled: &CompiledUpstream,
    active_transformer: Option<&CompiledTransformer>,
    mut ctx: RequestContext,
    response: Response<hyper::body::Incoming>,
    streaming: bool,
) -> Outcome {
    let (mut parts, body) = response.into_parts();
    let status = parts.status.as_u16();

    parts.headers.remove(TRANSFER_ENCODING);
    parts.headers.remove(CONTENT_ENCODING);

    let response_rule =
        active_transformer.and_then(|t| t.match_response(status, &parts.headers));

    if streaming {
        let stream_rules = response_rule.and_then(|rule| rule.rules.stream.clone());
        return match stream_rules {
            Some(rules) => {
                parts.headers.remove(CONTENT_LENGTH);
                let transformer =
                    SseTransformer::new(rules, Arc::clone(&state.evaluator), ctx);
                Outcome::Respond(Response::from_parts(parts, pipe_sse(body, transformer)))
            }
            // No stream rules configured: raw passthrough.
            None => Outcome::Respond(Response::from_parts(parts, BoxBody::new(body))),
        };
    }

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("failed to read upstream response body: {e}");
            return Outcome::Retry;
        }
    };

    let is_json = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    let shaped: Bytes = if is_json {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(parsed) => {
                let rules = ModificationRules::merge_opt(
                    Some(&compiled.outer_response),
                    response_rule.and_then(|rule| rule.rules.default.as_ref()),
                );
                if rules.is_empty() {
                    bytes
                } else {
                    ctx.body = parsed.clone();
                    ctx.stream = None;
                    let rewritten =
                        apply_body_rules(parsed, &rules, &ctx, &state.evaluator).into_single();
                    match serde_json::to_vec(&rewritten) {
                        Ok(serialized) => Bytes::from(serialized),
                        Err(_) => bytes,
                    }
                }
            }
            // Unparseable JSON: return the raw text unmodified.
            Err(_) => bytes,
        }
    } else {
        bytes
    };

    if let Ok(value) = shaped.len().to_string().parse() {
        parts.headers.insert(CONTENT_LENGTH, value);
    }

    Outcome::Respond(Response::from_parts(parts, boxed_full(shaped)))
}

/// Pipe the upstream SSE body through the transformer, frame by frame.
fn pipe_sse(
    body: hyper::body::Incoming,
    mut transformer: SseTransformer,
) -> BoxBody<Bytes, hyper::Error> {
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(16);

    tokio::spawn(async move {
        let mut body = body;
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("upstream stream interrupted: {e}");
                    break;
                }
            };
            if let Some(data) = frame.data_ref() {
                let out = transformer.push(data);
                if !out.is_empty()
                    && tx.send(Ok(Frame::data(Bytes::from(out)))).await.is_err()
                {
                    // Client went away.
                    return;
                }
            }
        }

        let tail = transformer.finish();
        if !tail.is_empty() {
            let _ = tx.send(Ok(Frame::data(Bytes::from(tail)))).await;
        }
    });

    BoxBody::new(http_body_util::StreamBody::new(ReceiverStream::new(rx)))
}

/// Schedule a recovery probe replaying the observed request against the
/// unhealthy target. Rate-limited per upstream by the route's health
/// check interval.
#[allow(clippy::too_many_arguments)]
fn dispatch_probe(
    state: &Arc<AppState>,
    route: &CompiledRoute,
    upstream: &Arc<RuntimeUpstream>,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Option<&Bytes>,
) {
    if !route.config.health_check.enabled {
        return;
    }
    let interval = Duration::from_secs(route.config.health_check.interval_seconds.max(1));
    if !upstream.try_claim_probe(interval) {
        return;
    }

    let target = upstream.upstream.target.trim_end_matches('/').to_string();
    let url = match query {
        Some(q) => format!("{target}{path}?{q}"),
        None => format!("{target}{path}"),
    };

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| *name != HOST && *name != CONTENT_LENGTH)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let probe = ProbeRequest {
        target: upstream.upstream.target.clone(),
        retryable_status_codes: route.config.failover.retryable_status_codes.clone(),
        request_data: ProbeRequestData {
            url,
            method: method.as_str().to_string(),
            headers: header_pairs,
            body: body
                .filter(|b| !b.is_empty())
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        },
    };

    debug!(target = %probe.target, "dispatching recovery probe");
    let _ = state.probe_tx.send(probe);
}

/// Content-Length bookkeeping for the outgoing request: a rewritten
/// JSON body gets its new byte length; empty and non-JSON bodies lose
/// the client's header so the transport re-frames from the actual
/// bytes; an untouched JSON body keeps the original header.
fn set_body_framing(
    headers: &mut HeaderMap,
    body_is_json: bool,
    body_mutated: bool,
    body_len: usize,
) {
    if body_is_json && body_mutated {
        if let Ok(value) = body_len.to_string().parse() {
            headers.insert(CONTENT_LENGTH, value);
        }
    } else if !body_is_json {
        headers.remove(CONTENT_LENGTH);
    }
}

fn parse_request_body(bytes: &Bytes) -> (Value, bool) {
    if bytes.is_empty() {
        return (Value::Object(serde_json::Map::new()), false);
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(parsed) => (parsed, true),
        Err(e) => {
            warn!("request body is not JSON, continuing with empty context body: {e}");
            (Value::Object(serde_json::Map::new()), false)
        }
    }
}

fn lowercase_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
