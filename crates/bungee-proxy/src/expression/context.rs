//! The per-request evaluation context.
//!
//! Every `{{ … }}` expression sees the same six names: `headers`, `body`,
//! `url`, `method`, `env` and (during SSE transformation only) `stream`.
//! Evaluation never mutates the context; rule application rebuilds it
//! between pipeline stages instead.

use super::value::json_to_dynamic;
use rhai::{Dynamic, Map, Scope};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// URL components of the request being processed. `pathname` always
/// reflects the current rewritten path at the point of evaluation.
#[derive(Debug, Clone, Default)]
pub struct UrlParts {
    pub pathname: String,
    pub search: String,
    pub host: String,
    pub protocol: String,
}

/// SSE phase information, present only while a stream transform runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPhase {
    pub phase: &'static str,
    pub chunk_index: i64,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Lowercased header name → value.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON request body, `{}` when the body was absent or not JSON.
    pub body: Value,
    pub url: UrlParts,
    pub method: String,
    /// Snapshot of the process environment, captured once per worker.
    pub env: Arc<BTreeMap<String, String>>,
    pub stream: Option<StreamPhase>,
}

impl RequestContext {
    /// Populate a Rhai scope with the context variables.
    pub fn push_into(&self, scope: &mut Scope) {
        let mut headers = Map::new();
        for (k, v) in &self.headers {
            headers.insert(k.as_str().into(), Dynamic::from(v.clone()));
        }
        scope.push("headers", headers);

        scope.push("body", json_to_dynamic(self.body.clone()));

        let mut url = Map::new();
        url.insert("pathname".into(), Dynamic::from(self.url.pathname.clone()));
        url.insert("search".into(), Dynamic::from(self.url.search.clone()));
        url.insert("host".into(), Dynamic::from(self.url.host.clone()));
        url.insert("protocol".into(), Dynamic::from(self.url.protocol.clone()));
        scope.push("url", url);

        scope.push("method", self.method.clone());

        let mut env = Map::new();
        for (k, v) in self.env.iter() {
            env.insert(k.as_str().into(), Dynamic::from(v.clone()));
        }
        scope.push("env", env);

        if let Some(stream) = self.stream {
            let mut map = Map::new();
            map.insert("phase".into(), Dynamic::from(stream.phase.to_string()));
            map.insert("chunkIndex".into(), Dynamic::from(stream.chunk_index));
            scope.push("stream", map);
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            body: Value::Object(serde_json::Map::new()),
            url: UrlParts::default(),
            method: "GET".to_string(),
            env: Arc::new(BTreeMap::new()),
            stream: None,
        }
    }
}
