//! Route configuration.

use super::rules::ModificationRules;
use super::transformer::TransformerRef;
use super::upstream::Upstream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One routing entry. Routes are matched in order; the first whose `path`
/// is a prefix of the request path wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// URL path prefix, e.g. `/v1/anthropic-proxy`.
    pub path: String,

    /// Path rewrites applied before transformer resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerRef>,

    /// Route-layer header rules (request side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<ModificationRules>,

    /// Route-layer body rules (request side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ModificationRules>,

    /// Route-layer body rules applied to responses (outer layer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ModificationRules>,

    pub upstreams: Vec<Upstream>,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// Path rewrite rules: either an ordered list of `[pattern, replacement]`
/// pairs (the deterministic spelling) or a pattern → replacement object.
/// The object form is iterated in lexicographic key order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PathRewrite {
    Ordered(Vec<(String, String)>),
    Mapped(BTreeMap<String, String>),
}

impl PathRewrite {
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            PathRewrite::Ordered(list) => list
                .iter()
                .map(|(p, r)| (p.as_str(), r.as_str()))
                .collect(),
            PathRewrite::Mapped(map) => {
                map.iter().map(|(p, r)| (p.as_str(), r.as_str())).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Response statuses treated like transport failures.
    #[serde(default)]
    pub retryable_status_codes: Vec<u16>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retryable_status_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Minimum spacing between recovery probes for one upstream.
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_seconds: default_health_interval(),
        }
    }
}

impl RouteConfig {
    pub fn total_weight(&self) -> u64 {
        self.upstreams.iter().map(|u| u.weight as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_parses_minimal() {
        let route: RouteConfig = serde_json::from_value(json!({
            "path": "/api",
            "upstreams": [{"target": "http://a.example.com"}]
        }))
        .unwrap();
        assert_eq!(route.path, "/api");
        assert!(!route.failover.enabled);
        assert!(route.health_check.enabled);
        assert_eq!(route.total_weight(), 100);
    }

    #[test]
    fn test_path_rewrite_ordered_form() {
        let rewrite: PathRewrite =
            serde_json::from_value(json!([["^/old", "/new"], ["^/other", "/else"]])).unwrap();
        let pairs = rewrite.pairs();
        assert_eq!(pairs[0], ("^/old", "/new"));
        assert_eq!(pairs[1], ("^/other", "/else"));
    }

    #[test]
    fn test_path_rewrite_object_form() {
        let rewrite: PathRewrite =
            serde_json::from_value(json!({"^/v1/anthropic-proxy": "/v1"})).unwrap();
        assert_eq!(rewrite.pairs(), vec![("^/v1/anthropic-proxy", "/v1")]);
    }

    #[test]
    fn test_failover_config() {
        let route: RouteConfig = serde_json::from_value(json!({
            "path": "/f",
            "upstreams": [{"target": "http://a"}, {"target": "http://b"}],
            "failover": {"enabled": true, "retryableStatusCodes": [500, 502]}
        }))
        .unwrap();
        assert!(route.failover.enabled);
        assert_eq!(route.failover.retryable_status_codes, vec![500, 502]);
    }
}
