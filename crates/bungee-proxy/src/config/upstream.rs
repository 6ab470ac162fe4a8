//! Upstream configuration.

use super::rules::ModificationRules;
use super::transformer::TransformerRef;
use serde::{Deserialize, Serialize};

/// One upstream target of a route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Upstream {
    /// Absolute base URL: `http(s)://host[:port][/base-path]`.
    pub target: String,

    /// Relative share of traffic within the priority group.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Lower value means tried first; groups fail over in order.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Overrides the route-level transformer when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerRef>,

    /// Upstream-layer header rules (request side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<ModificationRules>,

    /// Upstream-layer body rules (request side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ModificationRules>,

    /// Upstream-layer body rules applied to responses (outer layer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ModificationRules>,
}

pub(crate) fn default_weight() -> u32 {
    100
}

pub(crate) fn default_priority() -> u32 {
    1
}

/// Scheme, host and base path split out of an upstream `target` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetParts {
    pub scheme: String,
    pub host: String,
    pub base_path: String,
}

impl Upstream {
    /// Split the target URL into scheme, host and base path.
    pub fn target_parts(&self) -> Result<TargetParts, String> {
        let (scheme, rest) = self
            .target
            .split_once("://")
            .ok_or_else(|| format!("Invalid target URL (missing scheme): {}", self.target))?;

        if scheme != "http" && scheme != "https" {
            return Err(format!(
                "Unsupported scheme '{scheme}' in target '{}'. Supported: http, https",
                self.target
            ));
        }

        let (host, base_path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };

        if host.is_empty() {
            return Err(format!("Invalid target URL (missing host): {}", self.target));
        }

        Ok(TargetParts {
            scheme: scheme.to_string(),
            host: host.to_string(),
            base_path: base_path.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        self.target_parts().map(|_| ())?;
        // A zero weight is legal for one upstream (it never receives
        // first-try traffic); the per-route total is checked separately.
        if self.priority == 0 {
            return Err(format!(
                "Upstream '{}' has priority 0; priorities start at 1",
                self.target
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let up: Upstream = serde_json::from_value(json!({"target": "http://a.example.com"})).unwrap();
        assert_eq!(up.weight, 100);
        assert_eq!(up.priority, 1);
    }

    #[test]
    fn test_target_parts_with_base_path() {
        let up: Upstream =
            serde_json::from_value(json!({"target": "https://api.example.com/v1/"})).unwrap();
        let parts = up.target_parts().unwrap();
        assert_eq!(parts.scheme, "https");
        assert_eq!(parts.host, "api.example.com");
        assert_eq!(parts.base_path, "/v1");
    }

    #[test]
    fn test_target_parts_without_base_path() {
        let up: Upstream =
            serde_json::from_value(json!({"target": "http://localhost:9001"})).unwrap();
        let parts = up.target_parts().unwrap();
        assert_eq!(parts.host, "localhost:9001");
        assert_eq!(parts.base_path, "");
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let up: Upstream = serde_json::from_value(json!({"target": "ftp://a"})).unwrap();
        assert!(up.validate().is_err());
    }
}
