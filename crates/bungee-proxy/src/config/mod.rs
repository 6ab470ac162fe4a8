//! Configuration types for the Bungee proxy.

mod route;
mod rules;
mod transformer;
mod upstream;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use route::{FailoverConfig, HealthCheckConfig, PathRewrite, RouteConfig};
pub use rules::ModificationRules;
pub use transformer::{
    PathAction, PathActionKind, RequestRules, ResponseMatch, ResponseRule, ResponseRuleSet,
    StreamRules, StreamTransformRules, TransformerConfig, TransformerRef,
};
pub use upstream::{TargetParts, Upstream};

const DEFAULT_BODY_PARSER_LIMIT: &str = "1mb";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no config file found (checked CONFIG_PATH, ./config.json, ~/.bungee/config.json)")]
    NotFound,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Maximum accepted JSON request body size, e.g. `"50mb"`.
    #[serde(default = "default_body_parser_limit")]
    pub body_parser_limit: String,

    /// Ordered routes; first prefix match wins.
    pub routes: Vec<RouteConfig>,
}

fn default_body_parser_limit() -> String {
    DEFAULT_BODY_PARSER_LIMIT.to_string()
}

impl Config {
    /// Load and validate a configuration document.
    ///
    /// The file is parsed as JSON first, with a YAML fallback for
    /// operators who prefer it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = match serde_json::from_str(contents) {
            Ok(config) => config,
            Err(json_err) => serde_yaml::from_str(contents)
                .map_err(|_| ConfigError::Parse(json_err.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the document. Invalid config is fatal at startup and
    /// aborts a reload (the previous config stays active).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("routes must be a non-empty array".into()));
        }

        bytesize::ByteSize::from_str(&self.body_parser_limit).map_err(|e| {
            ConfigError::Invalid(format!(
                "bodyParserLimit '{}' is not a size: {e}",
                self.body_parser_limit
            ))
        })?;

        for route in &self.routes {
            route_context(route, validate_route(route))?;
        }

        Ok(())
    }

    /// The request body cap in bytes. `BODY_PARSER_LIMIT` overrides the
    /// config field, which overrides the `1mb` default.
    pub fn body_limit_bytes(&self) -> u64 {
        let configured = std::env::var("BODY_PARSER_LIMIT")
            .ok()
            .unwrap_or_else(|| self.body_parser_limit.clone());
        bytesize::ByteSize::from_str(&configured)
            .map(|b| b.as_u64())
            .unwrap_or_else(|_| {
                bytesize::ByteSize::from_str(DEFAULT_BODY_PARSER_LIMIT)
                    .expect("default limit parses")
                    .as_u64()
            })
    }
}

fn route_context(route: &RouteConfig, result: Result<(), String>) -> Result<(), ConfigError> {
    result.map_err(|e| ConfigError::Invalid(format!("route '{}': {e}", route.path)))
}

fn validate_route(route: &RouteConfig) -> Result<(), String> {
    if route.path.is_empty() {
        return Err("path must be non-empty".into());
    }

    if route.upstreams.is_empty() {
        return Err("upstreams must be a non-empty array".into());
    }

    for upstream in &route.upstreams {
        upstream.validate()?;
        if let Some(ref transformer) = upstream.transformer {
            validate_transformer_ref(transformer)?;
        }
    }

    if route.total_weight() == 0 {
        return Err("total upstream weight must be > 0".into());
    }

    if route.failover.enabled && route.upstreams.len() < 2 {
        warn!(
            route = %route.path,
            "failover is enabled with fewer than 2 upstreams; there is nothing to fail over to"
        );
    }

    if let Some(ref rewrite) = route.path_rewrite {
        for (pattern, _) in rewrite.pairs() {
            regex::Regex::new(pattern)
                .map_err(|e| format!("invalid pathRewrite pattern '{pattern}': {e}"))?;
        }
    }

    if let Some(ref transformer) = route.transformer {
        validate_transformer_ref(transformer)?;
    }

    Ok(())
}

fn validate_transformer_ref(reference: &TransformerRef) -> Result<(), String> {
    match reference {
        TransformerRef::Named(name) => {
            if crate::transformer::builtin(name).is_none() {
                return Err(format!("unknown transformer '{name}'"));
            }
            Ok(())
        }
        TransformerRef::Inline(config) => validate_transformer_config(config),
        TransformerRef::Chain(configs) => {
            for config in configs {
                validate_transformer_config(config)?;
            }
            Ok(())
        }
    }
}

fn validate_transformer_config(config: &TransformerConfig) -> Result<(), String> {
    regex::Regex::new(&config.path.matches)
        .map_err(|e| format!("invalid transformer path regex '{}': {e}", config.path.matches))?;
    for rule in &config.response {
        regex::Regex::new(&rule.matches.status).map_err(|e| {
            format!(
                "invalid response status regex '{}': {e}",
                rule.matches.status
            )
        })?;
    }
    Ok(())
}

/// Resolve the config file path: explicit argument, `CONFIG_PATH`,
/// `./config.json`, then `~/.bungee/config.json`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let cwd_config = PathBuf::from("config.json");
    if cwd_config.exists() {
        return Ok(cwd_config);
    }
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".bungee").join("config.json");
        if home_config.exists() {
            return Ok(home_config);
        }
    }
    Err(ConfigError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_from(v: serde_json::Value) -> Result<Config, ConfigError> {
        Config::from_str(&v.to_string())
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = config_from(json!({
            "routes": [
                {"path": "/api", "upstreams": [{"target": "http://a.example.com"}]}
            ]
        }))
        .unwrap();
        assert_eq!(config.body_parser_limit, "1mb");
        assert_eq!(config.routes.len(), 1);
    }

    #[test]
    fn test_empty_routes_rejected() {
        let err = config_from(json!({"routes": []})).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_upstreams_rejected() {
        let err = config_from(json!({
            "routes": [{"path": "/api", "upstreams": []}]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_total_weight_rejected() {
        let err = config_from(json!({
            "routes": [{
                "path": "/api",
                "upstreams": [
                    {"target": "http://a", "weight": 0},
                    {"target": "http://b", "weight": 0}
                ]
            }]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_transformer_rejected() {
        let err = config_from(json!({
            "routes": [{
                "path": "/api",
                "transformer": "no-such-transformer",
                "upstreams": [{"target": "http://a"}]
            }]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_builtin_transformer_accepted() {
        let config = config_from(json!({
            "routes": [{
                "path": "/v1/anthropic-proxy",
                "pathRewrite": {"^/v1/anthropic-proxy": "/v1"},
                "transformer": "anthropic-to-openai",
                "upstreams": [{"target": "https://api.openai.com"}]
            }]
        }))
        .unwrap();
        assert!(config.routes[0].transformer.is_some());
    }

    #[test]
    fn test_invalid_rewrite_regex_rejected() {
        let err = config_from(json!({
            "routes": [{
                "path": "/api",
                "pathRewrite": {"([": "/x"},
                "upstreams": [{"target": "http://a"}]
            }]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_yaml_fallback() {
        let yaml = r#"
routes:
  - path: /api
    upstreams:
      - target: http://a.example.com
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.routes[0].path, "/api");
    }

    #[test]
    fn test_body_limit_parses() {
        let config = config_from(json!({
            "bodyParserLimit": "50mb",
            "routes": [{"path": "/api", "upstreams": [{"target": "http://a"}]}]
        }))
        .unwrap();
        assert_eq!(config.body_limit_bytes(), 50 * 1000 * 1000);
    }
}
