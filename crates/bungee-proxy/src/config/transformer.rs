//! Transformer configuration.
//!
//! A transformer bundles a path rewrite with request-side and
//! response-side modification rules, typically implementing an API-format
//! conversion. Transformers may be referenced by name (resolved against
//! the built-in registry), supplied inline, or chained as a list.

use super::rules::ModificationRules;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to one or more transformers on a route or upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TransformerRef {
    /// Name of a built-in rule set, e.g. `"anthropic-to-openai"`.
    Named(String),
    /// A single inline transformer.
    Inline(Box<TransformerConfig>),
    /// An ordered chain; the first entry whose path regex matches wins.
    Chain(Vec<TransformerConfig>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformerConfig {
    pub path: PathAction,

    /// Request-side rules, applied after the route/upstream layers.
    #[serde(default)]
    pub request: RequestRules,

    /// Response rules, matched against the upstream status in order.
    #[serde(default)]
    pub response: Vec<ResponseRule>,
}

/// Path rewrite performed by a transformer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathAction {
    pub action: PathActionKind,

    /// Regex matched against the current (already route-rewritten) path.
    #[serde(rename = "match")]
    pub matches: String,

    /// Replacement string; may contain `{{ … }}` expressions.
    pub replace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathActionKind {
    Replace,
}

/// Request-side rules of a transformer, split by target.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<ModificationRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ModificationRules>,
}

/// One response-side rule: a matcher plus the rules to apply.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseRule {
    #[serde(rename = "match")]
    pub matches: ResponseMatch,
    pub rules: ResponseRuleSet,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseMatch {
    /// Regex matched against the decimal status code, e.g. `"^2"`.
    pub status: String,

    /// Optional header name → value-regex constraints.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Rules applied to a matched response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResponseRuleSet {
    /// Buffered (non-streaming) body rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ModificationRules>,

    /// Streaming (`text/event-stream`) rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamRules>,
}

/// Streaming rules come in two shapes: the phased state-machine form
/// (`start`/`chunk`/`end`) and the legacy single-rule form applied to
/// every event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamRules {
    Phased(StreamTransformRules),
    Legacy(ModificationRules),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamTransformRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<ModificationRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ModificationRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<ModificationRules>,
}

// An untagged derive cannot disambiguate the two shapes (every field of
// both is optional), so the presence of any phase key decides.
impl<'de> Deserialize<'de> for StreamRules {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let is_phased = value
            .as_object()
            .map(|o| o.contains_key("start") || o.contains_key("chunk") || o.contains_key("end"))
            .unwrap_or(false);

        if is_phased {
            serde_json::from_value::<StreamTransformRules>(value)
                .map(StreamRules::Phased)
                .map_err(serde::de::Error::custom)
        } else {
            serde_json::from_value::<ModificationRules>(value)
                .map(StreamRules::Legacy)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transformer_ref_shapes() {
        let named: TransformerRef = serde_json::from_value(json!("anthropic-to-openai")).unwrap();
        assert!(matches!(named, TransformerRef::Named(ref n) if n == "anthropic-to-openai"));

        let inline: TransformerRef = serde_json::from_value(json!({
            "path": {"action": "replace", "match": "^/v1/messages", "replace": "/v1/chat/completions"}
        }))
        .unwrap();
        assert!(matches!(inline, TransformerRef::Inline(_)));

        let chain: TransformerRef = serde_json::from_value(json!([
            {"path": {"action": "replace", "match": "^/a", "replace": "/b"}}
        ]))
        .unwrap();
        assert!(matches!(chain, TransformerRef::Chain(ref c) if c.len() == 1));
    }

    #[test]
    fn test_stream_rules_phased_vs_legacy() {
        let phased: StreamRules = serde_json::from_value(json!({
            "chunk": {"add": {"type": "delta"}}
        }))
        .unwrap();
        assert!(matches!(phased, StreamRules::Phased(_)));

        let legacy: StreamRules = serde_json::from_value(json!({
            "add": {"transformed": true}
        }))
        .unwrap();
        assert!(matches!(legacy, StreamRules::Legacy(_)));
    }

    #[test]
    fn test_response_rule_parses() {
        let rule: ResponseRule = serde_json::from_value(json!({
            "match": {"status": "^2", "headers": {"content-type": "json"}},
            "rules": {"default": {"add": {"proxied": true}}}
        }))
        .unwrap();
        assert_eq!(rule.matches.status, "^2");
        assert!(rule.rules.default.is_some());
        assert!(rule.rules.stream.is_none());
    }
}
