//! Transformer registry and compiled transformer forms.
//!
//! The two built-in API-format conversions ship as data: declarative
//! rule documents embedded at compile time and parsed once. Inline
//! transformer configs bypass the registry entirely.

use crate::config::{
    ResponseRuleSet, StreamRules, TransformerConfig, TransformerRef,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

const ANTHROPIC_TO_OPENAI: &str = include_str!("assets/anthropic_to_openai.json");
const ANTHROPIC_TO_GEMINI: &str = include_str!("assets/anthropic_to_gemini.json");

static BUILTIN_OPENAI: Lazy<Vec<TransformerConfig>> = Lazy::new(|| {
    serde_json::from_str(ANTHROPIC_TO_OPENAI).expect("bundled anthropic-to-openai rules parse")
});

static BUILTIN_GEMINI: Lazy<Vec<TransformerConfig>> = Lazy::new(|| {
    serde_json::from_str(ANTHROPIC_TO_GEMINI).expect("bundled anthropic-to-gemini rules parse")
});

/// Look up a built-in rule set by name.
pub fn builtin(name: &str) -> Option<&'static [TransformerConfig]> {
    match name {
        "anthropic-to-openai" => Some(&BUILTIN_OPENAI),
        "anthropic-to-gemini" => Some(&BUILTIN_GEMINI),
        _ => None,
    }
}

/// A transformer with its regexes compiled, ready for per-request use.
#[derive(Debug, Clone)]
pub struct CompiledTransformer {
    pub path_match: Regex,
    pub path_replace: String,
    pub request: crate::config::RequestRules,
    pub response: Vec<CompiledResponseRule>,
}

#[derive(Debug, Clone)]
pub struct CompiledResponseRule {
    pub status: Regex,
    pub headers: Vec<(String, Regex)>,
    pub rules: ResponseRuleSet,
}

impl CompiledTransformer {
    /// First response rule matching the upstream status and headers.
    pub fn match_response(
        &self,
        status: u16,
        headers: &hyper::HeaderMap,
    ) -> Option<&CompiledResponseRule> {
        let status_text = status.to_string();
        self.response.iter().find(|rule| {
            rule.status.is_match(&status_text)
                && rule.headers.iter().all(|(name, pattern)| {
                    headers
                        .get(name.as_str())
                        .and_then(|v| v.to_str().ok())
                        .map(|v| pattern.is_match(v))
                        .unwrap_or(false)
                })
        })
    }
}

fn compile_one(config: &TransformerConfig) -> Result<CompiledTransformer, String> {
    let path_match = Regex::new(&config.path.matches)
        .map_err(|e| format!("invalid transformer path regex '{}': {e}", config.path.matches))?;

    let mut response = Vec::with_capacity(config.response.len());
    for rule in &config.response {
        let status = Regex::new(&rule.matches.status).map_err(|e| {
            format!("invalid response status regex '{}': {e}", rule.matches.status)
        })?;
        let mut headers = Vec::new();
        for (name, pattern) in &rule.matches.headers {
            let compiled = Regex::new(pattern)
                .map_err(|e| format!("invalid response header regex '{pattern}': {e}"))?;
            headers.push((name.to_lowercase(), compiled));
        }
        response.push(CompiledResponseRule {
            status,
            headers,
            rules: rule.rules.clone(),
        });
    }

    Ok(CompiledTransformer {
        path_match,
        path_replace: config.path.replace.clone(),
        request: config.request.clone(),
        response,
    })
}

/// Resolve a reference to its compiled transformer chain.
pub fn resolve(reference: &TransformerRef) -> Result<Arc<Vec<CompiledTransformer>>, String> {
    let configs: Vec<&TransformerConfig> = match reference {
        TransformerRef::Named(name) => builtin(name)
            .ok_or_else(|| format!("unknown transformer '{name}'"))?
            .iter()
            .collect(),
        TransformerRef::Inline(config) => vec![config.as_ref()],
        TransformerRef::Chain(configs) => configs.iter().collect(),
    };

    let mut compiled = Vec::with_capacity(configs.len());
    for config in configs {
        compiled.push(compile_one(config)?);
    }
    Ok(Arc::new(compiled))
}

/// Select the first transformer in the chain whose path regex matches.
pub fn select<'a>(
    chain: &'a [CompiledTransformer],
    pathname: &str,
) -> Option<&'a CompiledTransformer> {
    chain.iter().find(|t| t.path_match.is_match(pathname))
}

/// True when the stream rules carry any of the `start`/`chunk`/`end`
/// phases (state-machine mode) rather than the legacy single-rule form.
pub fn is_phased(rules: &StreamRules) -> bool {
    matches!(rules, StreamRules::Phased(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_parse_and_compile() {
        for name in ["anthropic-to-openai", "anthropic-to-gemini"] {
            let configs = builtin(name).unwrap();
            assert!(!configs.is_empty());
            let compiled = resolve(&TransformerRef::Named(name.to_string())).unwrap();
            assert_eq!(compiled.len(), configs.len());
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert!(builtin("nope").is_none());
        assert!(resolve(&TransformerRef::Named("nope".into())).is_err());
    }

    #[test]
    fn test_select_by_path() {
        let compiled = resolve(&TransformerRef::Named("anthropic-to-openai".into())).unwrap();
        assert!(select(&compiled, "/v1/messages").is_some());
        assert!(select(&compiled, "/v1/other").is_none());
    }

    #[test]
    fn test_response_rule_status_match() {
        let compiled = resolve(&TransformerRef::Named("anthropic-to-openai".into())).unwrap();
        let transformer = select(&compiled, "/v1/messages").unwrap();
        let headers = hyper::HeaderMap::new();
        assert!(transformer.match_response(200, &headers).is_some());
        assert!(transformer.match_response(500, &headers).is_none());
    }

    #[test]
    fn test_builtin_stream_rules_are_phased() {
        let compiled = resolve(&TransformerRef::Named("anthropic-to-openai".into())).unwrap();
        let transformer = select(&compiled, "/v1/messages").unwrap();
        let rule = transformer
            .match_response(200, &hyper::HeaderMap::new())
            .unwrap();
        let stream = rule.rules.stream.as_ref().unwrap();
        assert!(is_phased(stream));
    }
}
