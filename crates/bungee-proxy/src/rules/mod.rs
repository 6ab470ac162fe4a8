//! Application of modification rules to header maps and JSON bodies.
//!
//! Verbs execute in a fixed order: `add` (unconditional), `replace`
//! (existing or just-added keys), `default` (absent keys, bodies only),
//! `remove` (unless `add`/`replace` touched the key). A failing
//! expression skips that one entry; the rest of the rule set still
//! applies.

use crate::config::ModificationRules;
use crate::expression::{Evaluator, RequestContext};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{error, warn};

/// Key used by rules to fan one event out into several.
pub const MULTI_EVENTS_KEY: &str = "__multi_events";

/// Result of applying body rules: usually one value, or a sequence when
/// the rules produced a `__multi_events` wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    One(Value),
    Many(Vec<Value>),
}

impl Applied {
    /// Collapse to a single value; a fan-out becomes a JSON array.
    pub fn into_single(self) -> Value {
        match self {
            Applied::One(v) => v,
            Applied::Many(events) => Value::Array(events),
        }
    }
}

/// Apply header rules in place. Header keys are case-insensitive.
pub fn apply_header_rules(
    headers: &mut HeaderMap,
    rules: &ModificationRules,
    ctx: &RequestContext,
    evaluator: &Evaluator,
) {
    let mut touched: HashSet<String> = HashSet::new();

    for (key, value) in &rules.add {
        if let Some(rendered) = eval_header_value(evaluator, value, ctx, key) {
            if insert_header(headers, key, &rendered) {
                touched.insert(key.to_lowercase());
            }
        }
    }

    for (key, value) in &rules.replace {
        let lowered = key.to_lowercase();
        let present = headers.contains_key(lowered.as_str()) || touched.contains(&lowered);
        if !present {
            continue;
        }
        if let Some(rendered) = eval_header_value(evaluator, value, ctx, key) {
            if insert_header(headers, key, &rendered) {
                touched.insert(lowered);
            }
        }
    }

    // `default` is a body-only verb; ignore it for headers.

    for key in &rules.remove {
        let lowered = key.to_lowercase();
        if touched.contains(&lowered) {
            continue;
        }
        headers.remove(lowered.as_str());
    }
}

fn eval_header_value(
    evaluator: &Evaluator,
    value: &Value,
    ctx: &RequestContext,
    key: &str,
) -> Option<String> {
    match evaluator.eval_template(value, ctx) {
        Ok(rendered) => Some(match rendered {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        Err(e) => {
            error!(header = key, "header rule skipped: {e}");
            None
        }
    }
}

fn insert_header(headers: &mut HeaderMap, key: &str, value: &str) -> bool {
    let name = match HeaderName::from_str(&key.to_lowercase()) {
        Ok(name) => name,
        Err(_) => {
            warn!(header = key, "invalid header name, rule entry ignored");
            return false;
        }
    };
    let value = match HeaderValue::from_str(value) {
        Ok(value) => value,
        Err(_) => {
            warn!(header = key, "invalid header value, rule entry ignored");
            return false;
        }
    };
    headers.insert(name, value);
    true
}

/// Apply body rules to a JSON value, post-clean the result and unwrap a
/// `__multi_events` fan-out when present.
pub fn apply_body_rules(
    body: Value,
    rules: &ModificationRules,
    ctx: &RequestContext,
    evaluator: &Evaluator,
) -> Applied {
    let mut object = match body {
        Value::Object(map) => map,
        // Rules only make sense over objects; anything else passes through.
        other => return Applied::One(other),
    };

    let mut touched: HashSet<&str> = HashSet::new();

    for (key, value) in &rules.add {
        match evaluator.eval_template(value, ctx) {
            Ok(rendered) => {
                object.insert(key.clone(), rendered);
                touched.insert(key.as_str());
            }
            Err(e) => error!(key = %key, "body rule skipped: {e}"),
        }
    }

    for (key, value) in &rules.replace {
        if !object.contains_key(key) && !touched.contains(key.as_str()) {
            continue;
        }
        match evaluator.eval_template(value, ctx) {
            Ok(rendered) => {
                object.insert(key.clone(), rendered);
                touched.insert(key.as_str());
            }
            Err(e) => error!(key = %key, "body rule skipped: {e}"),
        }
    }

    for (key, value) in &rules.default {
        if object.contains_key(key) {
            continue;
        }
        match evaluator.eval_template(value, ctx) {
            Ok(rendered) => {
                object.insert(key.clone(), rendered);
            }
            Err(e) => error!(key = %key, "body rule skipped: {e}"),
        }
    }

    for key in &rules.remove {
        if touched.contains(key.as_str()) {
            continue;
        }
        object.remove(key);
    }

    let had_fan_out = object
        .get(MULTI_EVENTS_KEY)
        .map(Value::is_array)
        .unwrap_or(false);

    let cleaned = post_clean(Value::Object(object));

    if had_fan_out {
        let events = match cleaned {
            Value::Object(mut map) => match map.remove(MULTI_EVENTS_KEY) {
                Some(Value::Array(events)) => events,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        return Applied::Many(events);
    }

    Applied::One(cleaned)
}

/// Recursively scrub `null` and empty-string leaves, plus objects and
/// arrays left empty by the scrub. Idempotent; a top-level object that
/// empties out collapses to `{}`.
pub fn post_clean(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: serde_json::Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| {
                    let c = post_clean(v);
                    if is_scrubbed(&c) {
                        None
                    } else {
                        Some((k, c))
                    }
                })
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => {
            let cleaned: Vec<Value> = items
                .into_iter()
                .map(post_clean)
                .filter(|v| !is_scrubbed(v))
                .collect();
            Value::Array(cleaned)
        }
        other => other,
    }
}

fn is_scrubbed(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(v: Value) -> ModificationRules {
        serde_json::from_value(v).unwrap()
    }

    fn apply_body(body: Value, r: Value) -> Applied {
        apply_body_rules(
            body,
            &rules(r),
            &RequestContext::default(),
            &Evaluator::new(),
        )
    }

    #[test]
    fn test_add_overrides_existing() {
        let out = apply_body(
            json!({"k": "old"}),
            json!({"add": {"k": "new"}}),
        );
        assert_eq!(out, Applied::One(json!({"k": "new"})));
    }

    #[test]
    fn test_replace_only_existing_or_added() {
        let out = apply_body(
            json!({"present": 1}),
            json!({"replace": {"present": 2, "absent": 3}}),
        );
        assert_eq!(out, Applied::One(json!({"present": 2})));

        let out = apply_body(
            json!({}),
            json!({"add": {"fresh": 1}, "replace": {"fresh": 2}}),
        );
        assert_eq!(out, Applied::One(json!({"fresh": 2})));
    }

    #[test]
    fn test_default_only_when_absent() {
        let out = apply_body(
            json!({"set": 1}),
            json!({"default": {"set": 9, "unset": 2}}),
        );
        assert_eq!(out, Applied::One(json!({"set": 1, "unset": 2})));
    }

    #[test]
    fn test_remove_unless_touched() {
        let out = apply_body(
            json!({"gone": 1, "kept": 2}),
            json!({"add": {"kept": 3}, "remove": ["gone", "kept"]}),
        );
        assert_eq!(out, Applied::One(json!({"kept": 3})));
    }

    #[test]
    fn test_expression_failure_skips_entry_only() {
        let out = apply_body(
            json!({}),
            json!({"add": {"bad": "{{ ][ }}", "good": "ok"}}),
        );
        assert_eq!(out, Applied::One(json!({"good": "ok"})));
    }

    #[test]
    fn test_post_clean_scrubs_and_is_idempotent() {
        let dirty = json!({
            "keep": "v",
            "null": null,
            "empty": "",
            "nested": {"only_null": null},
            "list": [null, "", "x", {}]
        });
        let once = post_clean(dirty.clone());
        assert_eq!(once, json!({"keep": "v", "list": ["x"]}));
        assert_eq!(post_clean(once.clone()), once);
    }

    #[test]
    fn test_post_clean_empties_to_object() {
        assert_eq!(post_clean(json!({"a": null})), json!({}));
    }

    #[test]
    fn test_multi_events_unwrap() {
        let out = apply_body(
            json!({}),
            json!({"add": {"__multi_events": [{"type": "a"}, {"type": "b"}]}}),
        );
        assert_eq!(
            out,
            Applied::Many(vec![json!({"type": "a"}), json!({"type": "b"})])
        );
    }

    #[test]
    fn test_multi_events_empty_yields_no_events() {
        let out = apply_body(
            json!({}),
            json!({"add": {"__multi_events": []}}),
        );
        assert_eq!(out, Applied::Many(vec![]));
    }

    #[test]
    fn test_header_add_replace_remove() {
        let evaluator = Evaluator::new();
        let ctx = RequestContext::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-old", HeaderValue::from_static("1"));
        headers.insert("x-gone", HeaderValue::from_static("2"));

        apply_header_rules(
            &mut headers,
            &rules(json!({
                "add": {"X-New": "fresh"},
                "replace": {"x-old": "updated", "x-missing": "never"},
                "remove": ["x-gone", "X-New"]
            })),
            &ctx,
            &evaluator,
        );

        assert_eq!(headers.get("x-new").unwrap(), "fresh");
        assert_eq!(headers.get("x-old").unwrap(), "updated");
        assert!(headers.get("x-missing").is_none());
        assert!(headers.get("x-gone").is_none());
    }

    #[test]
    fn test_non_object_body_passthrough() {
        let out = apply_body(json!("raw text"), json!({"add": {"k": 1}}));
        assert_eq!(out, Applied::One(json!("raw text")));
    }
}
