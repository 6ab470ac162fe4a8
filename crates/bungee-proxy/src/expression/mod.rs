//! The `{{ … }}` expression evaluator.
//!
//! Rule values may embed Rhai expressions between `{{` and `}}` markers.
//! Three shapes are recognized:
//!
//! 1. The whole string is exactly one marker: the raw evaluated value
//!    (any JSON type) replaces the string.
//! 2. The string mixes markers and literal text: each marker is
//!    evaluated and stringified in place.
//! 3. No markers: the value passes through unchanged.
//!
//! Every evaluation runs on a fresh engine carrying the helper library,
//! an operation cap and a hard wall-clock deadline. Compiled ASTs are
//! cached by source text; results never are, since they depend on the
//! request context.

mod context;
mod helpers;
mod value;

pub use context::{RequestContext, StreamPhase, UrlParts};
pub use value::{dynamic_to_json, json_to_dynamic};

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const EVAL_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_OPERATIONS: u64 = 100_000;

/// Locate `{{ … }}` markers, tracking brace depth so expressions may
/// contain nested map literals like `#{a: #{b: 1}}`.
fn find_markers(input: &str) -> Vec<(Range<usize>, String)> {
    let bytes = input.as_bytes();
    let mut markers = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if &bytes[i..i + 2] != b"{{" {
            i += 1;
            continue;
        }

        let expr_start = i + 2;
        let mut depth = 0usize;
        let mut j = expr_start;
        let mut end = None;

        while j < bytes.len() {
            match bytes[j] {
                b'{' => depth += 1,
                b'}' => {
                    if depth > 0 {
                        depth -= 1;
                    } else if j + 1 < bytes.len() && bytes[j + 1] == b'}' {
                        end = Some(j);
                        break;
                    }
                }
                _ => {}
            }
            j += 1;
        }

        match end {
            Some(close) => {
                let expr = input[expr_start..close].trim().to_string();
                markers.push((i..close + 2, expr));
                i = close + 2;
            }
            // Unterminated marker: leave the rest of the string literal.
            None => break,
        }
    }

    markers
}

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("failed to parse expression '{source_text}': {detail}")]
    Parse { source_text: String, detail: String },

    #[error("expression '{source_text}' failed: {detail}")]
    Eval { source_text: String, detail: String },

    #[error("expression '{source_text}' exceeded its evaluation budget")]
    Timeout { source_text: String },
}

pub struct Evaluator {
    ast_cache: Mutex<HashMap<String, Arc<AST>>>,
    timeout: Duration,
    max_operations: u64,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            ast_cache: Mutex::new(HashMap::new()),
            timeout: EVAL_TIMEOUT,
            max_operations: MAX_OPERATIONS,
        }
    }

    /// Render a rule value against the context. Strings are template
    /// expanded; objects and arrays are rendered recursively; everything
    /// else passes through.
    pub fn eval_template(
        &self,
        value: &Value,
        ctx: &RequestContext,
    ) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => self.render_str(s, ctx),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(k.clone(), self.eval_template(v, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(self.eval_template(item, ctx)?);
                }
                Ok(Value::Array(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Expand a single string according to the three template shapes.
    pub fn render_str(&self, input: &str, ctx: &RequestContext) -> Result<Value, ExpressionError> {
        let markers = find_markers(input);

        if markers.is_empty() {
            return Ok(Value::String(input.to_string()));
        }

        // Shape 1: the entire value is one marker.
        if markers.len() == 1 && markers[0].0 == (0..input.len()) {
            return self.eval_expr(&markers[0].1, ctx);
        }

        // Shape 2: interpolate, preserving surrounding text.
        let mut output = String::with_capacity(input.len());
        let mut cursor = 0;
        for (range, expr) in &markers {
            output.push_str(&input[cursor..range.start]);
            let evaluated = self.eval_expr(expr, ctx)?;
            output.push_str(&stringify(&evaluated));
            cursor = range.end;
        }
        output.push_str(&input[cursor..]);
        Ok(Value::String(output))
    }

    fn eval_expr(&self, source: &str, ctx: &RequestContext) -> Result<Value, ExpressionError> {
        let ast = self.compiled(source)?;
        let engine = self.build_engine(true);

        let mut scope = Scope::new();
        ctx.push_into(&mut scope);

        let result = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|err| match *err {
                EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..) => {
                    ExpressionError::Timeout {
                        source_text: source.to_string(),
                    }
                }
                ref other => ExpressionError::Eval {
                    source_text: source.to_string(),
                    detail: other.to_string(),
                },
            })?;

        Ok(dynamic_to_json(result))
    }

    fn compiled(&self, source: &str) -> Result<Arc<AST>, ExpressionError> {
        if let Some(ast) = self.ast_cache.lock().get(source) {
            return Ok(Arc::clone(ast));
        }

        let engine = self.build_engine(false);
        let ast = engine
            .compile(source)
            .map_err(|e| ExpressionError::Parse {
                source_text: source.to_string(),
                detail: e.to_string(),
            })?;

        let ast = Arc::new(ast);
        self.ast_cache
            .lock()
            .insert(source.to_string(), Arc::clone(&ast));
        Ok(ast)
    }

    fn build_engine(&self, with_deadline: bool) -> Engine {
        let mut engine = Engine::new();
        helpers::register_helpers(&mut engine);
        engine.set_max_operations(self.max_operations);

        if with_deadline {
            let deadline = Instant::now() + self.timeout;
            engine.on_progress(move |_| {
                if Instant::now() >= deadline {
                    Some(Dynamic::from("deadline exceeded"))
                } else {
                    None
                }
            });
        }

        engine
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext {
            body: json!({"model": "claude-3-opus", "max_tokens_to_sample": 1024, "stream": true}),
            headers: [("x-api-key".to_string(), "secret".to_string())]
                .into_iter()
                .collect(),
            url: UrlParts {
                pathname: "/v1/messages".into(),
                search: "".into(),
                host: "api.example.com".into(),
                protocol: "https".into(),
            },
            method: "POST".into(),
            ..Default::default()
        }
    }

    fn eval(value: serde_json::Value) -> Value {
        Evaluator::new().eval_template(&value, &ctx()).unwrap()
    }

    #[test]
    fn test_no_marker_passthrough() {
        assert_eq!(eval(json!("plain text")), json!("plain text"));
        assert_eq!(eval(json!(42)), json!(42));
    }

    #[test]
    fn test_whole_marker_keeps_raw_type() {
        assert_eq!(eval(json!("{{ body.max_tokens_to_sample }}")), json!(1024));
        assert_eq!(eval(json!("{{ body.stream }}")), json!(true));
    }

    #[test]
    fn test_interpolation_stringifies() {
        assert_eq!(
            eval(json!("model={{ body.model }} tokens={{ body.max_tokens_to_sample }}")),
            json!("model=claude-3-opus tokens=1024")
        );
    }

    #[test]
    fn test_nested_values_rendered() {
        assert_eq!(
            eval(json!({"outer": {"inner": "{{ method }}"}, "list": ["{{ url.pathname }}"]})),
            json!({"outer": {"inner": "POST"}, "list": ["/v1/messages"]})
        );
    }

    #[test]
    fn test_nullish_coalescing() {
        assert_eq!(
            eval(json!("{{ body.max_tokens ?? body.max_tokens_to_sample }}")),
            json!(1024)
        );
    }

    #[test]
    fn test_conditional_expression() {
        assert_eq!(
            eval(json!("{{ if body.stream { \"sse\" } else { \"plain\" } }}")),
            json!("sse")
        );
    }

    #[test]
    fn test_nested_map_literal_marker() {
        assert_eq!(
            eval(json!("{{ #{outer: #{inner: body.max_tokens_to_sample}} }}")),
            json!({"outer": {"inner": 1024}})
        );
    }

    #[test]
    fn test_marker_scan_with_surrounding_text() {
        let markers = find_markers("a {{ 1 + 1 }} b {{ #{x: 1} }} c");
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].1, "1 + 1");
        assert_eq!(markers[1].1, "#{x: 1}");
    }

    #[test]
    fn test_helper_library() {
        let evaluator = Evaluator::new();
        let c = ctx();

        let id = evaluator
            .render_str("{{ uuid() }}", &c)
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(id.len(), 36);

        assert_eq!(
            evaluator.render_str("{{ md5(\"abc\") }}", &c).unwrap(),
            json!("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(
            evaluator
                .render_str("{{ base64encode(\"hi\") }}", &c)
                .unwrap(),
            json!("aGk=")
        );
        assert_eq!(
            evaluator
                .render_str("{{ base64decode(\"aGk=\") }}", &c)
                .unwrap(),
            json!("hi")
        );
        assert_eq!(
            evaluator
                .render_str("{{ toUpperCase(body.model) }}", &c)
                .unwrap(),
            json!("CLAUDE-3-OPUS")
        );
        assert_eq!(
            evaluator
                .render_str("{{ first(split(\"a,b,c\", \",\")) }}", &c)
                .unwrap(),
            json!("a")
        );
        assert_eq!(
            evaluator.render_str("{{ parseInt(\"42abc\") }}", &c).unwrap(),
            json!(42)
        );
        assert_eq!(
            evaluator
                .render_str("{{ length(keys(body)) }}", &c)
                .unwrap(),
            json!(3)
        );
        assert_eq!(
            evaluator
                .render_str("{{ isObject(body) }}", &c)
                .unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_parse_jwt_claims() {
        // Header/payload/signature; payload is {"sub":"42","admin":true}.
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"sub":"42","admin":true}"#);
        let token = format!("eyJhbGciOiJub25lIn0.{payload}.sig");
        let result = Evaluator::new()
            .render_str(&format!("{{{{ parseJWT(\"{token}\").sub }}}}"), &ctx())
            .unwrap();
        assert_eq!(result, json!("42"));
    }

    #[test]
    fn test_deep_clean_helper() {
        let result = Evaluator::new()
            .render_str(
                "{{ deepClean(#{a: 1, secret: 2, nested: #{secret: 3, keep: 4}}, [\"secret\"]) }}",
                &ctx(),
            )
            .unwrap();
        assert_eq!(result, json!({"a": 1, "nested": {"keep": 4}}));
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(
            eval(json!("{{ startsWith(url.pathname, \"/v1\") }}")),
            json!(true)
        );
        assert_eq!(
            eval(json!("{{ includes(body.model, \"opus\") }}")),
            json!(true)
        );
    }

    #[test]
    fn test_math_and_date_modules() {
        assert_eq!(eval(json!("{{ Math::floor(1.9) }}")), json!(1.0));
        let now = eval(json!("{{ Date::now() }}"));
        assert!(now.as_i64().unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_unbounded_loop_rejected() {
        let err = Evaluator::new()
            .render_str("{{ while true { } }}", &ctx())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::Timeout { .. }));
    }

    #[test]
    fn test_parse_error_is_typed() {
        let err = Evaluator::new().render_str("{{ ][ }}", &ctx()).unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
    }

    #[test]
    fn test_evaluation_does_not_mutate_context() {
        let evaluator = Evaluator::new();
        let c = ctx();
        let before = c.body.clone();
        evaluator
            .render_str("{{ body.model = \"mutated\"; body.model }}", &c)
            .unwrap();
        assert_eq!(c.body, before);
    }

    use base64::Engine as _;
}
