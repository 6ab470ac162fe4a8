//! The helper library exposed to `{{ … }}` expressions.
//!
//! Helpers are registered on every engine by name; nothing else is
//! reachable from an expression: no filesystem, process, network, or
//! module loading.

use super::value::{dynamic_to_json, json_to_dynamic};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::Rng;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Module};
use sha2::{Digest, Sha256};

pub fn register_helpers(engine: &mut Engine) {
    register_identity_helpers(engine);
    register_text_helpers(engine);
    register_json_helpers(engine);
    register_collection_helpers(engine);
    register_numeric_helpers(engine);
    register_type_helpers(engine);
    register_string_methods(engine);
    engine.register_static_module("Math", math_module().into());
    engine.register_static_module("Date", date_module().into());
}

fn register_identity_helpers(engine: &mut Engine) {
    engine.register_fn("uuid", || uuid::Uuid::new_v4().to_string());

    engine.register_fn("randomInt", |min: i64, max: i64| {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        rand::thread_rng().gen_range(lo..=hi)
    });

    engine.register_fn("md5", |s: &str| format!("{:x}", md5::compute(s)));

    engine.register_fn("sha256", |s: &str| {
        let digest = Sha256::digest(s.as_bytes());
        digest.iter().fold(String::new(), |mut acc, b| {
            acc.push_str(&format!("{b:02x}"));
            acc
        })
    });

    engine.register_fn(
        "encrypt",
        |s: &str, mode: &str| -> Result<String, Box<EvalAltResult>> {
            match mode {
                "base64" => Ok(STANDARD.encode(s)),
                other => Err(format!("unsupported encrypt mode '{other}'").into()),
            }
        },
    );
}

fn register_text_helpers(engine: &mut Engine) {
    engine.register_fn("base64encode", |s: &str| STANDARD.encode(s));

    engine.register_fn(
        "base64decode",
        |s: &str| -> Result<String, Box<EvalAltResult>> {
            let bytes = STANDARD
                .decode(s)
                .map_err(|e| format!("base64decode: {e}"))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        },
    );

    engine.register_fn("toLowerCase", |s: &str| s.to_lowercase());
    engine.register_fn("toUpperCase", |s: &str| s.to_uppercase());
    engine.register_fn("trim", |s: &str| s.trim().to_string());

    engine.register_fn("split", |s: &str, sep: &str| -> Array {
        s.split(sep)
            .map(|part| Dynamic::from(part.to_string()))
            .collect()
    });

    // Mirrors the host-language String.replace: first occurrence only.
    engine.register_fn("replace", |s: &str, find: &str, with: &str| {
        s.replacen(find, with, 1)
    });
}

fn register_json_helpers(engine: &mut Engine) {
    engine.register_fn(
        "jsonParse",
        |s: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let value: serde_json::Value =
                serde_json::from_str(s).map_err(|e| format!("jsonParse: {e}"))?;
            Ok(json_to_dynamic(value))
        },
    );

    engine.register_fn(
        "jsonStringify",
        |v: Dynamic| -> Result<String, Box<EvalAltResult>> {
            serde_json::to_string(&dynamic_to_json(v)).map_err(|e| format!("jsonStringify: {e}").into())
        },
    );

    // Decodes the claims object from a JWT's payload segment. The token
    // is not verified; this is a decode, not an authentication check.
    engine.register_fn(
        "parseJWT",
        |token: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let payload = token
                .split('.')
                .nth(1)
                .ok_or_else(|| Box::<EvalAltResult>::from("parseJWT: malformed token"))?;
            let bytes = URL_SAFE_NO_PAD
                .decode(payload.trim_end_matches('='))
                .map_err(|e| format!("parseJWT: {e}"))?;
            let claims: serde_json::Value =
                serde_json::from_slice(&bytes).map_err(|e| format!("parseJWT: {e}"))?;
            Ok(json_to_dynamic(claims))
        },
    );
}

fn register_collection_helpers(engine: &mut Engine) {
    engine.register_fn("first", |arr: Array| {
        arr.first().cloned().unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("last", |arr: Array| {
        arr.last().cloned().unwrap_or(Dynamic::UNIT)
    });

    engine.register_fn("length", |arr: Array| arr.len() as i64);
    engine.register_fn("length", |map: Map| map.len() as i64);
    engine.register_fn("length", |s: &str| s.chars().count() as i64);

    engine.register_fn("keys", |map: Map| -> Array {
        map.keys().map(|k| Dynamic::from(k.to_string())).collect()
    });
    engine.register_fn("values", |map: Map| -> Array { map.values().cloned().collect() });

    engine.register_fn("deepClean", |obj: Map, keys: Array| -> Map {
        let drop: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
        deep_clean_map(obj, &drop)
    });
}

fn register_numeric_helpers(engine: &mut Engine) {
    // Host-language parseInt semantics: leading integer prefix, unit on
    // no digits at all.
    engine.register_fn("parseInt", |s: &str| -> Dynamic {
        match parse_leading::<i64>(s, |c| c.is_ascii_digit()) {
            Some(n) => Dynamic::from(n),
            None => Dynamic::UNIT,
        }
    });

    engine.register_fn("parseFloat", |s: &str| -> Dynamic {
        match parse_leading::<f64>(s, |c| c.is_ascii_digit() || c == '.') {
            Some(n) => Dynamic::from(n),
            None => Dynamic::UNIT,
        }
    });

    engine.register_fn("now", || chrono::Utc::now().timestamp_millis());
}

fn register_type_helpers(engine: &mut Engine) {
    engine.register_fn("isString", |v: Dynamic| v.is_string());
    engine.register_fn("isNumber", |v: Dynamic| v.is_int() || v.is_float());
    engine.register_fn("isArray", |v: Dynamic| v.is_array());
    engine.register_fn("isObject", |v: Dynamic| v.is_map());
}

fn register_string_methods(engine: &mut Engine) {
    engine.register_fn("includes", |s: &str, needle: &str| s.contains(needle));
    engine.register_fn("startsWith", |s: &str, prefix: &str| s.starts_with(prefix));
    engine.register_fn("endsWith", |s: &str, suffix: &str| s.ends_with(suffix));
}

fn math_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("floor", |x: f64| Ok(x.floor()));
    module.set_native_fn("floor", |x: i64| Ok(x));
    module.set_native_fn("ceil", |x: f64| Ok(x.ceil()));
    module.set_native_fn("ceil", |x: i64| Ok(x));
    module.set_native_fn("round", |x: f64| Ok(x.round()));
    module.set_native_fn("round", |x: i64| Ok(x));
    module.set_native_fn("abs", |x: f64| Ok(x.abs()));
    module.set_native_fn("abs", |x: i64| Ok(x.abs()));
    module.set_native_fn("min", |a: i64, b: i64| Ok(a.min(b)));
    module.set_native_fn("min", |a: f64, b: f64| Ok(a.min(b)));
    module.set_native_fn("max", |a: i64, b: i64| Ok(a.max(b)));
    module.set_native_fn("max", |a: f64, b: f64| Ok(a.max(b)));
    module.set_native_fn("random", || Ok(rand::thread_rng().gen_range(0.0f64..1.0)));
    module
}

fn date_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("now", || Ok(chrono::Utc::now().timestamp_millis()));
    module.set_native_fn("iso", || {
        Ok(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    });
    module
}

fn parse_leading<T: std::str::FromStr>(s: &str, accept: fn(char) -> bool) -> Option<T> {
    let trimmed = s.trim_start();
    let mut end = 0;
    for (idx, c) in trimmed.char_indices() {
        if idx == 0 && (c == '-' || c == '+') {
            end = idx + c.len_utf8();
            continue;
        }
        if accept(c) {
            end = idx + c.len_utf8();
        } else {
            break;
        }
    }
    trimmed[..end].parse().ok()
}

fn deep_clean_map(map: Map, drop: &[String]) -> Map {
    map.into_iter()
        .filter(|(k, _)| !drop.iter().any(|d| d == k.as_str()))
        .map(|(k, v)| (k, deep_clean_dynamic(v, drop)))
        .collect()
}

fn deep_clean_dynamic(value: Dynamic, drop: &[String]) -> Dynamic {
    if let Some(map) = value.clone().try_cast::<Map>() {
        Dynamic::from(deep_clean_map(map, drop))
    } else if let Some(arr) = value.clone().try_cast::<Array>() {
        let cleaned: Array = arr
            .into_iter()
            .map(|v| deep_clean_dynamic(v, drop))
            .collect();
        Dynamic::from(cleaned)
    } else {
        value
    }
}
