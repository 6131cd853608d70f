//! Deterministic request keys.
//!
//! Two requests that mean the same thing must produce the same key no matter
//! in which order their parameters were inserted, so JSON values are rendered
//! in a canonical form (object keys sorted, no whitespace) before keying.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::Method;
use serde_json::Value;
use std::fmt::Write;

/// Renders `value` as compact JSON with object keys sorted at every level.
///
/// ```
/// use palisade::fingerprint::canonical_json;
/// use serde_json::json;
///
/// assert_eq!(
///     canonical_json(&json!({"b": 1, "a": [true, null]})),
///     r#"{"a":[true,null],"b":1}"#
/// );
/// ```
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value's Display escapes exactly like the serializer.
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}

/// Key under which a response is cached.
///
/// The key starts with `"{METHOD} {url}"` so that all entries of one resource
/// share a prefix.
pub fn cache_key(method: &Method, url: &str, params: Option<&Value>) -> String {
    let params = params.map(canonical_json).unwrap_or_default();
    format!("{method} {url}|{params}")
}

/// Key under which an in-flight request is registered for coalescing.
///
/// The payload (params and body) is carried base64-encoded so the key stays a
/// single opaque token.
pub fn dedup_key(method: &Method, url: &str, payload: Option<&Value>) -> String {
    let encoded = payload
        .map(|value| URL_SAFE_NO_PAD.encode(canonical_json(value)))
        .unwrap_or_default();
    format!("{method} {url}#{encoded}")
}
