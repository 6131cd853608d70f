//! Outbound payload sanitization.
//!
//! Strings anywhere in a JSON payload (object keys included) are stripped of
//! markup that could execute in a browser that later renders them. Detection
//! is separate from cleaning: [`DataSanitizer::detect_suspicious_patterns`]
//! reports what the raw payload contained so it can be logged as a security
//! event before the cleaned copy is sent.

use crate::config::SecurityConfig;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("script block regex is valid")
});

static EMBED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(iframe|object|embed)\b[^>]*>.*?</(iframe|object|embed)\s*>")
        .expect("embed block regex is valid")
});

static DANGEROUS_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(script|iframe|object|embed|link|meta|style|base|form)\b[^>]*>")
        .expect("dangerous tag regex is valid")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<>]+>").expect("tag regex is valid"));

static EVENT_HANDLER_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("event handler regex is valid")
});

static SCRIPT_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(javascript|vbscript)\s*:").expect("script uri regex is valid")
});

static DETECTORS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("script_tag", r"(?i)<script\b"),
        ("javascript_uri", r"(?i)javascript\s*:"),
        ("vbscript_uri", r"(?i)vbscript\s*:"),
        ("data_html_uri", r"(?i)data\s*:\s*text/html"),
        ("event_handler", r"(?i)<[^>]*\bon[a-z]+\s*="),
        (
            "sql_injection",
            r"(?i)('\s*(or|and)\s+'?\d+'?\s*=\s*'?\d+|;\s*(drop|delete|truncate|alter)\s+table\b|\bunion\s+(all\s+)?select\b|--\s*$)",
        ),
        ("path_traversal", r"(\.\./|\.\.\\|%2e%2e%2f)"),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        (
            name,
            Regex::new(pattern).expect("suspicious pattern regex is valid"),
        )
    })
    .collect()
});

fn strip_markup(input: &str) -> String {
    let out = SCRIPT_BLOCK.replace_all(input, "");
    let out = EMBED_BLOCK.replace_all(&out, "");
    let out = TAG.replace_all(&out, |caps: &regex::Captures<'_>| {
        EVENT_HANDLER_ATTR.replace_all(&caps[0], "").into_owned()
    });
    let out = DANGEROUS_TAG.replace_all(&out, "");
    SCRIPT_URI.replace_all(&out, "").into_owned()
}

/// One suspicious string found in a payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SuspiciousMatch {
    /// Name of the pattern that matched, e.g. `"script_tag"`.
    pub pattern: &'static str,
    /// JSON-pointer style location of the string, `""` for the root.
    pub path: String,
}

pub struct DataSanitizer {
    max_depth: usize,
    max_request_size: usize,
}

impl DataSanitizer {
    pub fn new(max_depth: usize, max_request_size: usize) -> Self {
        Self {
            max_depth,
            max_request_size,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.max_sanitize_depth, config.max_request_size)
    }

    /// Returns a cleaned copy of `data`.
    ///
    /// Strings are cleaned with [`sanitize_str`](Self::sanitize_str); other
    /// scalars pass through. Containers nested deeper than the configured
    /// depth are replaced by `null`.
    ///
    /// ```
    /// use palisade::sanitizer::DataSanitizer;
    /// use serde_json::json;
    ///
    /// let sanitizer = DataSanitizer::new(10, 1024);
    /// let clean = sanitizer.sanitize_request(&json!({
    ///     "name": "<script>alert(1)</script>Bob",
    ///     "age": 30
    /// }));
    /// assert_eq!(clean, json!({"name": "Bob", "age": 30}));
    /// ```
    pub fn sanitize_request(&self, data: &Value) -> Value {
        self.sanitize_value(data, 0)
    }

    fn sanitize_value(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_str(s)),
            Value::Array(_) | Value::Object(_) if depth >= self.max_depth => {
                tracing::debug!(depth, "Payload nested too deeply, truncating");
                Value::Null
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_value(item, depth + 1))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut clean = Map::with_capacity(map.len());
                for (key, item) in map {
                    clean.insert(self.sanitize_str(key), self.sanitize_value(item, depth + 1));
                }
                Value::Object(clean)
            }
            scalar => scalar.clone(),
        }
    }

    /// Removes script, iframe, object and embed blocks, stray dangerous
    /// tags, inline event handlers and `javascript:`/`vbscript:` schemes.
    ///
    /// Passes repeat until the text stops changing, so fragments that join
    /// up after an inner match is removed are caught too.
    ///
    /// ```
    /// use palisade::sanitizer::DataSanitizer;
    ///
    /// let sanitizer = DataSanitizer::new(10, 1024);
    /// assert_eq!(sanitizer.sanitize_str("<scr<script>ipt>alert(1)"), "alert(1)");
    /// ```
    pub fn sanitize_str(&self, input: &str) -> String {
        let mut current = strip_markup(input);
        // Every pass that changes the text shortens it.
        loop {
            let next = strip_markup(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    /// Scans every string of `data` (keys included) for known attack
    /// patterns. Does not modify anything.
    pub fn detect_suspicious_patterns(&self, data: &Value) -> Vec<SuspiciousMatch> {
        let mut found = Vec::new();
        scan(data, String::new(), &mut found);
        found
    }

    /// Whether the serialized payload fits under the configured ceiling.
    pub fn validate_request_size(&self, data: &Value) -> bool {
        Self::request_size(data) <= self.max_request_size
    }

    /// Size in bytes of the compact JSON rendering of `data`.
    pub fn request_size(data: &Value) -> usize {
        serde_json::to_vec(data).map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn max_request_size(&self) -> usize {
        self.max_request_size
    }
}

fn scan(value: &Value, path: String, found: &mut Vec<SuspiciousMatch>) {
    match value {
        Value::String(s) => check(s, &path, found),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                scan(item, format!("{path}/{i}"), found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = format!("{path}/{key}");
                check(key, &child, found);
                scan(item, child, found);
            }
        }
        _ => {}
    }
}

fn check(s: &str, path: &str, found: &mut Vec<SuspiciousMatch>) {
    for (name, regex) in DETECTORS.iter() {
        if regex.is_match(s) {
            found.push(SuspiciousMatch {
                pattern: *name,
                path: path.to_string(),
            });
        }
    }
}
