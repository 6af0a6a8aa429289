//! The fixed template function catalog.
//!
//! Grouped as: security escapes, event-payload access, string utilities,
//! conversions, collections, and logic. Truthiness throughout follows one
//! rule: none/undefined, `""`, `0`, and empty collections are false;
//! everything else is true.

use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, Value};

/// Spec truthiness for catalog logic helpers.
pub(crate) fn truthy(value: &Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return false;
    }
    match value.kind() {
        ValueKind::Bool => value.is_true(),
        ValueKind::Number => {
            if let Ok(n) = i64::try_from(value.clone()) {
                n != 0
            } else if let Ok(f) = f64::try_from(value.clone()) {
                f != 0.0
            } else {
                true
            }
        }
        ValueKind::String => value.as_str().map(|s| !s.is_empty()).unwrap_or(true),
        ValueKind::Seq | ValueKind::Map => value.len().map(|l| l > 0).unwrap_or(true),
        _ => true,
    }
}

/// Render a value as a plain string: strings verbatim, none/undefined as
/// empty, everything else as compact JSON.
fn plain_string(value: &Value) -> String {
    if let Some(s) = value.as_str() {
        return s.to_string();
    }
    if value.is_none() || value.is_undefined() {
        return String::new();
    }
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Security escapes
// ---------------------------------------------------------------------------

fn shell_quote(value: Value) -> String {
    format!("'{}'", plain_string(&value).replace('\'', "'\\''"))
}

fn json_escape(value: Value) -> String {
    let quoted = serde_json::to_string(&plain_string(&value)).unwrap_or_default();
    // Strip the surrounding quotes serde adds around the string literal.
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

fn url_encode(value: Value) -> String {
    let mut out = String::new();
    for byte in plain_string(&value).bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn html_escape(value: Value) -> String {
    plain_string(&value)
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ---------------------------------------------------------------------------
// Event access
// ---------------------------------------------------------------------------

fn payload_of(event: &Value) -> serde_json::Value {
    serde_json::to_value(event)
        .ok()
        .and_then(|v| v.get("payload").cloned())
        .unwrap_or(serde_json::Value::Null)
}

/// Walk a dotted path through the payload. Traversing through a non-map
/// yields `Null`.
fn lookup_path<'a>(
    payload: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = payload;
    for segment in path.split('.') {
        match current {
            serde_json::Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn event_field(path: String, event: Value) -> Value {
    let payload = payload_of(&event);
    if path.is_empty() {
        return Value::from_serialize(&payload);
    }
    match lookup_path(&payload, &path) {
        Some(found) => Value::from_serialize(found),
        None => Value::from(()),
    }
}

fn event_has_field(path: String, event: Value) -> bool {
    if path.is_empty() {
        return true;
    }
    lookup_path(&payload_of(&event), &path).is_some()
}

/// Payload entries whose key contains `substr` (case-sensitive).
fn event_filter(substr: String, event: Value) -> Value {
    let payload = payload_of(&event);
    let mut filtered = serde_json::Map::new();
    if let serde_json::Value::Object(map) = payload {
        for (key, value) in map {
            if key.contains(&substr) {
                filtered.insert(key, value);
            }
        }
    }
    Value::from_serialize(&serde_json::Value::Object(filtered))
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn default_fn(value: Value, fallback: Value) -> Value {
    if truthy(&value) {
        value
    } else {
        fallback
    }
}

fn join(value: Value, separator: String) -> Result<String, Error> {
    let iter = value.try_iter().map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("join expects a sequence: {e}"))
    })?;
    Ok(iter
        .map(|item| plain_string(&item))
        .collect::<Vec<_>>()
        .join(&separator))
}

fn contains(value: Value, needle: Value) -> bool {
    if let Some(s) = value.as_str() {
        return s.contains(&plain_string(&needle));
    }
    if matches!(value.kind(), ValueKind::Seq) {
        if let Ok(iter) = value.try_iter() {
            return iter.into_iter().any(|item| item == needle);
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_int(value: Value) -> i64 {
    if let Ok(n) = i64::try_from(value.clone()) {
        return n;
    }
    if let Ok(f) = f64::try_from(value.clone()) {
        return f as i64;
    }
    if let Some(s) = value.as_str() {
        if let Ok(n) = s.trim().parse::<i64>() {
            return n;
        }
        if let Ok(f) = s.trim().parse::<f64>() {
            return f as i64;
        }
    }
    if value.is_true() { 1 } else { 0 }
}

fn to_float(value: Value) -> f64 {
    if let Ok(f) = f64::try_from(value.clone()) {
        return f;
    }
    if let Ok(n) = i64::try_from(value.clone()) {
        return n as f64;
    }
    if let Some(s) = value.as_str() {
        if let Ok(f) = s.trim().parse::<f64>() {
            return f;
        }
    }
    if value.is_true() { 1.0 } else { 0.0 }
}

fn to_bool(value: Value) -> bool {
    if let Some(s) = value.as_str() {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" => return true,
            "false" => return false,
            _ => {}
        }
    }
    truthy(&value)
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

fn keys(value: Value) -> Result<Value, Error> {
    if !matches!(value.kind(), ValueKind::Map) {
        return Ok(Value::from(Vec::<String>::new()));
    }
    let keys: Vec<Value> = value
        .try_iter()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?
        .collect();
    Ok(Value::from(keys))
}

fn values(value: Value) -> Result<Value, Error> {
    if !matches!(value.kind(), ValueKind::Map) {
        return Ok(Value::from(Vec::<Value>::new()));
    }
    let mut out = Vec::new();
    for key in value
        .try_iter()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?
    {
        out.push(value.get_item(&key).unwrap_or_else(|_| Value::from(())));
    }
    Ok(Value::from(out))
}

fn length(value: Value) -> usize {
    value.len().unwrap_or(0)
}

fn first(value: Value) -> Value {
    if let Some(s) = value.as_str() {
        return s
            .chars()
            .next()
            .map(|c| Value::from(c.to_string()))
            .unwrap_or(Value::from(()));
    }
    value
        .try_iter()
        .ok()
        .and_then(|mut iter| iter.next())
        .unwrap_or(Value::from(()))
}

fn last(value: Value) -> Value {
    if let Some(s) = value.as_str() {
        return s
            .chars()
            .next_back()
            .map(|c| Value::from(c.to_string()))
            .unwrap_or(Value::from(()));
    }
    value
        .try_iter()
        .ok()
        .and_then(|iter| iter.last())
        .unwrap_or(Value::from(()))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register the full catalog on an environment.
pub fn register_catalog(env: &mut Environment<'static>) {
    // Security
    env.add_filter("shell_quote", shell_quote);
    env.add_filter("json_escape", json_escape);
    env.add_filter("url_encode", url_encode);
    env.add_filter("html_escape", html_escape);

    // Event access
    env.add_function("event_field", event_field);
    env.add_function("event_has_field", event_has_field);
    env.add_function("event_filter", event_filter);

    // Utilities
    env.add_filter("default", default_fn);
    env.add_function("default", default_fn);
    env.add_filter("empty", |v: Value| !truthy(&v));
    env.add_filter("trim", |s: String| s.trim().to_string());
    env.add_filter("upper", |s: String| s.to_uppercase());
    env.add_filter("lower", |s: String| s.to_lowercase());
    env.add_filter("split", |s: String, sep: String| {
        s.split(&sep).map(str::to_string).collect::<Vec<_>>()
    });
    env.add_filter("join", join);
    env.add_filter("replace", |s: String, from: String, to: String| {
        s.replace(&from, &to)
    });
    env.add_filter("contains", contains);
    env.add_filter("has_prefix", |s: String, prefix: String| {
        s.starts_with(&prefix)
    });
    env.add_filter("has_suffix", |s: String, suffix: String| {
        s.ends_with(&suffix)
    });

    // Conversions
    env.add_filter("to_string", |v: Value| plain_string(&v));
    env.add_filter("to_int", to_int);
    env.add_filter("to_float", to_float);
    env.add_filter("to_bool", to_bool);

    // Collections
    env.add_filter("keys", keys);
    env.add_filter("values", values);
    env.add_filter("length", length);
    env.add_filter("first", first);
    env.add_filter("last", last);

    // Logic. `or`, `and`, `not` are template-language keywords; the native
    // operators already carry the catalog's truthiness semantics, so only
    // `if_then_else` needs registering.
    env.add_function("if_then_else", |cond: Value, then_v: Value, else_v: Value| {
        if truthy(&cond) { then_v } else { else_v }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
