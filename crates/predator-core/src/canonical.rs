// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical JSON: the single serialisation used for action ids, state
//! hashes, audit record hashes, and HMAC signatures.
//!
//! Rules: keys lexicographically sorted at every depth, `,`/`:` separators
//! with no insignificant whitespace, non-ASCII characters escaped as
//! `\uXXXX` (UTF-16 surrogate pairs above the BMP). Any drift here
//! invalidates the audit chain, so the writer is hand-rolled rather than
//! delegated to a serializer whose escaping policy may change.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a value to its canonical JSON string.
///
/// # Errors
///
/// Returns `serde_json::Error` if the value cannot be represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable 24-hex-char content hash of a JSON-representable value.
///
/// Used for state ids and section hashes; identical values always produce
/// identical hashes.
#[must_use]
pub fn stable_hash(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    let digest = sha256_hex(out.as_bytes());
    digest[..24].to_string()
}

/// Stable 16-hex-char hash of a seed string, for element/frame/form ids.
#[must_use]
pub fn short_hash(seed: &str) -> String {
    let digest = sha256_hex(seed.as_bytes());
    digest[..16].to_string()
}

/// Byte-based token estimate over the canonical form: `max(1, chars / 4)`.
///
/// Intentionally coarse; only the deterministic trim order depends on it.
#[must_use]
pub fn estimate_tokens(value: &Value) -> usize {
    let mut out = String::new();
    write_canonical(value, &mut out);
    (out.len() / 4).max(1)
}

/// Append the canonical rendering of `value` to `out`.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
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
        Value::Object(map) => {
            // serde_json's Map already iterates in key order, but sort
            // explicitly so the writer does not depend on a feature flag.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if c.is_ascii() => out.push(c),
            c => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
        }
    }
    out.push('"');
}
