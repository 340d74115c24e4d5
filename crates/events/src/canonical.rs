//! Canonical serialization and hash-chain computation.
//!
//! Determinism is mandatory: same input always produces the same
//! bytes, on every platform. The canonical form is JSON with keys
//! sorted lexicographically at every level, compact separators, and
//! ASCII-only output (non-ASCII escaped as `\uXXXX`).
//!
//! Hash formula:
//!
//! ```text
//! event_hash = SHA256(canonical(payload) | previous_event_hash | canonical(stable_header))
//! ```
//!
//! joined with a literal `|` separator. The first event of a business
//! chains to the ASCII sentinel `GENESIS`. Digests are lowercase hex.
//!
//! This module only computes and verifies. It does not persist or
//! dispatch.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sentinel `previous_event_hash` for the first event of a business.
pub const GENESIS_HASH: &str = "GENESIS";

/// Separator between the hashed segments.
const SEGMENT_SEPARATOR: &str = "|";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    /// The input contains a value the canonical form cannot express.
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Produce the canonical byte-stable encoding of a JSON value.
///
/// Rules (published, frozen):
/// - object keys sorted lexicographically by UTF-8 bytes, all levels
/// - no insignificant whitespace (`,` and `:` separators only)
/// - strings escaped ASCII-only (`\uXXXX`, surrogate pairs beyond BMP)
/// - integers in minimal decimal form, floats in shortest round-trip
///   form; decimal quantities must be carried as strings upstream
/// - `null` is encoded; absent keys are simply not present
pub fn canonical_json(value: &JsonValue) -> Result<String, CanonicalError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &JsonValue, out: &mut String) -> Result<(), CanonicalError> {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(true) => out.push_str("true"),
        JsonValue::Bool(false) => out.push_str("false"),
        JsonValue::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CanonicalError::Encoding(
                        "non-finite number is not representable".to_string(),
                    ));
                }
            }
            out.push_str(&n.to_string());
        }
        JsonValue::String(s) => write_escaped(s, out),
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                // Key came from the map; lookup cannot fail.
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if c.is_ascii() => out.push(c),
            c => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
    }
    out.push('"');
}

/// Compute the chain hash for an event.
///
/// `stable_header` is the canonical header object built from the
/// identity fields of the event (see `CandidateEvent::stable_header`).
pub fn compute_event_hash(
    payload: &JsonValue,
    previous_event_hash: &str,
    stable_header: &JsonValue,
) -> Result<String, CanonicalError> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload)?.as_bytes());
    hasher.update(SEGMENT_SEPARATOR.as_bytes());
    hasher.update(previous_event_hash.as_bytes());
    hasher.update(SEGMENT_SEPARATOR.as_bytes());
    hasher.update(canonical_json(stable_header)?.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
