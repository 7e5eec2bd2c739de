//! Nested JSON → single-level row.
//!
//! Objects are walked recursively and their member names joined with `_`.
//! Arrays are not walked: the whole array is stored as JSON text under the
//! key of the path that led to it.

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Serializer, Value};
use std::io;

use crate::error::{Result, SyncError};

/// Joins nested member names in flattened keys.
pub const KEY_SEPARATOR: char = '_';

/// Flatten `value` into a map from joined key path to scalar or JSON text.
///
/// A bare scalar or array at the top level ends up under the empty key.
pub fn flatten(value: &Value) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    walk(value, String::new(), &mut out)?;
    Ok(out)
}

fn walk(value: &Value, prefix: String, out: &mut Map<String, Value>) -> Result<()> {
    match value {
        Value::Object(members) => {
            for (name, member) in members {
                walk(member, format!("{}{}{}", prefix, name, KEY_SEPARATOR), out)?;
            }
        }
        Value::Array(_) => {
            out.insert(leaf_key(&prefix), Value::String(to_json_text(value)?));
        }
        scalar => {
            out.insert(leaf_key(&prefix), scalar.clone());
        }
    }
    Ok(())
}

fn leaf_key(prefix: &str) -> String {
    prefix.strip_suffix(KEY_SEPARATOR).unwrap_or(prefix).to_string()
}

/// Prepend `prefix` to every key, e.g. `sleep_` for the sleep bucket.
pub fn prefixed(map: Map<String, Value>, prefix: &str) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| (format!("{}{}", prefix, key), value))
        .collect()
}

/// Serialize JSON in the spaced, ASCII-only style the history table has always
/// used for embedded arrays: `[1, 2]`, `{"a": 1}`, `"caf\u00e9"`.
pub fn to_json_text<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = Serializer::with_formatter(&mut buf, SpacedAsciiFormatter);
    value.serialize(&mut ser)?;
    String::from_utf8(buf).map_err(|e| SyncError::Other(format!("JSON text is not UTF-8: {}", e)))
}

struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}
