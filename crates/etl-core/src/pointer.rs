//! JSON pointer extraction of configuration fragments.
//!
//! Pointers follow RFC 6901 with three extensions used by definition files:
//! segments are URL-decoded before `~1`/`~0` unescaping, `-` addresses the
//! last element of an array, and an empty segment falls back to the
//! `_empty_` key when the literal empty key is absent.

use crate::error::{EtlError, Result};
use serde_json::Value;

/// Stand-in key for an empty segment.
pub const EMPTY_KEY_SENTINEL: &str = "_empty_";

pub fn is_valid_pointer(pointer: &str) -> bool {
    pointer.is_empty() || pointer.starts_with('/')
}

/// Decode one `/`-delimited segment.
pub fn decode_segment(segment: &str) -> String {
    let plus_as_space = segment.replace('+', " ");
    let decoded = match urlencoding::decode(&plus_as_space) {
        Ok(s) => s.into_owned(),
        Err(_) => plus_as_space,
    };
    decoded.replace("~1", "/").replace("~0", "~")
}

/// Encode one key so that [`decode_segment`] returns it unchanged.
pub fn encode_segment(key: &str) -> String {
    urlencoding::encode(&key.replace('~', "~0")).into_owned()
}

/// Build a pointer addressing the value reached by following `keys`.
pub fn pointer_from_keys<I, S>(keys: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| format!("/{}", encode_segment(k.as_ref())))
        .collect()
}

/// Return the sub-value of `document` addressed by `pointer`. A segment that
/// does not exist is an error naming the whole pointer, so an existing
/// `null` or `false` is never mistaken for a missing value.
pub fn extract_fragment<'a>(document: &'a Value, pointer: &str) -> Result<&'a Value> {
    if !is_valid_pointer(pointer) {
        return Err(EtlError::InvalidPointer(pointer.to_string()));
    }
    if pointer.is_empty() {
        return Ok(document);
    }

    let not_found = || EtlError::PointerNotFound(pointer.to_string());
    let mut current = document;
    for raw in pointer[1..].split('/') {
        let segment = decode_segment(raw);
        current = match current {
            Value::Object(map) => match map.get(&segment) {
                Some(v) => v,
                None if segment.is_empty() => map.get(EMPTY_KEY_SENTINEL).ok_or_else(not_found)?,
                None => return Err(not_found()),
            },
            Value::Array(items) => {
                if segment == "-" {
                    items.last().ok_or_else(not_found)?
                } else {
                    let index = parse_index(&segment).ok_or_else(not_found)?;
                    items.get(index).ok_or_else(not_found)?
                }
            }
            _ => return Err(not_found()),
        };
    }
    Ok(current)
}

/// Owned variant of [`extract_fragment`].
pub fn extract_fragment_owned(document: &Value, pointer: &str) -> Result<Value> {
    extract_fragment(document, pointer).cloned()
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse().ok()
}
