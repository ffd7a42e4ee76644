//! Canonical JSON serialization and SHA-256 digests.
//!
//! Canonical form: object keys sorted by byte order, no whitespace, numbers in
//! `serde_json`'s shortest round-trip form (integers and floats stay distinct,
//! so `1` and `1.0` hash differently), `null` preserved.

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::DispatchError;

/// Hard recursion ceiling for canonicalization, independent of caller limits.
pub const MAX_CANONICAL_DEPTH: usize = 1024;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serialize a value into canonical bytes.
///
/// # Errors
/// Returns a `Resource` error when nesting exceeds [`MAX_CANONICAL_DEPTH`].
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, DispatchError> {
    canonical_bytes_bounded(value, MAX_CANONICAL_DEPTH, usize::MAX)
}

/// Serialize a value into canonical bytes, failing closed once `max_depth`
/// nesting levels or `max_bytes` output bytes are exceeded.
///
/// # Errors
/// Returns a `Resource` error naming the exceeded limit.
pub fn canonical_bytes_bounded(
    value: &Value,
    max_depth: usize,
    max_bytes: usize,
) -> Result<Vec<u8>, DispatchError> {
    let mut writer = CanonicalWriter {
        out: Vec::new(),
        max_depth: max_depth.min(MAX_CANONICAL_DEPTH),
        max_bytes,
    };
    writer.write_value(value, 0)?;
    Ok(writer.out)
}

/// Canonical digest of a structured value.
///
/// # Errors
/// Returns a `Resource` error when the value is nested too deeply.
pub fn digest(value: &Value) -> Result<String, DispatchError> {
    Ok(hash_bytes(&canonical_bytes(value)?))
}

/// Canonical digest of any serializable value.
///
/// # Errors
/// Returns a `Shape` error if the value cannot be represented as JSON, or a
/// `Resource` error when it is nested too deeply.
pub fn digest_serialize<T: serde::Serialize>(value: &T) -> Result<String, DispatchError> {
    let value = serde_json::to_value(value)
        .map_err(|err| DispatchError::shape("value", format!("not representable: {err}")))?;
    digest(&value)
}

/// Convert a float into the canonical value model.
///
/// Non-finite numbers have no canonical form and are always rejected.
///
/// # Errors
/// Returns a `Shape` error for NaN and infinities.
pub fn canonical_number(value: f64) -> Result<Value, DispatchError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| DispatchError::shape("number", format!("non-finite value {value}")))
}

/// Whether `candidate` looks like a lowercase hex SHA-256 digest.
#[must_use]
pub fn is_digest_shaped(candidate: &str) -> bool {
    candidate.len() == DIGEST_HEX_LEN
        && candidate
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

struct CanonicalWriter {
    out: Vec<u8>,
    max_depth: usize,
    max_bytes: usize,
}

impl CanonicalWriter {
    fn write_value(&mut self, value: &Value, depth: usize) -> Result<(), DispatchError> {
        match value {
            Value::Null => self.push(b"null"),
            Value::Bool(true) => self.push(b"true"),
            Value::Bool(false) => self.push(b"false"),
            Value::Number(number) => self.push(number.to_string().as_bytes()),
            Value::String(text) => self.write_string(text),
            Value::Array(items) => {
                self.enter(depth)?;
                self.push(b"[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        self.push(b",")?;
                    }
                    self.write_value(item, depth + 1)?;
                }
                self.push(b"]")
            }
            Value::Object(map) => {
                self.enter(depth)?;
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|lhs, rhs| lhs.0.cmp(rhs.0));
                self.push(b"{")?;
                for (index, (key, item)) in entries.into_iter().enumerate() {
                    if index > 0 {
                        self.push(b",")?;
                    }
                    self.write_string(key)?;
                    self.push(b":")?;
                    self.write_value(item, depth + 1)?;
                }
                self.push(b"}")
            }
        }
    }

    fn enter(&self, depth: usize) -> Result<(), DispatchError> {
        if depth >= self.max_depth {
            return Err(DispatchError::resource(
                "max_payload_depth",
                format!("nesting exceeds {} levels", self.max_depth),
            ));
        }
        Ok(())
    }

    fn write_string(&mut self, text: &str) -> Result<(), DispatchError> {
        let encoded = serde_json::to_string(text)
            .map_err(|err| DispatchError::shape("string", err.to_string()))?;
        self.push(encoded.as_bytes())
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), DispatchError> {
        if self.out.len().saturating_add(bytes.len()) > self.max_bytes {
            return Err(DispatchError::resource(
                "max_payload_bytes",
                format!("canonical form exceeds {} bytes", self.max_bytes),
            ));
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }
}
