//! Canonical CBOR serialization for deterministic certificate hashing.
//!
//! Issuer and verifier must derive the same bytes from the same logical
//! document, so the JSON certificate is re-encoded as deterministic CBOR
//! before hashing.
//!
//! ## Canonicalization Rules (RFC 8949 Section 4.2.1)
//! 1. Map keys sorted by their encoded byte string (shorter keys first)
//! 2. Integers encoded in minimal form
//! 3. Floating-point rejected; integral JSON numbers become integers
//! 4. No indefinite-length encoding
//! 5. `\r\n` inside text is normalized to `\n`

use crate::crypto::sha256;
use crate::types::Hash256;
use ciborium::value::{Integer, Value as CborValue};
use serde_json::{Map, Number, Value};
use std::io::{Cursor, Read};
use thiserror::Error;

/// Top-level fields every certificate document must carry.
pub const CERTIFICATE_REQUIRED_FIELDS: &[&str] =
    &["id", "type", "issuedOn", "recipient", "recipientProfile", "badge"];

/// Top-level fields outside the hash scope (the embedded proof block).
pub const HASH_EXCLUDED_FIELDS: &[&str] = &["signature"];

/// Largest integer a JSON float can carry without losing precision.
const MAX_SAFE_FLOAT_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("CBOR encoding error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Value at {path} is not representable canonically: {reason}")]
    Unrepresentable { path: String, reason: String },

    #[error("Non-canonical encoding: {0}")]
    NonCanonical(&'static str),
}

pub type Result<T> = std::result::Result<T, EncodingError>;

/// Serialize a JSON document to canonical CBOR bytes.
pub fn serialize(doc: &Value) -> Result<Vec<u8>> {
    let canonical = canonicalize(doc, "$")?;
    let buf = encode_item(&canonical)?;
    verify_canonical(&buf)?;
    Ok(buf)
}

/// Serialize a certificate document, enforcing required fields and
/// dropping the fields outside the hash scope.
pub fn serialize_certificate(doc: &Value) -> Result<Vec<u8>> {
    let object = doc.as_object().ok_or_else(|| EncodingError::Unrepresentable {
        path: "$".to_string(),
        reason: "certificate must be an object".to_string(),
    })?;

    for field in CERTIFICATE_REQUIRED_FIELDS {
        match object.get(*field) {
            None | Some(Value::Null) => return Err(EncodingError::MissingField(field.to_string())),
            Some(_) => {}
        }
    }

    let scoped: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !HASH_EXCLUDED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    serialize(&Value::Object(scoped))
}

/// Leaf hash of a certificate: SHA-256 over its canonical bytes.
pub fn certificate_hash(doc: &Value) -> Result<Hash256> {
    Ok(sha256(&serialize_certificate(doc)?))
}

fn canonicalize(value: &Value, path: &str) -> Result<CborValue> {
    let item = match value {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(n) => CborValue::Integer(canonical_integer(n, path)?),
        Value::String(s) => CborValue::Text(normalize_text(s)),
        Value::Array(items) => CborValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| canonicalize(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, item) in map {
                let key = normalize_text(key);
                let encoded_key = encode_item(&CborValue::Text(key.clone()))?;
                let item = canonicalize(item, &format!("{path}.{key}"))?;
                entries.push((encoded_key, key, item));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            if entries.windows(2).any(|pair| pair[0].0 == pair[1].0) {
                return Err(EncodingError::Unrepresentable {
                    path: path.to_string(),
                    reason: "duplicate key after text normalization".to_string(),
                });
            }

            CborValue::Map(
                entries
                    .into_iter()
                    .map(|(_, key, item)| (CborValue::Text(key), item))
                    .collect(),
            )
        }
    };
    Ok(item)
}

fn canonical_integer(n: &Number, path: &str) -> Result<Integer> {
    if let Some(u) = n.as_u64() {
        return Ok(Integer::from(u));
    }
    if let Some(i) = n.as_i64() {
        return Ok(Integer::from(i));
    }

    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_FLOAT_INTEGER => {
            Ok(Integer::from(f as i64))
        }
        _ => Err(EncodingError::Unrepresentable {
            path: path.to_string(),
            reason: format!("non-integral number {n}"),
        }),
    }
}

fn normalize_text(s: &str) -> String {
    s.replace("\r\n", "\n")
}

fn encode_item(item: &CborValue) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(item, &mut buf)?;
    Ok(buf)
}

/// Verify that CBOR bytes are in canonical form.
///
/// Checks for:
/// - No indefinite-length encoding (additional info 31)
/// - Minimal length/integer headers
/// - No floating-point items
/// - Map keys strictly increasing by encoded bytes
fn verify_canonical(bytes: &[u8]) -> Result<()> {
    let mut cursor = Cursor::new(bytes);
    verify_canonical_item(&mut cursor)?;
    if (cursor.position() as usize) != bytes.len() {
        return Err(EncodingError::NonCanonical("trailing bytes after item"));
    }
    Ok(())
}

fn verify_canonical_item(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;

    let major_type = (buf[0] & 0xE0) >> 5;
    let additional_info = buf[0] & 0x1F;

    if additional_info == 31 {
        return Err(EncodingError::NonCanonical("indefinite-length item"));
    }
    if major_type == 7 && (25..=27).contains(&additional_info) {
        return Err(EncodingError::NonCanonical("floating-point item"));
    }

    let length = match additional_info {
        0..=23 => additional_info as u64,
        24 => read_header_argument::<1>(cursor, 24)?,
        25 => read_header_argument::<2>(cursor, 0x100)?,
        26 => read_header_argument::<4>(cursor, 0x1_0000)?,
        27 => read_header_argument::<8>(cursor, 0x1_0000_0000)?,
        _ => return Err(EncodingError::NonCanonical("reserved additional info")),
    };

    match major_type {
        0 | 1 | 7 => {}
        2 | 3 => {
            let end = cursor.position() + length;
            if end > cursor.get_ref().len() as u64 {
                return Err(EncodingError::NonCanonical("truncated string"));
            }
            cursor.set_position(end);
        }
        4 => {
            for _ in 0..length {
                verify_canonical_item(cursor)?;
            }
        }
        5 => {
            let mut previous_key: Option<(u64, u64)> = None;
            for _ in 0..length {
                let key_start = cursor.position();
                verify_canonical_item(cursor)?;
                let key_end = cursor.position();

                if let Some((prev_start, prev_end)) = previous_key {
                    let data = cursor.get_ref();
                    let prev = &data[prev_start as usize..prev_end as usize];
                    let current = &data[key_start as usize..key_end as usize];
                    if prev >= current {
                        return Err(EncodingError::NonCanonical("map keys out of order"));
                    }
                }
                previous_key = Some((key_start, key_end));

                verify_canonical_item(cursor)?;
            }
        }
        6 => {
            verify_canonical_item(cursor)?;
        }
        _ => {}
    }

    Ok(())
}

fn read_header_argument<const N: usize>(cursor: &mut Cursor<&[u8]>, minimum: u64) -> Result<u64> {
    let mut buf = [0u8; N];
    cursor.read_exact(&mut buf)?;
    let value = buf.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    if value < minimum {
        return Err(EncodingError::NonCanonical("non-minimal header"));
    }
    Ok(value)
}
