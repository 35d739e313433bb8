//! Wire codec for log lines and inbound commands.
//!
//! Any field named `id` or ending in `_id` is an identifier field. Decoding
//! turns identifiers into canonical decimal strings (so values wider than 64
//! bits survive); encoding turns them back into JSON numbers when they fit an
//! `i64` and leaves them as digit strings otherwise.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::normalize::{IntegerString, is_digits, normalize_integer_string};
use super::types::Record;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("codec capability missing: {0}")]
    MissingCapability(String),
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A decoded JSON container plus the identifier fields that were rejected
/// (and nulled out) while decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    pub invalid_ids: Vec<String>,
}

impl Decoded {
    pub fn has_invalid_id(&self) -> bool {
        !self.invalid_ids.is_empty()
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.value.as_object()
    }

    /// Identifier field as a canonical string, if present and valid.
    pub fn identifier(&self, field: &str) -> Option<&str> {
        self.as_object()?.get(field)?.as_str()
    }
}

pub fn is_identifier_field(name: &str) -> bool {
    name == "id" || name.ends_with("_id")
}

pub fn decode(raw: &[u8]) -> Result<Decoded, CodecError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|err| CodecError::InvalidJson(err.to_string()))?;
    if !matches!(value, Value::Object(_) | Value::Array(_)) {
        return Err(CodecError::InvalidJson(
            "expected a JSON object or array".to_string(),
        ));
    }

    let mut invalid_ids = Vec::new();
    let value = decode_value(value, None, &mut invalid_ids);
    Ok(Decoded { value, invalid_ids })
}

/// Decodes one line into a [`Record`]. Null fields count as absent.
pub fn decode_record(raw: &[u8]) -> Result<Record, CodecError> {
    let decoded = decode(raw)?;
    record_from_value(decoded.value)
}

pub fn record_from_value(value: Value) -> Result<Record, CodecError> {
    let Value::Object(mut fields) = value else {
        return Err(CodecError::InvalidJson("expected a JSON object".to_string()));
    };
    fields.retain(|_, field| !field.is_null());
    serde_json::from_value(Value::Object(fields))
        .map_err(|err| CodecError::InvalidJson(err.to_string()))
}

/// Encodes a value as one compact JSON line (without the trailing newline).
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let value = serde_json::to_value(value).map_err(CodecError::Encode)?;
    let value = encode_value(value, None);
    serde_json::to_string(&value).map_err(CodecError::Encode)
}

/// Round-trips a record carrying an identifier wider than 64 bits. Fails when
/// the JSON runtime cannot represent it exactly.
pub fn probe() -> Result<(), CodecError> {
    const WIDE_ID: &str = "123456789012345678901234567890";
    let raw = format!(r#"{{"id":{WIDE_ID},"sender_id":"7","receiver_id":0,"message":"  probe "}}"#);

    let decoded = decode(raw.as_bytes())?;
    let expected = (Some(WIDE_ID), Some("7"), Some("0"));
    let found = (
        decoded.identifier("id"),
        decoded.identifier("sender_id"),
        decoded.identifier("receiver_id"),
    );
    if found != expected || decoded.has_invalid_id() {
        return Err(CodecError::MissingCapability(format!(
            "identifier decoding produced {found:?}"
        )));
    }

    let encoded = encode(&decoded.value)?;
    if !encoded.contains(&format!(r#""id":"{WIDE_ID}""#)) || !encoded.contains(r#""sender_id":7"#)
    {
        return Err(CodecError::MissingCapability(format!(
            "identifier encoding produced {encoded}"
        )));
    }

    let again = decode(encoded.as_bytes())?;
    if again.value != decoded.value {
        return Err(CodecError::MissingCapability(
            "record did not survive an encode/decode round trip".to_string(),
        ));
    }
    Ok(())
}

fn decode_value(value: Value, field: Option<&str>, invalid_ids: &mut Vec<String>) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, inner)| {
                    let inner = decode_value(inner, Some(&key), invalid_ids);
                    (key, inner)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| decode_value(item, None, invalid_ids))
                .collect(),
        ),
        scalar => match field {
            Some(name) if is_identifier_field(name) => decode_identifier(name, scalar, invalid_ids),
            _ => match scalar {
                Value::String(text) => Value::String(text.trim().to_string()),
                other => other,
            },
        },
    }
}

fn decode_identifier(name: &str, value: Value, invalid_ids: &mut Vec<String>) -> Value {
    let canonical = match &value {
        Value::Null => return Value::Null,
        // Literal digits are range-checked and canonicalized.
        Value::Number(number) => normalize_integer_string(&number.to_string())
            .ok()
            .filter(|parsed| !parsed.is_negative())
            .map(IntegerString::into_string),
        // Strings are taken as given once they pass the digit check.
        Value::String(text) if is_digits(text) => Some(text.clone()),
        _ => None,
    };

    match canonical {
        Some(canonical) => Value::String(canonical),
        None => {
            invalid_ids.push(name.to_string());
            Value::Null
        }
    }
}

fn encode_value(value: Value, field: Option<&str>) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, inner)| {
                    let inner = encode_value(inner, Some(&key));
                    (key, inner)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| encode_value(item, None))
                .collect(),
        ),
        Value::String(text) if field.is_some_and(is_identifier_field) => encode_identifier(text),
        other => other,
    }
}

fn encode_identifier(text: String) -> Value {
    match normalize_integer_string(&text) {
        Ok(parsed) if parsed.fits_native() => match parsed.as_str().parse::<i64>() {
            Ok(native) => Value::from(native),
            Err(_) => Value::String(text),
        },
        _ => Value::String(text),
    }
}
