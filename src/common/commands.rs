use serde_json::Value;
use thiserror::Error;

use super::codec::Decoded;
use super::normalize::{normalize_field, normalize_integer_string};
use super::types::{BROADCAST_ID, RecordDraft};

/// Lệnh client gửi lên qua input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Insert(InsertCommand),
    Update(UpdateCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertCommand {
    pub booking_no: String,
    pub message: String,
    /// Canonical, positive, at most `i64::MAX`.
    pub sender_id: String,
    /// Canonical, non-negative, at most `i64::MAX`.
    pub receiver_id: String,
    /// Empty when not supplied.
    pub sender_name: String,
    /// Empty when not supplied.
    pub receiver_name: String,
}

impl InsertCommand {
    pub fn draft(&self) -> RecordDraft {
        RecordDraft {
            booking_no: self.booking_no.clone(),
            message: self.message.clone(),
            receiver_id: self.receiver_id.clone(),
            sender_id: self.sender_id.clone(),
        }
    }
}

/// `id` and `sender_id` are kept exactly as sent; the store matches them
/// against canonical identifiers as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCommand {
    pub id: String,
    pub sender_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("command is not a JSON object")]
    NotAnObject,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("invalid identifier fields: {0:?}")]
    InvalidIdentifiers(Vec<String>),
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    #[error("`{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

impl Command {
    pub fn from_decoded(decoded: &Decoded) -> Result<Self, Rejection> {
        let fields = decoded.as_object().ok_or(Rejection::NotAnObject)?;
        let action = normalize_field(fields.get("action"));
        match action.as_str() {
            "insert" => validate_insert(decoded).map(Command::Insert),
            "update" => validate_update(decoded).map(Command::Update),
            _ => Err(Rejection::UnknownAction(action)),
        }
    }
}

pub fn validate_insert(decoded: &Decoded) -> Result<InsertCommand, Rejection> {
    let fields = decoded.as_object().ok_or(Rejection::NotAnObject)?;
    if decoded.has_invalid_id() {
        return Err(Rejection::InvalidIdentifiers(decoded.invalid_ids.clone()));
    }

    let booking_no = required_text(fields.get("booking_no"), "booking_no")?;
    let message = required_text(fields.get("message"), "message")?;
    let sender_id = identifier(decoded, "sender_id", Bounds::PositiveWithinCeiling)?;
    let receiver_id = match decoded.identifier("receiver_id") {
        Some(_) => identifier(decoded, "receiver_id", Bounds::WithinCeiling)?,
        None => BROADCAST_ID.to_string(),
    };

    Ok(InsertCommand {
        booking_no,
        message,
        sender_id,
        receiver_id,
        sender_name: normalize_field(fields.get("sender_name")),
        receiver_name: normalize_field(fields.get("receiver_name")),
    })
}

pub fn validate_update(decoded: &Decoded) -> Result<UpdateCommand, Rejection> {
    let fields = decoded.as_object().ok_or(Rejection::NotAnObject)?;
    if decoded.has_invalid_id() {
        return Err(Rejection::InvalidIdentifiers(decoded.invalid_ids.clone()));
    }

    let message = required_text(fields.get("message"), "message")?;
    identifier(decoded, "id", Bounds::Positive)?;
    identifier(decoded, "sender_id", Bounds::Positive)?;

    Ok(UpdateCommand {
        id: decoded.identifier("id").unwrap_or_default().to_string(),
        sender_id: decoded.identifier("sender_id").unwrap_or_default().to_string(),
        message,
    })
}

fn required_text(value: Option<&Value>, field: &'static str) -> Result<String, Rejection> {
    let text = normalize_field(value);
    if text.is_empty() {
        return Err(Rejection::MissingField(field));
    }
    Ok(text)
}

#[derive(Debug, Clone, Copy)]
enum Bounds {
    /// Any value above zero; server-assigned ids are unbounded.
    Positive,
    WithinCeiling,
    PositiveWithinCeiling,
}

/// Canonical form of an identifier field.
fn identifier(decoded: &Decoded, field: &'static str, bounds: Bounds) -> Result<String, Rejection> {
    let raw = decoded
        .identifier(field)
        .ok_or(Rejection::MissingField(field))?;
    let parsed = normalize_integer_string(raw).map_err(|_| Rejection::OutOfRange {
        field,
        value: raw.to_string(),
    })?;
    let accepted = match bounds {
        Bounds::Positive => parsed.is_positive(),
        Bounds::WithinCeiling => parsed.within_ceiling(),
        Bounds::PositiveWithinCeiling => parsed.is_positive() && parsed.within_ceiling(),
    };
    if !accepted {
        return Err(Rejection::OutOfRange {
            field,
            value: raw.to_string(),
        });
    }
    Ok(parsed.into_string())
}
