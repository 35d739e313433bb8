use serde::{Deserialize, Serialize};

/// Display name used when a sender has no identity entry.
pub const GUEST_NAME: &str = "guest";

/// `receiver_id` of a public message.
pub const BROADCAST_ID: &str = "0";

/// Domain model đại diện một tin nhắn chat.
///
/// Fields are declared in alphabetical order so every encoded line has the
/// same sorted layout. Identifier fields hold canonical decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub booking_no: String,
    pub created_at: String,
    pub id: Option<String>,
    pub message: String,
    pub receiver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_name: Option<String>,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

impl Record {
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST_ID
    }
}

/// Validated insert payload, before the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub booking_no: String,
    pub message: String,
    pub receiver_id: String,
    pub sender_id: String,
}

impl RecordDraft {
    pub fn to_record(&self, id: String, created_at: String) -> Record {
        Record {
            booking_no: self.booking_no.clone(),
            created_at,
            id: Some(id),
            message: self.message.clone(),
            receiver_id: self.receiver_id.clone(),
            receiver_name: None,
            sender_id: self.sender_id.clone(),
            sender_name: None,
        }
    }
}

/// Server timestamp stamped on new records.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
