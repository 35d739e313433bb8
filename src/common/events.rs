use thiserror::Error;

use crate::storage::StoreError;

use super::codec::CodecError;
use super::commands::Rejection;
use super::types::Record;

/// Kết quả xử lý một lệnh từ input stream.
#[derive(Debug)]
pub enum Outcome {
    /// Appended to the backend; the session follows up with a tail flush.
    Inserted(Record),
    /// The updated record, names already attached.
    Updated(Record),
    Discarded(DiscardReason),
}

#[derive(Debug, Error)]
pub enum DiscardReason {
    #[error("undecodable command: {0}")]
    Decode(#[from] CodecError),
    #[error("rejected command: {0}")]
    Rejected(#[from] Rejection),
    #[error("no record with id {id} from sender {sender_id}")]
    NotFound { id: String, sender_id: String },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl DiscardReason {
    /// Unknown actions are routine noise, everything else is worth a warning.
    pub fn is_routine(&self) -> bool {
        matches!(self, DiscardReason::Rejected(Rejection::UnknownAction(_)))
    }
}
