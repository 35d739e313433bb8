pub mod codec;
pub mod commands;
pub mod events;
pub mod normalize;
pub mod types;

pub use codec::CodecError;
pub use types::{Record, RecordDraft};
