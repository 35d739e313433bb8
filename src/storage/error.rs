use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::common::CodecError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("could not lock {path:?} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("identifier {0:?} cannot be stored by this backend")]
    UnsupportedIdentifier(String),
    #[error("corrupt record in {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    /// The JSON runtime itself is unusable; retrying cannot help.
    pub fn is_missing_capability(&self) -> bool {
        matches!(self, StoreError::Codec(CodecError::MissingCapability(_)))
    }
}
