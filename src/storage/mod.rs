pub mod error;
pub mod file_backend;
pub mod identity_map;
pub mod lock;
pub mod log_store;
pub mod sql_backend;

pub use error::StoreError;
pub use file_backend::FileBackend;
pub use sql_backend::SqlBackend;

use std::fs;
use std::path::Path;

use crate::common::{Record, RecordDraft};
use crate::config::{AppConfig, BackendKind};

/// Persistence seen by the message engine. The file log and the SQL
/// database are interchangeable behind it.
pub trait MessageBackend: Send {
    /// Persists a new record with a server-assigned id and timestamp.
    fn append(&mut self, draft: &RecordDraft) -> Result<Record, StoreError>;

    /// `Ok(None)` when no record matches both `id` and `sender_id`.
    fn update_message(
        &mut self,
        id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<Record>, StoreError>;

    /// Records that became visible since the previous call.
    fn tail_new(&mut self) -> Result<Vec<Record>, StoreError>;

    fn resolve_name(&self, id: &str) -> Result<Option<String>, StoreError>;

    fn resolve_id(&self, name: &str) -> Result<Option<String>, StoreError>;

    fn is_name_taken_by_other(&self, name: &str, exclude_id: &str) -> Result<bool, StoreError>;

    fn upsert_identity(&mut self, id: &str, name: &str) -> Result<(), StoreError>;
}

/// Builds the backend selected in the config, creating its files.
pub fn open_backend(config: &AppConfig) -> Result<Box<dyn MessageBackend>, StoreError> {
    match config.backend {
        BackendKind::File => {
            let backend =
                FileBackend::open(&config.log_path, &config.identity_path, config.retry_policy())?;
            log::info!(
                "Using file backend: log {}, {} identities from {}",
                backend.log().path().display(),
                backend.identities().len(),
                backend.identities().path().display()
            );
            if backend.identities().is_empty() {
                log::debug!("No identities registered yet; senders show as guests");
            }
            Ok(Box::new(backend))
        }
        BackendKind::Sqlite => {
            let backend = SqlBackend::with_path(&config.database_path)?;
            log::info!(
                "Using sqlite backend at {} ({} stored messages)",
                config.database_path.display(),
                backend.count()?
            );
            Ok(Box::new(backend))
        }
    }
}

/// Ensure the directory holding `path` exists
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
