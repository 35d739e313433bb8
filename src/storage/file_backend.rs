use std::path::Path;

use crate::common::{Record, RecordDraft};

use super::MessageBackend;
use super::error::StoreError;
use super::identity_map::IdentityMap;
use super::lock::RetryPolicy;
use super::log_store::LogStore;

/// Message log plus identity map, both plain files.
#[derive(Debug)]
pub struct FileBackend {
    log: LogStore,
    identities: IdentityMap,
}

impl FileBackend {
    pub fn open(
        log_path: &Path,
        identity_path: &Path,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            log: LogStore::open(log_path, retry)?,
            identities: IdentityMap::load(identity_path, retry)?,
        })
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn identities(&self) -> &IdentityMap {
        &self.identities
    }
}

impl MessageBackend for FileBackend {
    fn append(&mut self, draft: &RecordDraft) -> Result<Record, StoreError> {
        self.log.append(draft)
    }

    fn update_message(
        &mut self,
        id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.log.update_message(id, sender_id, message)
    }

    fn tail_new(&mut self) -> Result<Vec<Record>, StoreError> {
        self.log.tail_new()
    }

    fn resolve_name(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.identities.resolve_name(id).map(str::to_string))
    }

    fn resolve_id(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.identities.resolve_id(name).map(str::to_string))
    }

    fn is_name_taken_by_other(&self, name: &str, exclude_id: &str) -> Result<bool, StoreError> {
        Ok(self.identities.is_name_taken_by_other(name, exclude_id))
    }

    /// The in-memory entry survives even when the file write is skipped.
    fn upsert_identity(&mut self, id: &str, name: &str) -> Result<(), StoreError> {
        self.identities.upsert(id, name);
        self.identities.persist()
    }
}
