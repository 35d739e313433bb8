use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::common::CodecError;

use super::ensure_parent_dir;
use super::error::StoreError;
use super::lock::{RetryPolicy, lock_exclusive};

/// Persistent identity key -> display name table.
///
/// Names are unique case-insensitively; entries are never deleted.
#[derive(Debug)]
pub struct IdentityMap {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    /// Upserts not yet written to the file.
    pending: BTreeMap<String, String>,
    retry: RetryPolicy,
}

impl IdentityMap {
    /// Loads the map, creating an empty file when none exists. Unparseable
    /// content falls back to an empty map.
    pub fn load(path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => parse_entries(&path, &content).unwrap_or_default(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                ensure_parent_dir(&path)?;
                fs::write(&path, "{}")?;
                log::info!("Created empty identity map at {}", path.display());
                BTreeMap::new()
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        Ok(Self {
            path,
            entries,
            pending: BTreeMap::new(),
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve_name(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    /// Case-insensitive exact match on the display name.
    pub fn resolve_id(&self, name: &str) -> Option<&str> {
        let wanted = name.to_lowercase();
        self.entries
            .iter()
            .find(|(_, known)| known.to_lowercase() == wanted)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_name_taken_by_other(&self, name: &str, exclude_id: &str) -> bool {
        let wanted = name.to_lowercase();
        self.entries
            .iter()
            .any(|(id, known)| id != exclude_id && known.to_lowercase() == wanted)
    }

    /// In-memory only; callers check [`Self::is_name_taken_by_other`] first
    /// and call [`Self::persist`] afterwards.
    pub fn upsert(&mut self, id: &str, name: &str) {
        self.entries.insert(id.to_string(), name.to_string());
        self.pending.insert(id.to_string(), name.to_string());
    }

    /// Merges pending upserts into the file under an exclusive lock. Entries
    /// written by other processes since load are kept and picked up; a
    /// pending name another identity claimed in the meantime is dropped.
    /// On lock exhaustion the upserts stay pending and in memory.
    pub fn persist(&mut self) -> Result<(), StoreError> {
        ensure_parent_dir(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        let _lock = lock_exclusive(&file, &self.path, self.retry)?;

        let mut content = String::new();
        (&file).read_to_string(&mut content)?;
        let mut merged =
            parse_entries(&self.path, &content).unwrap_or_else(|| self.entries.clone());
        for (id, name) in &self.pending {
            let wanted = name.to_lowercase();
            if merged
                .iter()
                .any(|(other, known)| other != id && known.to_lowercase() == wanted)
            {
                log::warn!("Name {name:?} was claimed by another identity; not recording {id}");
                continue;
            }
            merged.insert(id.clone(), name.clone());
        }

        let payload = serde_json::to_string_pretty(&merged)
            .map_err(|err| StoreError::Codec(CodecError::Encode(err)))?;
        file.set_len(0)?;
        let mut writer = &file;
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(payload.as_bytes())?;
        writer.flush()?;
        file.sync_data()?;

        self.entries = merged;
        self.pending.clear();
        Ok(())
    }
}

/// Empty content is an empty map; unparseable content is `None`.
fn parse_entries(path: &Path, content: &str) -> Option<BTreeMap<String, String>> {
    if content.trim().is_empty() {
        return Some(BTreeMap::new());
    }
    match serde_json::from_str(content) {
        Ok(entries) => Some(entries),
        Err(err) => {
            log::warn!("Failed to parse identity map {} ({err})", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    #[test]
    fn missing_file_is_created_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("identities.json");
        let map = IdentityMap::load(&path, policy()).unwrap();
        assert!(map.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        fs::write(&path, "{ not json").unwrap();
        let map = IdentityMap::load(&path, policy()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        fs::write(&path, r#"{"1": "Alice", "2": "bob"}"#).unwrap();
        let map = IdentityMap::load(&path, policy()).unwrap();

        assert_eq!(map.resolve_name("1"), Some("Alice"));
        assert_eq!(map.resolve_name("3"), None);
        assert_eq!(map.resolve_id("alice"), Some("1"));
        assert_eq!(map.resolve_id("BOB"), Some("2"));
        assert_eq!(map.resolve_id("carol"), None);
        assert!(map.is_name_taken_by_other("ALICE", "2"));
        assert!(!map.is_name_taken_by_other("alice", "1"));
    }

    #[test]
    fn persist_writes_pretty_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        let mut map = IdentityMap::load(&path, policy()).unwrap();
        map.upsert("1", "alice");
        map.upsert("10", "bob");
        map.persist().unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\n  \"1\": \"alice\",\n  \"10\": \"bob\"\n}");

        let reloaded = IdentityMap::load(&path, policy()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.resolve_name("10"), Some("bob"));
    }

    #[test]
    fn persist_shrinks_previous_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        fs::write(&path, format!("{{\"1\": \"{}\"}}", "x".repeat(200))).unwrap();
        let mut map = IdentityMap::load(&path, policy()).unwrap();
        map.upsert("1", "al");
        map.persist().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\n  \"1\": \"al\"\n}");
    }

    #[test]
    fn lock_exhaustion_skips_write_but_keeps_memory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        let mut map = IdentityMap::load(&path, policy()).unwrap();

        let holder = File::open(&path).unwrap();
        let _held = lock_exclusive(&holder, &path, policy()).unwrap();

        map.upsert("4", "dana");
        let err = map.persist().unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert_eq!(map.resolve_name("4"), Some("dana"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn concurrent_instances_keep_each_others_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        let mut first = IdentityMap::load(&path, policy()).unwrap();
        let mut second = IdentityMap::load(&path, policy()).unwrap();

        first.upsert("1", "alice");
        first.persist().unwrap();
        second.upsert("2", "bob");
        second.persist().unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "{\n  \"1\": \"alice\",\n  \"2\": \"bob\"\n}"
        );
        assert_eq!(second.resolve_name("1"), Some("alice"));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn name_claimed_elsewhere_is_not_duplicated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        let mut first = IdentityMap::load(&path, policy()).unwrap();
        let mut second = IdentityMap::load(&path, policy()).unwrap();

        first.upsert("1", "alice");
        first.persist().unwrap();
        second.upsert("2", "Alice");
        second.persist().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\n  \"1\": \"alice\"\n}");
        assert_eq!(second.resolve_name("2"), None);
        assert_eq!(second.resolve_id("ALICE"), Some("1"));
    }

    #[test]
    fn pending_upsert_is_written_after_lock_frees() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identities.json");
        let mut map = IdentityMap::load(&path, policy()).unwrap();

        let holder = File::open(&path).unwrap();
        let held = lock_exclusive(&holder, &path, policy()).unwrap();
        map.upsert("4", "dana");
        assert!(map.persist().is_err());
        drop(held);

        map.upsert("5", "erin");
        map.persist().unwrap();
        let reloaded = IdentityMap::load(&path, policy()).unwrap();
        assert_eq!(reloaded.resolve_name("4"), Some("dana"));
        assert_eq!(reloaded.resolve_name("5"), Some("erin"));
    }
}
