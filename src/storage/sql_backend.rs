use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, Row, params};

use crate::common::types::timestamp_now;
use crate::common::{Record, RecordDraft};

use super::error::StoreError;
use super::{MessageBackend, ensure_parent_dir};

/// Other relay processes may hold the write lock briefly.
const BUSY_TIMEOUT: Duration = Duration::from_millis(200);

/// Messages and identities kept in SQLite instead of the file log.
///
/// Ids are SQLite integers, so every identifier here fits an `i64`.
pub struct SqlBackend {
    conn: Connection,
    /// Highest message id already returned by [`MessageBackend::tail_new`].
    last_seen_id: i64,
}

impl SqlBackend {
    /// Initialize the database at a custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        ensure_parent_dir(path.as_ref())?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let backend = Self {
            conn,
            last_seen_id: 0,
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> SqlResult<()> {
        let conn = &self.conn;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                booking_no TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sender_id INTEGER NOT NULL,
                receiver_id INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS identities (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_booking_no ON messages(booking_no)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_identities_name ON identities(name COLLATE NOCASE)",
            [],
        )?;

        Ok(())
    }

    /// Insert a message and return it with its assigned id
    pub fn insert_message(&self, draft: &RecordDraft) -> Result<Record, StoreError> {
        let created_at = timestamp_now();
        let conn = &self.conn;
        conn.execute(
            "INSERT INTO messages (booking_no, created_at, sender_id, receiver_id, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                draft.booking_no,
                created_at,
                native_id(&draft.sender_id)?,
                native_id(&draft.receiver_id)?,
                draft.message
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(draft.to_record(id.to_string(), created_at))
    }

    /// Replace the text of a message owned by `sender_id`
    pub fn update_message_row(
        &self,
        id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<Record>, StoreError> {
        // Ids are matched as canonical strings, so "07" never matches 7.
        let (Some(id), Some(sender_id)) = (canonical_native(id), canonical_native(sender_id))
        else {
            return Ok(None);
        };

        let conn = &self.conn;
        let changed = conn.execute(
            "UPDATE messages SET message = ?1 WHERE id = ?2 AND sender_id = ?3",
            params![message, id, sender_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let record = conn
            .query_row(
                "SELECT id, booking_no, created_at, sender_id, receiver_id, message
                 FROM messages WHERE id = ?1",
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Get messages with an id above `after`, oldest first
    pub fn messages_after(&self, after: i64) -> SqlResult<Vec<Record>> {
        let conn = &self.conn;
        let mut stmt = conn.prepare(
            "SELECT id, booking_no, created_at, sender_id, receiver_id, message
             FROM messages
             WHERE id > ?1
             ORDER BY id ASC",
        )?;

        let records = stmt
            .query_map(params![after], record_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    pub fn lookup_name_by_id(&self, id: &str) -> Result<Option<String>, StoreError> {
        let Some(id) = canonical_native(id) else {
            return Ok(None);
        };
        let name = self
            .conn
            .query_row(
                "SELECT name FROM identities WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn lookup_id_by_name(&self, name: &str) -> SqlResult<Option<String>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM identities WHERE name = ?1 COLLATE NOCASE ORDER BY id LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|id| id.to_string()))
    }

    pub fn name_exists_for_other_id(&self, name: &str, id: &str) -> Result<bool, StoreError> {
        let exclude = canonical_native(id).unwrap_or(-1);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM identities WHERE name = ?1 COLLATE NOCASE AND id != ?2",
            params![name, exclude],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Add or rename an identity
    pub fn upsert_identity_row(&self, id: &str, name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO identities (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![native_id(id)?, name],
        )?;
        Ok(())
    }

    /// Get message count
    pub fn count(&self) -> SqlResult<usize> {
        let conn = &self.conn;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl MessageBackend for SqlBackend {
    fn append(&mut self, draft: &RecordDraft) -> Result<Record, StoreError> {
        self.insert_message(draft)
    }

    fn update_message(
        &mut self,
        id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.update_message_row(id, sender_id, message)
    }

    fn tail_new(&mut self) -> Result<Vec<Record>, StoreError> {
        let records = self.messages_after(self.last_seen_id)?;
        if let Some(last) = records.last().and_then(|record| record.id.as_deref()) {
            self.last_seen_id = last.parse().unwrap_or(self.last_seen_id);
        }
        Ok(records)
    }

    fn resolve_name(&self, id: &str) -> Result<Option<String>, StoreError> {
        self.lookup_name_by_id(id)
    }

    fn resolve_id(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lookup_id_by_name(name)?)
    }

    fn is_name_taken_by_other(&self, name: &str, exclude_id: &str) -> Result<bool, StoreError> {
        self.name_exists_for_other_id(name, exclude_id)
    }

    fn upsert_identity(&mut self, id: &str, name: &str) -> Result<(), StoreError> {
        self.upsert_identity_row(id, name)
    }
}

fn record_from_row(row: &Row<'_>) -> SqlResult<Record> {
    Ok(Record {
        id: Some(row.get::<_, i64>(0)?.to_string()),
        booking_no: row.get(1)?,
        created_at: row.get(2)?,
        sender_id: row.get::<_, i64>(3)?.to_string(),
        receiver_id: row.get::<_, i64>(4)?.to_string(),
        message: row.get(5)?,
        sender_name: None,
        receiver_name: None,
    })
}

fn native_id(id: &str) -> Result<i64, StoreError> {
    id.parse()
        .map_err(|_| StoreError::UnsupportedIdentifier(id.to_string()))
}

/// `Some` only when `id` is the canonical text of an `i64`.
fn canonical_native(id: &str) -> Option<i64> {
    let value: i64 = id.parse().ok()?;
    (value.to_string() == id).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(sender_id: &str, receiver_id: &str, message: &str) -> RecordDraft {
        RecordDraft {
            booking_no: "B9".to_string(),
            message: message.to_string(),
            receiver_id: receiver_id.to_string(),
            sender_id: sender_id.to_string(),
        }
    }

    #[test]
    fn insert_assigns_sequential_ids() {
        let mut backend = SqlBackend::in_memory().unwrap();
        let first = backend.append(&draft("1", "0", "hello")).unwrap();
        let second = backend.append(&draft("2", "1", "hi")).unwrap();
        assert_eq!(first.id.as_deref(), Some("1"));
        assert_eq!(second.id.as_deref(), Some("2"));
        assert_eq!(second.receiver_id, "1");
        assert_eq!(backend.count().unwrap(), 2);
    }

    #[test]
    fn tail_follows_the_id_cursor() {
        let mut backend = SqlBackend::in_memory().unwrap();
        backend.append(&draft("1", "0", "one")).unwrap();
        backend.append(&draft("1", "0", "two")).unwrap();

        let first = backend.tail_new().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].message, "two");
        assert!(backend.tail_new().unwrap().is_empty());

        backend.append(&draft("1", "0", "three")).unwrap();
        let next = backend.tail_new().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id.as_deref(), Some("3"));
    }

    #[test]
    fn update_matches_owner_and_canonical_id() {
        let mut backend = SqlBackend::in_memory().unwrap();
        backend.append(&draft("1", "0", "original")).unwrap();

        assert!(backend.update_message("1", "2", "nope").unwrap().is_none());
        assert!(backend.update_message("01", "1", "nope").unwrap().is_none());

        let updated = backend.update_message("1", "1", "edited").unwrap().unwrap();
        assert_eq!(updated.message, "edited");
        assert_eq!(updated.booking_no, "B9");
        assert_eq!(updated.sender_id, "1");
    }

    #[test]
    fn identities_resolve_case_insensitively() {
        let mut backend = SqlBackend::in_memory().unwrap();
        backend.upsert_identity("1", "Alice").unwrap();
        backend.upsert_identity("2", "bob").unwrap();

        assert_eq!(backend.resolve_name("1").unwrap().as_deref(), Some("Alice"));
        assert_eq!(backend.resolve_id("alice").unwrap().as_deref(), Some("1"));
        assert!(backend.is_name_taken_by_other("ALICE", "2").unwrap());
        assert!(!backend.is_name_taken_by_other("alice", "1").unwrap());

        backend.upsert_identity("2", "robert").unwrap();
        assert_eq!(backend.resolve_name("2").unwrap().as_deref(), Some("robert"));
        assert_eq!(backend.resolve_id("bob").unwrap(), None);
    }

    #[test]
    fn wide_ids_are_rejected() {
        let mut backend = SqlBackend::in_memory().unwrap();
        let err = backend
            .append(&draft("99999999999999999999", "0", "too wide"))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedIdentifier(_)));
    }
}
