use crate::common::codec;
use crate::common::commands::{Command, InsertCommand, UpdateCommand};
use crate::common::events::{DiscardReason, Outcome};
use crate::common::types::{BROADCAST_ID, GUEST_NAME, Record};
use crate::storage::{MessageBackend, StoreError};

/// Runs one inbound line through decode, validation, identity resolution and
/// persistence. Holds no state between commands besides the backend.
pub struct MessageEngine {
    backend: Box<dyn MessageBackend>,
}

impl MessageEngine {
    pub fn new(backend: Box<dyn MessageBackend>) -> Self {
        Self { backend }
    }

    /// Never fails: every error becomes a logged [`Outcome::Discarded`].
    pub fn handle_line(&mut self, raw: &[u8]) -> Outcome {
        match self.process(raw) {
            Ok(outcome) => outcome,
            Err(reason) => {
                if reason.is_routine() {
                    log::debug!("Discarding command: {reason}");
                } else {
                    log::warn!("Discarding command: {reason}");
                }
                Outcome::Discarded(reason)
            }
        }
    }

    /// Newly visible records with display names attached.
    pub fn tail(&mut self) -> Result<Vec<Record>, StoreError> {
        let records = self.backend.tail_new()?;
        Ok(records
            .into_iter()
            .map(|record| self.attach_names(record))
            .collect())
    }

    fn process(&mut self, raw: &[u8]) -> Result<Outcome, DiscardReason> {
        let decoded = codec::decode(raw)?;
        match Command::from_decoded(&decoded)? {
            Command::Insert(command) => self.insert(command),
            Command::Update(command) => self.update(command),
        }
    }

    fn insert(&mut self, command: InsertCommand) -> Result<Outcome, DiscardReason> {
        let command = normalize_receiver(command, self.backend.as_ref())?;
        self.claim_sender_name(&command)?;
        let record = self.backend.append(&command.draft())?;
        log::debug!(
            "Stored message {} from sender {}",
            record.id.as_deref().unwrap_or("?"),
            record.sender_id
        );
        Ok(Outcome::Inserted(record))
    }

    fn update(&mut self, command: UpdateCommand) -> Result<Outcome, DiscardReason> {
        let updated =
            self.backend
                .update_message(&command.id, &command.sender_id, &command.message)?;
        match updated {
            Some(record) => Ok(Outcome::Updated(self.attach_names(record))),
            None => Err(DiscardReason::NotFound {
                id: command.id,
                sender_id: command.sender_id,
            }),
        }
    }

    /// Records the sender's display name unless another identity owns it.
    /// A failed write is logged and the message is still stored.
    fn claim_sender_name(&mut self, command: &InsertCommand) -> Result<(), StoreError> {
        let name = command.sender_name.as_str();
        if name.is_empty() {
            return Ok(());
        }
        if self.backend.resolve_name(&command.sender_id)?.as_deref() == Some(name) {
            return Ok(());
        }
        if self.backend.is_name_taken_by_other(name, &command.sender_id)? {
            log::info!(
                "Name {name:?} already belongs to another identity; keeping sender {} unchanged",
                command.sender_id
            );
            return Ok(());
        }

        match self.backend.upsert_identity(&command.sender_id, name) {
            Ok(()) => log::info!("Identity {} is now {name:?}", command.sender_id),
            Err(err @ StoreError::Codec(_)) if err.is_missing_capability() => return Err(err),
            Err(err) => log::warn!(
                "Could not persist identity {} ({name:?}): {err}",
                command.sender_id
            ),
        }
        Ok(())
    }

    fn attach_names(&self, mut record: Record) -> Record {
        let sender_name = match self.backend.resolve_name(&record.sender_id) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("Failed to resolve sender {}: {err}", record.sender_id);
                None
            }
        };
        record.sender_name = Some(sender_name.unwrap_or_else(|| GUEST_NAME.to_string()));

        record.receiver_name = if record.is_broadcast() {
            None
        } else {
            self.backend
                .resolve_name(&record.receiver_id)
                .unwrap_or_else(|err| {
                    log::warn!("Failed to resolve receiver {}: {err}", record.receiver_id);
                    None
                })
        };
        record
    }
}

/// Unknown receivers and messages to oneself become broadcasts. A supplied
/// `receiver_name` that differs from the sender's name then takes precedence
/// when it names a known identity other than the sender.
pub fn normalize_receiver(
    mut command: InsertCommand,
    backend: &dyn MessageBackend,
) -> Result<InsertCommand, StoreError> {
    let known = command.receiver_id != BROADCAST_ID
        && backend.resolve_name(&command.receiver_id)?.is_some();
    if !known || command.receiver_id == command.sender_id {
        command.receiver_id = BROADCAST_ID.to_string();
    }

    let receiver_name = command.receiver_name.as_str();
    if !receiver_name.is_empty()
        && receiver_name.to_lowercase() != command.sender_name.to_lowercase()
        && let Some(resolved) = backend.resolve_id(receiver_name)?
        && resolved != command.sender_id
    {
        command.receiver_id = resolved;
    }

    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tempfile::TempDir;

    use crate::storage::lock::RetryPolicy;
    use crate::storage::{FileBackend, SqlBackend};

    fn engine() -> MessageEngine {
        MessageEngine::new(Box::new(SqlBackend::in_memory().unwrap()))
    }

    fn insert_line(
        sender_id: &str,
        sender_name: &str,
        receiver_id: &str,
        receiver_name: &str,
    ) -> String {
        format!(
            concat!(
                r#"{{"action":"insert","booking_no":"B1","message":"hello","#,
                r#""sender_id":"{}","sender_name":"{}","#,
                r#""receiver_id":"{}","receiver_name":"{}"}}"#,
            ),
            sender_id, sender_name, receiver_id, receiver_name
        )
    }

    fn inserted(outcome: Outcome) -> Record {
        match outcome {
            Outcome::Inserted(record) => record,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn first_insert_registers_sender_name() {
        let mut engine = engine();
        let record = inserted(engine.handle_line(insert_line("1", "alice", "0", "").as_bytes()));
        assert_eq!(record.id.as_deref(), Some("1"));
        assert_eq!(record.receiver_id, "0");

        let emitted = engine.tail().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].sender_name.as_deref(), Some("alice"));
        assert_eq!(emitted[0].receiver_name, None);
    }

    #[test]
    fn unknown_sender_is_emitted_as_guest() {
        let mut engine = engine();
        inserted(engine.handle_line(insert_line("5", "", "0", "").as_bytes()));
        let emitted = engine.tail().unwrap();
        assert_eq!(emitted[0].sender_name.as_deref(), Some(GUEST_NAME));
    }

    #[test]
    fn message_to_self_becomes_broadcast() {
        let mut engine = engine();
        inserted(engine.handle_line(insert_line("1", "alice", "0", "").as_bytes()));
        let record = inserted(engine.handle_line(insert_line("1", "alice", "1", "").as_bytes()));
        assert_eq!(record.receiver_id, "0");
    }

    #[test]
    fn unknown_receiver_becomes_broadcast() {
        let mut engine = engine();
        let record = inserted(engine.handle_line(insert_line("1", "alice", "42", "").as_bytes()));
        assert_eq!(record.receiver_id, "0");
    }

    #[test]
    fn known_receiver_is_kept_and_named() {
        let mut engine = engine();
        inserted(engine.handle_line(insert_line("2", "bob", "0", "").as_bytes()));
        engine.tail().unwrap();

        let record = inserted(engine.handle_line(insert_line("1", "alice", "2", "").as_bytes()));
        assert_eq!(record.receiver_id, "2");
        let emitted = engine.tail().unwrap();
        assert_eq!(emitted[0].receiver_name.as_deref(), Some("bob"));
    }

    #[test]
    fn receiver_name_refines_the_receiver() {
        let mut engine = engine();
        inserted(engine.handle_line(insert_line("2", "bob", "0", "").as_bytes()));
        inserted(engine.handle_line(insert_line("3", "carol", "0", "").as_bytes()));

        let by_name =
            inserted(engine.handle_line(insert_line("1", "alice", "0", "BOB").as_bytes()));
        assert_eq!(by_name.receiver_id, "2");

        let overridden =
            inserted(engine.handle_line(insert_line("1", "alice", "3", "bob").as_bytes()));
        assert_eq!(overridden.receiver_id, "2");

        let unmatched =
            inserted(engine.handle_line(insert_line("1", "alice", "3", "nobody").as_bytes()));
        assert_eq!(unmatched.receiver_id, "3");

        let own_name =
            inserted(engine.handle_line(insert_line("1", "alice", "3", "ALICE").as_bytes()));
        assert_eq!(own_name.receiver_id, "3");
    }

    #[test]
    fn taken_name_is_ignored_but_message_is_stored() {
        let mut backend = SqlBackend::in_memory().unwrap();
        backend.upsert_identity("1", "alice").unwrap();
        let mut engine = MessageEngine::new(Box::new(backend));

        let record = inserted(engine.handle_line(insert_line("2", "Alice", "0", "").as_bytes()));
        assert_eq!(record.sender_id, "2");

        let emitted = engine.tail().unwrap();
        assert_eq!(emitted[0].sender_name.as_deref(), Some(GUEST_NAME));
        assert_eq!(engine.backend.resolve_name("1").unwrap().as_deref(), Some("alice"));
        assert_eq!(engine.backend.resolve_name("2").unwrap(), None);
        assert_eq!(engine.backend.resolve_id("ALICE").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn taken_name_leaves_identity_file_untouched() {
        let temp = TempDir::new().unwrap();
        let identity_path = temp.path().join("identities.json");
        let mut backend = FileBackend::open(
            &temp.path().join("chat.log"),
            &identity_path,
            RetryPolicy::default(),
        )
        .unwrap();
        backend.upsert_identity("1", "alice").unwrap();
        let before = fs::read(&identity_path).unwrap();
        let mut engine = MessageEngine::new(Box::new(backend));

        let line = insert_line("2", "ALICE", "0", "");
        let record = inserted(engine.handle_line(line.as_bytes()));
        assert_eq!(record.sender_id, "2");
        assert_eq!(fs::read(&identity_path).unwrap(), before);
        assert_eq!(engine.backend.resolve_name("2").unwrap(), None);

        let log = fs::read_to_string(temp.path().join("chat.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("\"sender_id\":2"));
    }

    #[test]
    fn update_emits_the_named_record() {
        let mut engine = engine();
        inserted(engine.handle_line(insert_line("1", "alice", "0", "").as_bytes()));

        let outcome = engine
            .handle_line(br#"{"action":"update","id":"1","sender_id":"1","message":"hi again"}"#);
        let Outcome::Updated(record) = outcome else {
            panic!("expected update, got {outcome:?}");
        };
        assert_eq!(record.message, "hi again");
        assert_eq!(record.sender_name.as_deref(), Some("alice"));
    }

    #[test]
    fn bad_commands_are_discarded() {
        let mut engine = engine();
        assert!(matches!(
            engine.handle_line(b"not json"),
            Outcome::Discarded(DiscardReason::Decode(_))
        ));
        assert!(matches!(
            engine.handle_line(br#"{"action":"delete","id":"1"}"#),
            Outcome::Discarded(DiscardReason::Rejected(_))
        ));
        assert!(matches!(
            engine.handle_line(br#"{"action":"update","id":"9","sender_id":"1","message":"x"}"#),
            Outcome::Discarded(DiscardReason::NotFound { .. })
        ));
        assert!(engine.tail().unwrap().is_empty());
    }
}
