//! Append-only, newline-delimited JSON message log.
//!
//! Inserts take an exclusive lock, scan the whole log for the highest id and
//! append one line. Updates rewrite the log through a sibling `.tmp` file and
//! an atomic rename. Tailing tracks a byte offset so only unseen complete
//! lines are decoded.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use serde_json::Value;

use crate::common::codec::{self, CodecError};
use crate::common::types::{Record, RecordDraft, timestamp_now};

use super::ensure_parent_dir;
use super::error::StoreError;
use super::lock::{RetryPolicy, lock_exclusive};

#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
    retry: RetryPolicy,
    last_emitted_offset: u64,
}

impl LogStore {
    /// Opens the log, creating an empty one if absent. Tailing starts at
    /// offset 0 so a new session sees the existing history.
    pub fn open(path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self, StoreError> {
        let path = path.into();
        ensure_parent_dir(&path)?;
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            retry,
            last_emitted_offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn last_emitted_offset(&self) -> u64 {
        self.last_emitted_offset
    }

    /// Assigns `max(id) + 1` and appends the record as one line.
    pub fn append(&mut self, draft: &RecordDraft) -> Result<Record, StoreError> {
        self.with_current_log(|store, file| {
            let next_id = store.next_id(file)?;
            let record = draft.to_record(next_id, timestamp_now());
            let mut line = codec::encode(&record)?;
            line.push('\n');

            let mut writer = file;
            writer.seek(SeekFrom::End(0))?;
            writer.write_all(line.as_bytes())?;
            writer.flush()?;
            Ok(record)
        })
    }

    /// Replaces the `message` of the first record whose `id` and `sender_id`
    /// equal the given strings exactly. Returns `None` when nothing matches.
    pub fn update_message(
        &mut self,
        id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.with_current_log(|store, file| store.replace_message(file, id, sender_id, message))
    }

    /// Runs `op` with the log open and exclusively locked. An update may
    /// rename a new log over the path while we wait for the lock on the old
    /// one, so the locked handle is checked against the path and reopened
    /// when stale.
    fn with_current_log<T>(
        &mut self,
        op: impl FnOnce(&mut Self, &File) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        for attempt in 1..=self.retry.attempts {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            let _lock = lock_exclusive(&file, &self.path, self.retry)?;

            if !still_current(&file, &self.path)? {
                log::debug!(
                    "{} was replaced while waiting for the lock (attempt {attempt})",
                    self.path.display()
                );
                continue;
            }
            return op(self, &file);
        }

        Err(StoreError::LockTimeout {
            path: self.path.clone(),
            attempts: self.retry.attempts,
        })
    }

    fn replace_message(
        &mut self,
        file: &File,
        id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<Record>, StoreError> {
        let mut contents = Vec::new();
        let mut reader = file;
        reader.seek(SeekFrom::Start(0))?;
        reader.read_to_end(&mut contents)?;
        let mut lines: Vec<Vec<u8>> = contents
            .split(|byte| *byte == b'\n')
            .map(<[u8]>::to_vec)
            .collect();
        if contents.ends_with(b"\n") {
            lines.pop();
        }

        let mut offset = 0u64;
        for (index, line) in lines.iter().enumerate() {
            let line_start = offset;
            offset += line.len() as u64 + 1;
            if is_blank(line) {
                continue;
            }

            let mut decoded = match codec::decode(line) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.skip_line(index, err)?;
                    continue;
                }
            };
            if decoded.identifier("id") != Some(id)
                || decoded.identifier("sender_id") != Some(sender_id)
            {
                continue;
            }

            let Value::Object(fields) = &mut decoded.value else {
                continue;
            };
            fields.insert("message".to_string(), Value::String(message.to_string()));
            let record = codec::record_from_value(decoded.value.clone()).map_err(|err| {
                StoreError::Corrupt {
                    path: self.path.clone(),
                    reason: format!("line {}: {err}", index + 1),
                }
            })?;
            let replacement = codec::encode(&decoded.value)?.into_bytes();

            let delta = replacement.len() as i64 - line.len() as i64;
            let mut updated = lines.clone();
            updated[index] = replacement;
            self.atomic_replace(&updated)?;

            // Keep the tail cursor on the same logical position when the
            // rewritten line was already emitted.
            if line_start < self.last_emitted_offset {
                self.last_emitted_offset = self.last_emitted_offset.saturating_add_signed(delta);
            }
            return Ok(Some(record));
        }

        Ok(None)
    }

    /// Writes `lines` to `<path>.tmp` and renames it over the log. On any
    /// failure the temporary file is removed and the log is untouched.
    pub fn atomic_replace<L: AsRef<[u8]>>(&self, lines: &[L]) -> Result<(), StoreError> {
        let tmp_path = sibling_tmp_path(&self.path);
        let result = write_lines(&tmp_path, lines).and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(err) = result {
            if let Err(cleanup) = fs::remove_file(&tmp_path)
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                log::warn!("Failed to remove {}: {cleanup}", tmp_path.display());
            }
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    /// Records appended since the last call, in file order.
    pub fn tail_new(&mut self) -> Result<Vec<Record>, StoreError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(err)),
        };
        if size <= self.last_emitted_offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.last_emitted_offset))?;
        let mut reader = BufReader::new(file.take(size - self.last_emitted_offset));

        let mut records = Vec::new();
        let mut consumed = 0u64;
        let mut line = Vec::new();
        let mut index = 0usize;
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            // A trailing line without its newline is still being written.
            if read == 0 || !line.ends_with(b"\n") {
                break;
            }
            consumed += read as u64;
            index += 1;

            let body = &line[..line.len() - 1];
            if is_blank(body) {
                continue;
            }
            match codec::decode_record(body) {
                Ok(record) => records.push(record),
                Err(err @ CodecError::MissingCapability(_)) => return Err(err.into()),
                Err(err) => log::warn!(
                    "Skipping undecodable line {index} past offset {} in {}: {err}",
                    self.last_emitted_offset,
                    self.path.display()
                ),
            }
        }

        self.last_emitted_offset += consumed;
        Ok(records)
    }

    fn next_id(&self, file: &File) -> Result<String, StoreError> {
        let mut handle = file;
        handle.seek(SeekFrom::Start(0))?;

        let mut max_id = BigUint::default();
        for (index, line) in BufReader::new(handle).split(b'\n').enumerate() {
            let line = line?;
            if is_blank(&line) {
                continue;
            }
            match codec::decode(&line) {
                Ok(decoded) => {
                    if let Some(id) = decoded.identifier("id")
                        && let Ok(id) = id.parse::<BigUint>()
                        && id > max_id
                    {
                        max_id = id;
                    }
                }
                Err(err) => self.skip_line(index, err)?,
            }
        }

        Ok((max_id + 1u32).to_string())
    }

    /// Malformed lines are skipped; a missing codec capability aborts.
    fn skip_line(&self, index: usize, err: CodecError) -> Result<(), StoreError> {
        if let CodecError::MissingCapability(_) = err {
            return Err(err.into());
        }
        log::warn!(
            "Skipping undecodable line {} in {}: {err}",
            index + 1,
            self.path.display()
        );
        Ok(())
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_lines<L: AsRef<[u8]>>(path: &Path, lines: &[L]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for line in lines {
        writer.write_all(line.as_ref())?;
        writer.write_all(b"\n")?;
    }
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()
}

#[cfg(unix)]
fn still_current(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
fn still_current(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}
