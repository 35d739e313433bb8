//! Advisory exclusive locks with a bounded, fixed-delay retry.

use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use fs2::FileExt;

use super::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(20))
    }
}

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct ExclusiveLock<'a> {
    file: &'a File,
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(self.file) {
            log::debug!("Failed to release file lock: {err}");
        }
    }
}

pub fn lock_exclusive<'a>(
    file: &'a File,
    path: &Path,
    policy: RetryPolicy,
) -> Result<ExclusiveLock<'a>, StoreError> {
    let contended = fs2::lock_contended_error().raw_os_error();

    for attempt in 1..=policy.attempts {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(ExclusiveLock { file }),
            Err(err) if err.raw_os_error() == contended => {
                log::debug!(
                    "{} is locked (attempt {attempt}/{})",
                    path.display(),
                    policy.attempts
                );
                if attempt < policy.attempts {
                    thread::sleep(policy.delay);
                }
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
    }

    Err(StoreError::LockTimeout {
        path: path.to_path_buf(),
        attempts: policy.attempts,
    })
}
