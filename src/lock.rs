//! Exclusive advisory lock on a mailbox file.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{MboxError, Result};

/// Held exclusive lock. Released on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct MboxLock {
    file: File,
    path: PathBuf,
    released: bool,
}

impl MboxLock {
    /// Try to lock `file` exclusively without blocking.
    ///
    /// The lock is taken on a duplicate of the handle, so it covers the same
    /// open file description as `file` itself.
    pub fn acquire(file: &File, path: &Path) -> Result<Self> {
        let file = file.try_clone().map_err(|e| MboxError::io(path, e))?;
        FileExt::try_lock_exclusive(&file).map_err(|e| MboxError::LockFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "Mailbox locked");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Release the lock, reporting unlock failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        FileExt::unlock(&self.file).map_err(|e| MboxError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "Mailbox unlocked");
        Ok(())
    }
}

impl Drop for MboxLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = FileExt::unlock(&self.file) {
                warn!(path = %self.path.display(), error = %e, "Failed to unlock mailbox");
            }
        }
    }
}
