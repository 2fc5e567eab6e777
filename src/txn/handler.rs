//! Transaction handlers
//!
//! A handler receives every committed record group. The default one appends
//! the encoded records to a log file that [`super::LogReader`] can replay.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SubKvError};
use crate::lock::os::{self, OsLockKind};

use super::record::{encode_group, TxRecord};

/// Consumer of committed mutations
pub trait TransactionHandler: Send + Sync {
    fn apply(&self, record: &TxRecord) -> Result<()>;

    /// Records of one logical operation, in order
    fn apply_group(&self, records: &[TxRecord]) -> Result<()> {
        for record in records {
            self.apply(record)?;
        }
        Ok(())
    }

    /// Make applied records durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends records to a log file
///
/// Several processes may share one log: every append holds an exclusive OS
/// lock over the whole file, so groups are never interleaved.
pub struct LogFileHandler {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFileHandler {
    /// Open `path` for appending, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "transaction log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open `path` discarding its previous content
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        let fd = file.as_raw_fd();

        os::set_lock(fd, 0, 0, OsLockKind::Write, true).map_err(|e| {
            SubKvError::LockFailure(format!("log {}: {}", self.path.display(), e))
        })?;
        let written = file.write_all(bytes);
        let unlocked = os::set_lock(fd, 0, 0, OsLockKind::Unlock, true);

        written?;
        unlocked?;
        Ok(())
    }
}

impl TransactionHandler for LogFileHandler {
    fn apply(&self, record: &TxRecord) -> Result<()> {
        self.append(&record.encode())
    }

    fn apply_group(&self, records: &[TxRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.append(&encode_group(records))
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for LogFileHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFileHandler")
            .field("path", &self.path)
            .finish()
    }
}
