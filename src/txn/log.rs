//! Transaction log reading, replay and snapshotting
//!
//! ## Replay
//! ```text
//! log file ──► LogReader ──► TxRecord ──► Engine::apply_record
//!                 │
//!                 └── checksum / framing errors: FailFast stops,
//!                     SkipOnError logs and moves to the next record
//! ```
//!
//! A record whose header cannot be framed (truncated tail, absurd lengths)
//! ends the scan under either policy because the next record boundary is
//! unknown.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{Result, SubKvError};

use super::handler::{LogFileHandler, TransactionHandler};
use super::record::{TxRecord, RECORD_HEADER_SIZE};

/// How replay treats a record it cannot read or apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop at the first error and return it
    #[default]
    FailFast,
    /// Log the error and continue with the next record
    SkipOnError,
}

/// Outcome of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records read from the log
    pub records: u64,
    /// Records applied to the engine
    pub applied: u64,
    /// Records skipped under `SkipOnError`
    pub skipped: u64,
    /// The scan ended on an unframeable record
    pub truncated: bool,
}

/// Sequential reader over a transaction log
pub struct LogReader<R: Read = BufReader<File>> {
    reader: R,
    position: u64,
    done: bool,
}

impl LogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> LogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
            done: false,
        }
    }

    /// Byte offset of the next record
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The reader hit the end of the log or an unframeable record
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Read the next record
    ///
    /// `Ok(None)` at a clean end of log. After a framing error the reader is
    /// done; after a checksum error it is positioned on the next record.
    pub fn next_entry(&mut self) -> Result<Option<TxRecord>> {
        if self.done {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        let got = self.read_full(&mut header)?;
        if got == 0 {
            self.done = true;
            return Ok(None);
        }
        if got < RECORD_HEADER_SIZE {
            self.done = true;
            return Err(SubKvError::Transaction(format!(
                "log ends inside a record header at byte {}",
                self.position
            )));
        }

        let total = match TxRecord::record_len(&header) {
            Ok(total) => total,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        let mut bytes = header.to_vec();
        bytes.resize(total, 0);
        let got = self.read_full(&mut bytes[RECORD_HEADER_SIZE..])?;
        if got < total - RECORD_HEADER_SIZE {
            self.done = true;
            return Err(SubKvError::Transaction(format!(
                "log ends inside the record at byte {}",
                self.position
            )));
        }

        let start = self.position;
        self.position += total as u64;
        TxRecord::decode(&bytes)
            .map(|(record, _)| Some(record))
            .map_err(|e| SubKvError::Transaction(format!("record at byte {}: {}", start, e)))
    }

    /// Fill `buf` as far as the log allows
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Err(e.into());
                }
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<TxRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Apply every record of the log at `path` to `engine`
///
/// Replayed mutations are not dispatched to the engine's own transaction
/// handler.
pub fn replay(engine: &Engine, path: impl AsRef<Path>, policy: ErrorPolicy) -> Result<ReplayStats> {
    let path = path.as_ref();
    let mut reader = LogReader::open(path)?;
    let mut stats = ReplayStats::default();

    loop {
        let result = match reader.next_entry() {
            Ok(None) => break,
            Ok(Some(record)) => {
                stats.records += 1;
                engine.apply_record(&record)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => stats.applied += 1,
            Err(e) if policy == ErrorPolicy::SkipOnError => {
                warn!(error = %e, position = reader.position(), "replay skipped a record");
                stats.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    stats.truncated = !clean_end(path, reader.position())?;
    info!(
        path = %path.display(),
        applied = stats.applied,
        skipped = stats.skipped,
        "log replayed"
    );
    Ok(stats)
}

fn clean_end(path: &Path, position: u64) -> Result<bool> {
    Ok(std::fs::metadata(path)?.len() == position)
}

/// Write one SetAll record per stored key to a fresh log at `path`
///
/// Values, subkeys and attributes are written as stored. Mutations running
/// concurrently may or may not be captured. Returns the number of keys saved.
pub fn save_log(engine: &Engine, path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let handler = LogFileHandler::create(path)?;
    let mut saved = 0;

    for entry in engine.iter_all() {
        let entry = entry?;
        handler.apply(&TxRecord::set_all(
            &entry.key,
            &entry.value,
            &crate::subkeys::encode(&entry.subkeys),
            &entry.raw_attributes,
        ))?;
        saved += 1;
    }

    handler.flush()?;
    info!(path = %path.display(), keys = saved, "log saved");
    Ok(saved)
}
