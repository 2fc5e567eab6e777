//! Direct access
//!
//! A cursor over the stored value bytes of one key. The cursor keeps the mask
//! lock shared and the key's bucket locked (shared or exclusive) for as long
//! as it lives, so it sees a stable value between writes.
//!
//! Each write is dispatched as an `OverwriteAt` record. Dispatch runs with
//! the locks released; the cursor re-locks and re-resolves the key
//! afterwards and fails with `KeyNotFound` if the key was removed meanwhile.
//!
//! Values are accessed as stored: encrypted values are not decrypted.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::engine::Engine;
use crate::error::{Result, SubKvError};
use crate::lock::LockMode;
use crate::region::{Field, Session};
use crate::txn::{TxBatch, TxRecord};

/// Lock mode of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl From<AccessMode> for LockMode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Read => LockMode::Read,
            AccessMode::Write => LockMode::Write,
        }
    }
}

/// Cursor into the value of one key
pub struct DirectAccess<'a> {
    engine: &'a Engine,
    key: Vec<u8>,
    mode: AccessMode,
    element: u64,
    position: u64,
    session: Option<Session<'a>>,
}

impl<'a> DirectAccess<'a> {
    pub(crate) fn open(engine: &'a Engine, key: &[u8], mode: AccessMode) -> Result<Self> {
        if mode == AccessMode::Write {
            let (_, created) = engine.with_element(key, true, |_| Ok(()))?;
            if created {
                let mut batch = TxBatch::new();
                batch.push(TxRecord::set_all(key, b"", b"", b""));
                engine.dispatch(batch)?;
            }
        }

        let mut cursor = Self {
            engine,
            key: key.to_vec(),
            mode,
            element: 0,
            position: 0,
            session: None,
        };
        cursor.relock()?;
        Ok(cursor)
    }

    /// Take the locks again and find the element of the key
    fn relock(&mut self) -> Result<()> {
        self.session = None;
        let core = self.engine.core();
        let session = core.session(&self.key, self.mode.into())?;
        self.element = core
            .tree_find(session.bucket, session.hash, &self.key)?
            .ok_or(SubKvError::KeyNotFound)?;
        self.session = Some(session);
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(SubKvError::InvalidArgument(
                "cursor was opened for reading".into(),
            ));
        }
        Ok(())
    }

    /// Release the locks, dispatch `record`, and take the locks again
    fn commit(&mut self, record: TxRecord) -> Result<()> {
        self.engine.core().touch()?;
        self.session = None;

        let mut batch = TxBatch::new();
        batch.push(record);
        let dispatched = self.engine.dispatch(batch);

        self.relock()?;
        dispatched
    }

    // =========================================================================
    // Positioning
    // =========================================================================

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Current length of the stored value
    pub fn len(&self) -> Result<u64> {
        self.engine.core().field_len(self.element, Field::Value)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Move to `offset`, making sure `length` bytes are addressable from
    /// there
    ///
    /// Write mode zero-extends a shorter value; read mode rejects a range
    /// past the end.
    pub fn set_offset(&mut self, offset: u64, length: u64) -> Result<()> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| SubKvError::InvalidArgument("offset + length overflows".into()))?;
        let len = self.len()?;

        if end > len {
            if self.mode == AccessMode::Read {
                return Err(SubKvError::InvalidArgument(format!(
                    "range {}..{} is past the end of a {} byte value",
                    offset, end, len
                )));
            }
            self.engine.resize_value(self.element, end)?;
            debug!(from = len, to = end, "direct access extended value");
            self.commit(TxRecord::truncate(&self.key, end))?;
        }

        self.position = offset;
        Ok(())
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Read at the cursor and advance it
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read at `offset` without moving the cursor
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let core = self.engine.core();
        let (head, len) = core.chain_of(self.element, Field::Value)?;
        core.read_chain_at(head, len, offset, buf)
    }

    /// Stream the value from the cursor to its end into `writer`
    pub fn copy_to<W: io::Write>(&mut self, writer: &mut W) -> Result<u64> {
        let mut block = vec![0u8; self.engine.config().direct_block_size];
        let mut copied = 0u64;
        loop {
            let n = self.read(&mut block)?;
            if n == 0 {
                break;
            }
            writer.write_all(&block[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Write at the cursor and advance it
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.write_at(self.position, data)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Write at `offset` without moving the cursor; a gap past the end is
    /// zero-filled
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }

        self.engine.write_value_at(self.element, offset, data)?;
        self.commit(TxRecord::overwrite_at(&self.key, offset, data))?;
        Ok(data.len())
    }

    /// Copy `length` bytes from `reader` to the cursor, one block at a time
    ///
    /// Stops early if the reader runs dry; returns the bytes copied.
    pub fn copy_from<R: io::Read>(&mut self, reader: &mut R, length: u64) -> Result<u64> {
        self.check_writable()?;
        let block_size = self.engine.config().direct_block_size;
        let mut block = vec![0u8; block_size];
        let mut copied = 0u64;

        while copied < length {
            let want = (length - copied).min(block_size as u64) as usize;
            let n = match reader.read(&mut block[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write(&block[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }
}

fn to_io(e: SubKvError) -> io::Error {
    match e {
        SubKvError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl Read for DirectAccess<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DirectAccess::read(self, buf).map_err(to_io)
    }
}

impl Write for DirectAccess<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        DirectAccess::write(self, buf).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for DirectAccess<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => {
                let len = self.len().map_err(to_io)?;
                len.checked_add_signed(delta)
            }
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before the start of the value")
        })?;
        self.position = target;
        Ok(target)
    }
}

impl std::fmt::Debug for DirectAccess<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectAccess")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("mode", &self.mode)
            .field("position", &self.position)
            .finish()
    }
}
