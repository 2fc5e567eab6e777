//! Reentrant record lock
//!
//! Combines an in-process table (one slot per locked offset, tracking which
//! threads hold it) with OS record locks on the region descriptor. The OS lock
//! is taken when the first thread of this process needs it and released when
//! the last one lets go, so the same offset is exclusive across threads and
//! across processes.

use std::collections::HashMap;
use std::fs::File;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Result, SubKvError};

use super::os::{self, OsLockKind};
use super::LockMode;

/// What this process currently holds at the OS level for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OsHeld {
    None,
    Read,
    Write,
}

#[derive(Debug)]
struct Slot {
    readers: HashMap<ThreadId, u32>,
    writer: Option<(ThreadId, u32)>,
    os: OsHeld,
    /// A thread is inside a blocking OS call for this slot
    busy: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            readers: HashMap::new(),
            writer: None,
            os: OsHeld::None,
            busy: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && !self.busy
    }

    fn compatible(&self, me: ThreadId, mode: LockMode) -> bool {
        let writer_ok = self.writer.map_or(true, |(owner, _)| owner == me);
        match mode {
            LockMode::Read => writer_ok,
            LockMode::Write => writer_ok && self.readers.keys().all(|owner| *owner == me),
        }
    }

    fn wanted_os(&self) -> OsHeld {
        if self.writer.is_some() {
            OsHeld::Write
        } else if !self.readers.is_empty() {
            OsHeld::Read
        } else {
            OsHeld::None
        }
    }
}

/// Reentrant read/write lock keyed by region offset
///
/// ## Concurrency:
/// - `slots`: parking_lot Mutex, never held across a blocking OS call
/// - `cond`: woken on every release and every finished OS transition
/// - The backing descriptor is owned here so OS locks survive other handles
///   on the same file being closed
pub struct RecordLock {
    file: Option<File>,
    bypass: bool,
    slots: Mutex<HashMap<u64, Slot>>,
    cond: Condvar,
}

impl RecordLock {
    /// Lock table over a file descriptor
    pub fn for_file(file: File) -> Self {
        Self {
            file: Some(file),
            bypass: false,
            slots: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Lock table for an anonymous region (threads of this process only)
    pub fn in_process() -> Self {
        Self {
            file: None,
            bypass: false,
            slots: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Lock table whose calls are all no-ops (read-only attach)
    pub fn bypass() -> Self {
        Self {
            file: None,
            bypass: true,
            slots: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    fn fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    /// Block until `offset` is held in `mode`
    pub fn acquire(&self, offset: u64, mode: LockMode) -> Result<LockGuard<'_>> {
        match self.acquire_inner(offset, mode, true)? {
            Some(guard) => Ok(guard),
            None => Err(SubKvError::LockFailure(format!(
                "blocking lock on offset {} returned without the lock",
                offset
            ))),
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(&self, offset: u64, mode: LockMode) -> Result<Option<LockGuard<'_>>> {
        self.acquire_inner(offset, mode, false)
    }

    pub fn read(&self, offset: u64) -> Result<LockGuard<'_>> {
        self.acquire(offset, LockMode::Read)
    }

    pub fn write(&self, offset: u64) -> Result<LockGuard<'_>> {
        self.acquire(offset, LockMode::Write)
    }

    fn acquire_inner(
        &self,
        offset: u64,
        mode: LockMode,
        blocking: bool,
    ) -> Result<Option<LockGuard<'_>>> {
        if self.bypass {
            return Ok(Some(LockGuard::new(self, offset, mode)));
        }

        let me = thread::current().id();
        let mut slots = self.slots.lock();

        loop {
            let slot = slots.entry(offset).or_insert_with(Slot::new);

            if slot.busy || !slot.compatible(me, mode) {
                if !blocking {
                    if slot.is_idle() {
                        slots.remove(&offset);
                    }
                    return Ok(None);
                }
                self.cond.wait(&mut slots);
                continue;
            }

            let target = match (mode, slot.os) {
                (LockMode::Write, OsHeld::Write) => None,
                (LockMode::Write, _) => Some(OsHeld::Write),
                (LockMode::Read, OsHeld::None) => Some(OsHeld::Read),
                (LockMode::Read, _) => None,
            };

            if let (Some(target), Some(fd)) = (target, self.fd()) {
                slot.busy = true;
                let kind = match target {
                    OsHeld::Write => OsLockKind::Write,
                    _ => OsLockKind::Read,
                };

                let outcome = MutexGuard::unlocked(&mut slots, || {
                    os::set_lock(fd, offset, 1, kind, blocking)
                });

                let slot = slots.entry(offset).or_insert_with(Slot::new);
                slot.busy = false;
                self.cond.notify_all();

                match outcome {
                    Ok(true) => slot.os = target,
                    Ok(false) => {
                        if slot.is_idle() {
                            slots.remove(&offset);
                        }
                        return Ok(None);
                    }
                    Err(e) => {
                        if slot.is_idle() {
                            slots.remove(&offset);
                        }
                        return Err(SubKvError::LockFailure(format!(
                            "fcntl on offset {} failed: {}",
                            offset, e
                        )));
                    }
                }
            } else if let Some(target) = target {
                slot.os = target;
            }

            let slot = slots.entry(offset).or_insert_with(Slot::new);
            match mode {
                LockMode::Read => *slot.readers.entry(me).or_insert(0) += 1,
                LockMode::Write => {
                    let depth = slot.writer.map_or(0, |(_, n)| n);
                    slot.writer = Some((me, depth + 1));
                }
            }

            return Ok(Some(LockGuard::new(self, offset, mode)));
        }
    }

    fn release(&self, offset: u64, mode: LockMode) {
        if self.bypass {
            return;
        }

        let me = thread::current().id();
        let mut slots = self.slots.lock();

        let Some(slot) = slots.get_mut(&offset) else {
            tracing::warn!(offset, "release of an offset that is not locked");
            return;
        };

        match mode {
            LockMode::Read => {
                if let Some(count) = slot.readers.get_mut(&me) {
                    *count -= 1;
                    if *count == 0 {
                        slot.readers.remove(&me);
                    }
                }
            }
            LockMode::Write => {
                if let Some((owner, count)) = slot.writer {
                    if owner == me {
                        slot.writer = if count > 1 { Some((owner, count - 1)) } else { None };
                    }
                }
            }
        }

        let wanted = slot.wanted_os();
        if wanted != slot.os && !slot.busy {
            if let Some(fd) = self.fd() {
                let kind = match wanted {
                    OsHeld::None => OsLockKind::Unlock,
                    // downgrade from write; never blocks
                    _ => OsLockKind::Read,
                };
                if let Err(e) = os::set_lock(fd, offset, 1, kind, false) {
                    tracing::warn!(offset, error = %e, "failed to release OS record lock");
                }
            }
            slot.os = wanted;
        }

        if slot.is_idle() {
            slots.remove(&offset);
        }
        self.cond.notify_all();
    }

    /// Number of offsets currently tracked (for tests and debugging)
    pub fn held_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// RAII guard for one acquisition of a [`RecordLock`] slot
///
/// Bound to the acquiring thread: the lock table tracks owners by thread id.
pub struct LockGuard<'a> {
    lock: &'a RecordLock,
    offset: u64,
    mode: LockMode,
    _not_send: PhantomData<*const ()>,
}

impl<'a> LockGuard<'a> {
    fn new(lock: &'a RecordLock, offset: u64, mode: LockMode) -> Self {
        Self {
            lock,
            offset,
            mode,
            _not_send: PhantomData,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.offset, self.mode);
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("offset", &self.offset)
            .field("mode", &self.mode)
            .finish()
    }
}
