//! Iteration
//!
//! [`RegionIter`] walks the element areas in physical order. While it is
//! positioned on an element it holds the mask lock and that element's bucket
//! lock shared, so the element cannot change or move under it.
//!
//! Writing to the key the iterator is positioned on, from another thread or
//! process, blocks until the iterator moves on. The `Iterator` impl releases
//! its locks after every snapshot, so a loop body over it never holds them.

use std::vec;

use tracing::warn;

use crate::attr::Attributes;
use crate::engine::Engine;
use crate::error::{Result, SubKvError};
use crate::lock::{LockGuard, LockMode};
use crate::region::{is_internal_key, Field, ELEMENT_SIZE};

/// Snapshot of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub subkeys: Vec<Vec<u8>>,
    pub attributes: Option<Attributes>,
    /// Attribute bytes as stored
    pub raw_attributes: Vec<u8>,
}

/// Locks held while positioned
struct Position<'a> {
    element: u64,
    _bucket: LockGuard<'a>,
    _mask: LockGuard<'a>,
}

/// Physical-order walk over the stored keys
pub struct RegionIter<'a> {
    engine: &'a Engine,
    live_only: bool,
    /// Start offsets of the element areas already visited or queued
    areas: Vec<(u64, u64)>,
    area: usize,
    next_slot: u64,
    current: Option<Position<'a>>,
    finished: bool,
}

impl<'a> RegionIter<'a> {
    pub(crate) fn new(engine: &'a Engine, live_only: bool) -> Self {
        Self {
            engine,
            live_only,
            areas: Vec::new(),
            area: 0,
            next_slot: 0,
            current: None,
            finished: false,
        }
    }

    /// Pick up element areas appended since the last look
    fn refresh_areas(&mut self) -> Result<bool> {
        let core = self.engine.core();
        let _mask = core.mask_lock(LockMode::Read)?;
        let mut added = false;
        for area in core.element_areas()? {
            if !self.areas.iter().any(|(offset, _)| *offset == area.offset) {
                self.areas.push((area.offset, area.end()));
                added = true;
            }
        }
        Ok(added)
    }

    /// Next slot offset to examine, or `None` when every area is done
    fn next_candidate(&mut self) -> Result<Option<u64>> {
        loop {
            if let Some(&(start, end)) = self.areas.get(self.area) {
                if self.next_slot < start {
                    self.next_slot = start;
                }
                if self.next_slot + ELEMENT_SIZE <= end {
                    let slot = self.next_slot;
                    self.next_slot += ELEMENT_SIZE;
                    return Ok(Some(slot));
                }
                self.area += 1;
                continue;
            }
            if !self.refresh_areas()? {
                return Ok(None);
            }
        }
    }

    /// Move to the next stored key; false at the end
    pub fn advance(&mut self) -> Result<bool> {
        self.current = None;
        if self.finished {
            return Ok(false);
        }

        let core = self.engine.core();
        while let Some(slot) = self.next_candidate()? {
            let mask = core.mask_lock(LockMode::Read)?;
            if slot + ELEMENT_SIZE > core.map().len() {
                // Released by a compaction
                continue;
            }
            if !core.is_live(slot)? {
                continue;
            }
            let bucket = core.element_bucket(slot)?;
            if bucket == 0 {
                continue;
            }

            let guard = core.locks().acquire(bucket, LockMode::Read)?;
            // The element may have moved or died before the bucket lock
            if !core.is_live(slot)? || core.element_bucket(slot)? != bucket {
                continue;
            }
            if is_internal_key(&core.read_field(slot, Field::Key)?) {
                continue;
            }
            if self.live_only && !self.is_live_key(slot)? {
                continue;
            }

            self.current = Some(Position {
                element: slot,
                _bucket: guard,
                _mask: mask,
            });
            return Ok(true);
        }

        self.finished = true;
        Ok(false)
    }

    fn is_live_key(&self, element: u64) -> Result<bool> {
        match self.engine.snapshot(element, true) {
            Ok(_) => Ok(true),
            Err(e) if e.is_absent() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn element(&self) -> Result<u64> {
        self.current
            .as_ref()
            .map(|pos| pos.element)
            .ok_or_else(|| SubKvError::InvalidArgument("iterator is not positioned".into()))
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        self.engine.core().read_field(self.element()?, Field::Key)
    }

    /// Value of the current key (decrypted when iterating live keys)
    pub fn value(&self) -> Result<Vec<u8>> {
        if self.live_only {
            return Ok(self.entry()?.value);
        }
        self.engine.core().read_field(self.element()?, Field::Value)
    }

    pub fn subkeys(&self) -> Result<Vec<Vec<u8>>> {
        crate::subkeys::decode(&self.engine.core().read_field(self.element()?, Field::Subkeys)?)
    }

    pub fn attributes(&self) -> Result<Option<Attributes>> {
        let raw = self.engine.core().read_field(self.element()?, Field::Attrs)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Attributes::decode(&raw).map(Some)
    }

    /// Snapshot of the current key
    pub fn entry(&self) -> Result<KeyEntry> {
        self.engine.snapshot(self.element()?, self.live_only)
    }
}

impl Iterator for RegionIter<'_> {
    type Item = Result<KeyEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => {
                let entry = self.entry();
                self.current = None;
                Some(entry)
            }
            Ok(false) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Walk over the subkeys of one parent
///
/// Subkeys that are missing (or not live) are skipped with a warning.
pub struct SubkeyIter<'a> {
    engine: &'a Engine,
    names: vec::IntoIter<Vec<u8>>,
}

impl<'a> SubkeyIter<'a> {
    pub(crate) fn new(engine: &'a Engine, names: Vec<Vec<u8>>) -> Self {
        Self {
            engine,
            names: names.into_iter(),
        }
    }
}

impl Iterator for SubkeyIter<'_> {
    type Item = Result<KeyEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        for name in self.names.by_ref() {
            match self.engine.entry(&name) {
                Ok(entry) => return Some(Ok(entry)),
                Err(e) if e.is_absent() => {
                    warn!(subkey = %String::from_utf8_lossy(&name), reason = %e, "subkey skipped");
                }
                Err(SubKvError::InvalidArgument(reason)) => {
                    warn!(subkey = %String::from_utf8_lossy(&name), %reason, "subkey skipped");
                }
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
