//! Region mapping
//!
//! Owns the memory map of the region and exposes bounds-checked accessors by
//! byte offset. No reference into the map ever escapes an accessor, so the
//! map can be replaced (growth, compaction, another process resizing the
//! file) while other threads keep working with plain offsets.
//!
//! ## Concurrency:
//! - `state`: parking_lot RwLock; accessors take it shared for the duration of
//!   one copy, remapping takes it exclusive
//! - Data races on the mapped bytes themselves are excluded by the record
//!   locks the callers hold

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, SubKvError};

enum Backing {
    /// Shared writable file mapping
    File(MmapMut),
    /// Read-only file mapping
    ReadOnly(Mmap),
    /// Private to this process
    Anonymous(MmapMut),
}

struct MapState {
    backing: Backing,
    base: *mut u8,
    len: u64,
}

// SAFETY: `base` points into the mapping owned by `backing` and is only
// dereferenced while the surrounding RwLock is held.
unsafe impl Send for MapState {}
unsafe impl Sync for MapState {}

impl MapState {
    fn writable(mut mmap: MmapMut, anonymous: bool) -> Self {
        let base = mmap.as_mut_ptr();
        let len = mmap.len() as u64;
        let backing = if anonymous {
            Backing::Anonymous(mmap)
        } else {
            Backing::File(mmap)
        };
        Self { backing, base, len }
    }

    fn read_only(mmap: Mmap) -> Self {
        let base = mmap.as_ptr() as *mut u8;
        let len = mmap.len() as u64;
        Self {
            backing: Backing::ReadOnly(mmap),
            base,
            len,
        }
    }
}

/// Memory map of the region
pub struct Mapping {
    file: Option<File>,
    read_only: bool,
    state: RwLock<MapState>,
}

impl Mapping {
    /// Map `file` read-write after sizing it to `len` bytes
    pub fn create_file(file: File, len: u64) -> Result<Self> {
        file.set_len(len)?;
        let state = MapState::writable(map_file_mut(&file, len)?, false);
        Ok(Self {
            file: Some(file),
            read_only: false,
            state: RwLock::new(state),
        })
    }

    /// Map an existing file at its current length
    pub fn open_file(file: File, read_only: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(SubKvError::Corruption("region file is empty".into()));
        }

        let state = if read_only {
            MapState::read_only(map_file(&file, len)?)
        } else {
            MapState::writable(map_file_mut(&file, len)?, false)
        };

        Ok(Self {
            file: Some(file),
            read_only,
            state: RwLock::new(state),
        })
    }

    /// Zero-filled anonymous memory
    pub fn anonymous(len: u64) -> Result<Self> {
        let mmap = MmapOptions::new().len(len as usize).map_anon()?;
        Ok(Self {
            file: None,
            read_only: false,
            state: RwLock::new(MapState::writable(mmap, true)),
        })
    }

    pub fn len(&self) -> u64 {
        self.state.read().len
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Run `f` with a pointer to `[offset, offset + len)`, remapping once if the
    /// range lies beyond the current map
    fn with_range<R>(&self, offset: u64, len: u64, f: impl FnOnce(*mut u8) -> R) -> Result<R> {
        let end = offset.checked_add(len).ok_or_else(|| {
            SubKvError::Corruption(format!("range at {} of {} bytes overflows", offset, len))
        })?;

        if end > self.state.read().len {
            self.refresh()?;
        }

        let state = self.state.read();
        if end > state.len {
            return Err(SubKvError::Corruption(format!(
                "range {}..{} outside region of {} bytes",
                offset, end, state.len
            )));
        }

        // SAFETY: the range was checked against the live mapping, which
        // cannot be replaced while the read guard is held.
        Ok(f(unsafe { state.base.add(offset as usize) }))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(SubKvError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        self.with_range(offset, 8, |p| {
            // SAFETY: 8 bytes in range; unaligned read.
            u64::from_le(unsafe { std::ptr::read_unaligned(p as *const u64) })
        })
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.check_writable()?;
        self.with_range(offset, 8, |p| {
            // SAFETY: 8 bytes in range of a writable mapping.
            unsafe { std::ptr::write_unaligned(p as *mut u64, value.to_le()) }
        })
    }

    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_range(offset, buf.len() as u64, |p| {
            // SAFETY: source range checked; `buf` is a distinct allocation.
            unsafe { std::ptr::copy_nonoverlapping(p as *const u8, buf.as_mut_ptr(), buf.len()) }
        })
    }

    pub fn read_vec(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.with_range(offset, data.len() as u64, |p| {
            // SAFETY: destination range checked; `data` is a distinct allocation.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) }
        })
    }

    pub fn fill(&self, offset: u64, len: u64, byte: u8) -> Result<()> {
        self.check_writable()?;
        self.with_range(offset, len, |p| {
            // SAFETY: destination range checked.
            unsafe { std::ptr::write_bytes(p, byte, len as usize) }
        })
    }

    /// Copy `len` bytes between two non-overlapping ranges of the region
    pub fn copy_within(&self, src: u64, dst: u64, len: u64) -> Result<()> {
        self.check_writable()?;
        let hi = src.max(dst);
        let lo = src.min(dst);
        if lo + len > hi {
            return Err(SubKvError::InvalidArgument(format!(
                "overlapping copy {} -> {} of {} bytes",
                src, dst, len
            )));
        }
        self.with_range(lo, hi + len - lo, |p| {
            // SAFETY: both ranges lie inside the checked span and do not overlap.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    p.add((src - lo) as usize),
                    p.add((dst - lo) as usize),
                    len as usize,
                )
            }
        })
    }

    /// Atomic add on an 8-byte aligned counter; returns the previous value
    pub fn fetch_add_u64(&self, offset: u64, delta: u64) -> Result<u64> {
        self.check_writable()?;
        self.aligned(offset)?;
        self.with_range(offset, 8, |p| {
            // SAFETY: aligned, in range, and the mapping is shared memory.
            unsafe { (*(p as *const AtomicU64)).fetch_add(delta, Ordering::SeqCst) }
        })
    }

    pub fn fetch_sub_u64(&self, offset: u64, delta: u64) -> Result<u64> {
        self.check_writable()?;
        self.aligned(offset)?;
        self.with_range(offset, 8, |p| {
            // SAFETY: as in fetch_add_u64.
            unsafe { (*(p as *const AtomicU64)).fetch_sub(delta, Ordering::SeqCst) }
        })
    }

    pub fn fetch_max_u64(&self, offset: u64, value: u64) -> Result<u64> {
        self.check_writable()?;
        self.aligned(offset)?;
        self.with_range(offset, 8, |p| {
            // SAFETY: as in fetch_add_u64.
            unsafe { (*(p as *const AtomicU64)).fetch_max(value, Ordering::SeqCst) }
        })
    }

    fn aligned(&self, offset: u64) -> Result<()> {
        if offset % 8 != 0 {
            return Err(SubKvError::InvalidArgument(format!(
                "atomic access at unaligned offset {}",
                offset
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    /// Grow or shrink the region to `new_len` bytes
    ///
    /// File-backed regions resize the file and remap; anonymous regions copy
    /// into a fresh map.
    pub fn resize(&self, new_len: u64) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        if new_len == state.len {
            return Ok(());
        }

        match &self.file {
            Some(file) => {
                if new_len > state.len {
                    file.set_len(new_len)?;
                    *state = MapState::writable(map_file_mut(file, new_len)?, false);
                } else {
                    // Unmap the tail before the file loses it
                    *state = MapState::writable(map_file_mut(file, new_len)?, false);
                    file.set_len(new_len)?;
                }
            }
            None => {
                let mut fresh = MmapOptions::new().len(new_len as usize).map_anon()?;
                let keep = state.len.min(new_len) as usize;
                // SAFETY: `base` covers `state.len` bytes of the old map.
                let old = unsafe { std::slice::from_raw_parts(state.base as *const u8, keep) };
                fresh[..keep].copy_from_slice(old);
                *state = MapState::writable(fresh, true);
            }
        }

        debug!(len = new_len, "region remapped");
        Ok(())
    }

    /// Pick up a length change made through another descriptor
    pub fn refresh(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };

        let mut state = self.state.write();
        let file_len = file.metadata()?.len();
        if file_len == state.len || file_len == 0 {
            return Ok(());
        }

        let fresh = if matches!(state.backing, Backing::ReadOnly(_)) {
            MapState::read_only(map_file(file, file_len)?)
        } else {
            MapState::writable(map_file_mut(file, file_len)?, false)
        };
        *state = fresh;
        debug!(len = file_len, "region remapped to file length");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let state = self.state.read();
        if let Backing::File(mmap) = &state.backing {
            mmap.flush()?;
        }
        Ok(())
    }
}

fn map_file_mut(file: &File, len: u64) -> Result<MmapMut> {
    // SAFETY: the region file is shared with other processes by design; all
    // access goes through bounds-checked accessors under record locks.
    let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
    Ok(mmap)
}

fn map_file(file: &File, len: u64) -> Result<Mmap> {
    // SAFETY: as in map_file_mut; the map is never written.
    let mmap = unsafe { MmapOptions::new().len(len as usize).map(file)? };
    Ok(mmap)
}
