//! Region Module
//!
//! The shared storage region: one mapping (file-backed or anonymous) holding
//! the header, the hash index, the element slots and the page blocks.
//!
//! ## Responsibilities
//! - Create or attach to a region and validate its header
//! - Bounds-checked access to region structures by offset
//! - Hash index with incremental rehashing
//! - Element/page allocation, region growth and compaction
//!
//! ## Region Layout
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┬─────┐
//! │  Header  │ Key-Index │ Collision[n] │ Elements │  Pages   │ ... │
//! │ (8 KiB)  │ (64 ent.) │  (buckets)   │ (128 B)  │ (paged)  │     │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┴─────┘
//!  offset 0                                     unassigned cursor ─┘
//! ```
//!
//! Areas are appended as the region grows and recorded in the header's area
//! table; only the last one can be released again.

mod alloc;
mod area;
mod chain;
mod element;
mod index;
pub(crate) mod layout;
mod mapping;
mod verify;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::attr::now_micros;
use crate::config::{OpenMode, RegionConfig};
use crate::context::EngineContext;
use crate::error::{Result, SubKvError};
use crate::hash::{KeyHash, KeyHasher};
use crate::lock::os::system_page_size;
use crate::lock::{LockGuard, LockMode, RecordLock};

pub(crate) use element::ElementData;
pub(crate) use index::Session;
pub(crate) use layout::{is_internal_key, Field, ELEMENT_SIZE, INTERNAL_PREFIX};
pub use layout::{MAX_MASK, MAX_MASK_BITS, MIN_PAGE_SIZE};
pub use verify::VerifyReport;

use layout::*;
use mapping::Mapping;

/// Attempts to wait for a concurrent creator to finish the header
const ATTACH_RETRIES: u32 = 200;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Point-in-time counters read from the header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub region_len: u64,
    pub page_size: u64,
    pub current_mask: u64,
    pub min_mask: u64,
    pub max_mask: u64,
    pub collision_mask: u64,
    pub live_elements: u64,
    pub free_elements: u64,
    pub total_elements: u64,
    pub free_pages: u64,
    pub total_pages: u64,
    pub area_count: u64,
    pub last_update: u64,
    pub area_update: u64,
}

/// Growth tuning of this handle (not stored in the region)
#[derive(Debug, Clone, Copy)]
struct Growth {
    ratio_percent: u64,
    max_slots: u64,
}

/// One attached region
pub(crate) struct RegionCore {
    map: Mapping,
    locks: Arc<RecordLock>,
    hasher: Arc<dyn KeyHasher>,
    page_size: u64,
    max_element_count: u64,
    sys_page: u64,
    growth: Growth,
}

impl RegionCore {
    // =========================================================================
    // Open / Create
    // =========================================================================

    /// Create or attach according to `config.open_mode`
    pub(crate) fn open(
        config: &RegionConfig,
        hasher: Arc<dyn KeyHasher>,
        ctx: &EngineContext,
    ) -> Result<Self> {
        let sys_page = system_page_size();
        let header_len = align_up(HEADER_SIZE, sys_page);

        let Some(path) = &config.path else {
            if config.read_only {
                return Err(SubKvError::Config(
                    "an anonymous region cannot be attached read-only".into(),
                ));
            }
            let map = Mapping::anonymous(header_len)?;
            let core = Self::assemble(map, Arc::new(RecordLock::in_process()), hasher, config, sys_page);
            core.initialize(config)?;
            return Ok(core);
        };

        let create = match config.open_mode {
            OpenMode::Create => true,
            OpenMode::Open => false,
            OpenMode::OpenOrCreate => !path.exists(),
        };
        if !create {
            return Self::attach(path, config, hasher, ctx, sys_page);
        }

        if config.read_only {
            return Err(SubKvError::Config("cannot create a region read-only".into()));
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if config.open_mode == OpenMode::Create {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = match options.open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race to another creator
                return Self::attach(path, config, hasher, ctx, sys_page);
            }
            Err(e) => return Err(e.into()),
        };

        let locks = ctx.lock_table(&file, false)?;
        let map = Mapping::create_file(file, header_len)?;
        let core = Self::assemble(map, locks, hasher, config, sys_page);
        core.initialize(config)?;
        info!(path = %path.display(), "region created");
        Ok(core)
    }

    fn attach(
        path: &Path,
        config: &RegionConfig,
        hasher: Arc<dyn KeyHasher>,
        ctx: &EngineContext,
        sys_page: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .open(path)?;
        let locks = ctx.lock_table(&file, config.read_only)?;

        Self::wait_for_length(&file)?;
        let map = Mapping::open_file(file, config.read_only)?;
        let mut core = Self::assemble(map, locks, hasher, config, sys_page);
        core.validate()?;

        info!(
            path = %path.display(),
            read_only = config.read_only,
            page_size = core.page_size,
            "region attached"
        );
        Ok(core)
    }

    fn wait_for_length(file: &File) -> Result<()> {
        for _ in 0..ATTACH_RETRIES {
            if file.metadata()?.len() >= HEADER_SIZE {
                return Ok(());
            }
            thread::sleep(ATTACH_RETRY_DELAY);
        }
        Err(SubKvError::Corruption(
            "region file is shorter than its header".into(),
        ))
    }

    fn assemble(
        map: Mapping,
        locks: Arc<RecordLock>,
        hasher: Arc<dyn KeyHasher>,
        config: &RegionConfig,
        sys_page: u64,
    ) -> Self {
        Self {
            map,
            locks,
            hasher,
            page_size: config.page_size as u64,
            max_element_count: config.max_element_count,
            sys_page,
            growth: Growth {
                ratio_percent: config.grow_ratio_percent,
                max_slots: config.max_grow_elements,
            },
        }
    }

    /// Lay out a fresh header, index and initial free lists
    fn initialize(&self, config: &RegionConfig) -> Result<()> {
        let _guard = self.locks.write(HDR_MAGIC)?;
        let header_len = self.map.len();
        let now = now_micros();

        self.map.fill(0, HEADER_SIZE, 0)?;
        self.write_version(HDR_VERSION, ENGINE_VERSION)?;
        self.write_version(HDR_HASH_VERSION, self.hasher.version())?;

        let fields = [
            (HDR_PAGE_SIZE, self.page_size),
            (HDR_CUR_MASK, config.min_mask),
            (HDR_MIN_MASK, config.min_mask),
            (HDR_MAX_MASK, config.max_mask),
            (HDR_COLLISION_MASK, config.min_mask),
            (HDR_MAX_ELEMENTS, config.max_element_count),
            (HDR_REGION_LEN, header_len),
            (HDR_UNASSIGNED, header_len),
            (HDR_UNIQUE_SEQ, 1),
            (HDR_LAST_UPDATE, now),
            (HDR_AREA_UPDATE, now),
        ];
        for (field, value) in fields {
            self.set_hdr(field, value)?;
        }

        self.write_area(
            0,
            Area {
                kind: AreaKind::Header,
                offset: 0,
                length: header_len,
            },
        )?;
        self.set_hdr(HDR_AREA_COUNT, 1)?;

        let (key_index, _) =
            self.append_area(AreaKind::KeyIndex, KEY_INDEX_ENTRIES * KI_ENTRY_SIZE)?;
        self.set_hdr(HDR_KEY_INDEX, key_index)?;
        self.create_level(mask_bits(config.min_mask), true)?;
        self.add_elements(config.initial_elements)?;
        self.add_pages(config.initial_pages)?;

        // Attachers wait for the magic
        self.map.write(HDR_MAGIC, MAGIC)?;
        debug!(
            len = self.map.len(),
            mask = config.min_mask,
            page_size = self.page_size,
            "region initialized"
        );
        Ok(())
    }

    /// Check the header of an attached region and adopt its parameters
    fn validate(&mut self) -> Result<()> {
        for _ in 0..ATTACH_RETRIES {
            let guard = self.locks.read(HDR_MAGIC)?;
            let magic = self.map.read_vec(HDR_MAGIC, MAGIC.len() as u64)?;
            drop(guard);
            if magic.as_slice() == MAGIC {
                return self.validate_header();
            }
            if magic.iter().any(|b| *b != 0) {
                return Err(SubKvError::Corruption("bad region magic".into()));
            }
            // Creator has not finished yet
            thread::sleep(ATTACH_RETRY_DELAY);
        }
        Err(SubKvError::Corruption("region header never initialized".into()))
    }

    fn validate_header(&mut self) -> Result<()> {
        let version = self.read_version(HDR_VERSION)?;
        if version != padded(ENGINE_VERSION) {
            return Err(SubKvError::Corruption(format!(
                "region version {:?} is not supported",
                String::from_utf8_lossy(&version)
            )));
        }

        let hash_version = self.read_version(HDR_HASH_VERSION)?;
        if hash_version != padded(self.hasher.version()) {
            return Err(SubKvError::Config(format!(
                "region was built with hasher {:?}, attached with {:?}",
                String::from_utf8_lossy(&hash_version),
                self.hasher.version()
            )));
        }

        let page_size = self.hdr(HDR_PAGE_SIZE)?;
        if page_size < MIN_PAGE_SIZE as u64 || page_size % 8 != 0 {
            return Err(SubKvError::Corruption(format!(
                "invalid page size {} in header",
                page_size
            )));
        }
        self.page_size = page_size;
        self.max_element_count = self.hdr(HDR_MAX_ELEMENTS)?.max(1);
        self.sync_mapping()?;
        Ok(())
    }

    fn write_version(&self, field: u64, version: &str) -> Result<()> {
        self.map.write(field, &padded(version))
    }

    fn read_version(&self, field: u64) -> Result<Vec<u8>> {
        self.map.read_vec(field, VERSION_LEN as u64)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn map(&self) -> &Mapping {
        &self.map
    }

    pub(crate) fn locks(&self) -> &RecordLock {
        &self.locks
    }

    pub(crate) fn hasher(&self) -> &dyn KeyHasher {
        self.hasher.as_ref()
    }

    pub(crate) fn hash(&self, key: &[u8]) -> KeyHash {
        self.hasher.hash(key)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.map.is_read_only()
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.page_size
    }

    pub(crate) fn max_element_count(&self) -> u64 {
        self.max_element_count
    }

    pub(crate) fn system_page(&self) -> u64 {
        self.sys_page
    }

    fn growth_params(&self) -> (u64, u64) {
        (self.growth.ratio_percent, self.growth.max_slots)
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.map.file().map(|f| f.as_raw_fd())
    }

    pub(crate) fn hdr(&self, field: u64) -> Result<u64> {
        self.map.read_u64(field)
    }

    pub(crate) fn set_hdr(&self, field: u64, value: u64) -> Result<()> {
        self.map.write_u64(field, value)
    }

    /// Record a modification time in the header
    pub(crate) fn touch(&self) -> Result<()> {
        self.set_hdr(HDR_LAST_UPDATE, now_micros())
    }

    pub(crate) fn next_unique_id(&self) -> Result<u64> {
        self.map.fetch_add_u64(HDR_UNIQUE_SEQ, 1)
    }

    /// Remap when another descriptor changed the region length
    pub(crate) fn sync_mapping(&self) -> Result<()> {
        if self.hdr(HDR_REGION_LEN)? != self.map.len() {
            self.map.refresh()?;
        }
        Ok(())
    }

    /// Take the mask lock and bring the mapping up to date
    pub(crate) fn mask_lock(&self, mode: LockMode) -> Result<LockGuard<'_>> {
        let guard = self.locks.acquire(HDR_CUR_MASK, mode)?;
        self.sync_mapping()?;
        Ok(guard)
    }

    /// Lock guarding the transaction queue
    pub(crate) fn queue_lock(&self) -> Result<LockGuard<'_>> {
        self.locks.write(HDR_TXQ_ANCHOR)
    }

    pub(crate) fn stats(&self) -> Result<RegionStats> {
        let _mask = self.mask_lock(LockMode::Read)?;
        Ok(RegionStats {
            region_len: self.hdr(HDR_REGION_LEN)?,
            page_size: self.hdr(HDR_PAGE_SIZE)?,
            current_mask: self.hdr(HDR_CUR_MASK)?,
            min_mask: self.hdr(HDR_MIN_MASK)?,
            max_mask: self.hdr(HDR_MAX_MASK)?,
            collision_mask: self.hdr(HDR_COLLISION_MASK)?,
            live_elements: self.hdr(HDR_LIVE_COUNT)?,
            free_elements: self.hdr(HDR_FREE_ELEMENT_COUNT)?,
            total_elements: self.hdr(HDR_TOTAL_ELEMENTS)?,
            free_pages: self.hdr(HDR_FREE_PAGE_COUNT)?,
            total_pages: self.hdr(HDR_TOTAL_PAGES)?,
            area_count: self.hdr(HDR_AREA_COUNT)?,
            last_update: self.hdr(HDR_LAST_UPDATE)?,
            area_update: self.hdr(HDR_AREA_UPDATE)?,
        })
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.map.flush()
    }
}

fn padded(version: &str) -> Vec<u8> {
    let mut out = vec![0u8; VERSION_LEN];
    let bytes = version.as_bytes();
    let n = bytes.len().min(VERSION_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}
