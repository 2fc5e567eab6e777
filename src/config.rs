//! Configuration for SubKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{Result, SubKvError};

/// Main configuration for a SubKV region
#[derive(Debug, Clone)]
pub struct RegionConfig {
    // -------------------------------------------------------------------------
    // Region Configuration
    // -------------------------------------------------------------------------
    /// Backing file. `None` maps anonymous memory shared by the threads of
    /// this process only.
    pub path: Option<PathBuf>,

    /// How to treat an existing/missing backing file
    pub open_mode: OpenMode,

    /// Attach without write access and without taking OS locks
    pub read_only: bool,

    /// Size of one page block in bytes (header included)
    pub page_size: usize,

    // -------------------------------------------------------------------------
    // Hash Index Configuration
    // -------------------------------------------------------------------------
    /// Mask used when the region is created (must be 2^n - 1)
    pub min_mask: u64,

    /// Upper bound for mask growth (must be 2^n - 1)
    pub max_mask: u64,

    /// Bucket population that triggers a mask growth
    pub max_element_count: u64,

    // -------------------------------------------------------------------------
    // Growth Configuration
    // -------------------------------------------------------------------------
    /// Element slots allocated at creation
    pub initial_elements: u64,

    /// Page blocks allocated at creation
    pub initial_pages: u64,

    /// Growth size as a percentage of the live element count
    pub grow_ratio_percent: u64,

    /// Cap on the number of slots added by one growth step
    pub max_grow_elements: u64,

    // -------------------------------------------------------------------------
    // Behaviour
    // -------------------------------------------------------------------------
    /// Keep removed keys as history records instead of deleting them
    pub history: bool,

    /// Retries of the Set remove/reinsert protocol before giving up
    pub set_retry_limit: u32,

    /// Block size used by bulk direct-access copies
    pub direct_block_size: usize,

    // -------------------------------------------------------------------------
    // Plugins
    // -------------------------------------------------------------------------
    /// Registered name of the key hasher
    pub hasher: String,

    /// Registered name of the attribute backend
    pub attribute_backend: String,

    // -------------------------------------------------------------------------
    // Transaction Configuration
    // -------------------------------------------------------------------------
    /// Dispatch mode for transaction records
    pub transaction_mode: TransactionMode,

    /// Log file for the default transaction handler
    pub log_path: Option<PathBuf>,

    /// Registered name of a custom transaction handler (overrides `log_path`)
    pub transaction_handler: Option<String>,

    /// How often idle async workers re-check the shared queue (milliseconds)
    pub queue_poll_ms: u64,
}

/// What to do with the backing file on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a fresh region, discarding any existing file
    Create,

    /// Attach to an existing region; fail if it does not exist
    Open,

    /// Attach if present, create otherwise
    OpenOrCreate,
}

/// Transaction dispatch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Mutations are not captured
    Disabled,

    /// Handler is invoked inline once the mutation committed
    Sync,

    /// Records go through the region-backed queue to a worker pool
    Async { workers: usize },
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            path: None,
            open_mode: OpenMode::OpenOrCreate,
            read_only: false,
            page_size: 256,
            min_mask: 0xFF,
            max_mask: 0xF_FFFF,
            max_element_count: 16,
            initial_elements: 512,
            initial_pages: 2048,
            grow_ratio_percent: 50,
            max_grow_elements: 65_536,
            history: false,
            set_retry_limit: 64,
            direct_block_size: 400 * 1024, // 400 KB
            hasher: crate::hash::DEFAULT_HASHER.to_string(),
            attribute_backend: crate::attr::DEFAULT_BACKEND.to_string(),
            transaction_mode: TransactionMode::Disabled,
            log_path: None,
            transaction_handler: None,
            queue_poll_ms: 50,
        }
    }
}

impl RegionConfig {
    /// Create a new config builder
    pub fn builder() -> RegionConfigBuilder {
        RegionConfigBuilder::default()
    }

    /// Check the values that would corrupt the layout if accepted
    pub fn validate(&self) -> Result<()> {
        if self.page_size < crate::region::MIN_PAGE_SIZE || self.page_size % 8 != 0 {
            return Err(SubKvError::Config(format!(
                "page size {} must be a multiple of 8 and at least {}",
                self.page_size,
                crate::region::MIN_PAGE_SIZE
            )));
        }

        for (name, mask) in [("min_mask", self.min_mask), ("max_mask", self.max_mask)] {
            if mask == 0 || (mask & (mask + 1)) != 0 || mask > crate::region::MAX_MASK {
                return Err(SubKvError::Config(format!(
                    "{} {:#x} must be 2^n - 1 with 1 <= n <= {}",
                    name,
                    mask,
                    crate::region::MAX_MASK_BITS
                )));
            }
        }

        if self.min_mask > self.max_mask {
            return Err(SubKvError::Config(format!(
                "min_mask {:#x} exceeds max_mask {:#x}",
                self.min_mask, self.max_mask
            )));
        }

        if self.max_element_count == 0 {
            return Err(SubKvError::Config("max_element_count must be positive".into()));
        }

        if self.direct_block_size == 0 {
            return Err(SubKvError::Config("direct_block_size must be positive".into()));
        }

        if let TransactionMode::Async { workers } = self.transaction_mode {
            if workers == 0 {
                return Err(SubKvError::Config("async mode needs at least one worker".into()));
            }
        }

        Ok(())
    }
}

/// Builder for RegionConfig
#[derive(Default)]
pub struct RegionConfigBuilder {
    config: RegionConfig,
}

impl RegionConfigBuilder {
    /// Back the region with a file
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Back the region with anonymous memory
    pub fn anonymous(mut self) -> Self {
        self.config.path = None;
        self
    }

    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.config.open_mode = mode;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Set the page block size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    pub fn min_mask(mut self, mask: u64) -> Self {
        self.config.min_mask = mask;
        self
    }

    pub fn max_mask(mut self, mask: u64) -> Self {
        self.config.max_mask = mask;
        self
    }

    pub fn max_element_count(mut self, count: u64) -> Self {
        self.config.max_element_count = count;
        self
    }

    pub fn initial_elements(mut self, count: u64) -> Self {
        self.config.initial_elements = count;
        self
    }

    pub fn initial_pages(mut self, count: u64) -> Self {
        self.config.initial_pages = count;
        self
    }

    pub fn grow_ratio_percent(mut self, percent: u64) -> Self {
        self.config.grow_ratio_percent = percent;
        self
    }

    pub fn max_grow_elements(mut self, count: u64) -> Self {
        self.config.max_grow_elements = count;
        self
    }

    /// Keep removed keys as history records
    pub fn history(mut self, enabled: bool) -> Self {
        self.config.history = enabled;
        self
    }

    pub fn set_retry_limit(mut self, limit: u32) -> Self {
        self.config.set_retry_limit = limit;
        self
    }

    pub fn direct_block_size(mut self, size: usize) -> Self {
        self.config.direct_block_size = size;
        self
    }

    pub fn hasher(mut self, name: impl Into<String>) -> Self {
        self.config.hasher = name.into();
        self
    }

    pub fn attribute_backend(mut self, name: impl Into<String>) -> Self {
        self.config.attribute_backend = name.into();
        self
    }

    /// Set the transaction dispatch mode
    pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.config.transaction_mode = mode;
        self
    }

    /// Log file used by the default transaction handler
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_path = Some(path.into());
        self
    }

    pub fn transaction_handler(mut self, name: impl Into<String>) -> Self {
        self.config.transaction_handler = Some(name.into());
        self
    }

    pub fn queue_poll_ms(mut self, ms: u64) -> Self {
        self.config.queue_poll_ms = ms;
        self
    }

    pub fn build(self) -> RegionConfig {
        self.config
    }
}
