//! # SubKV
//!
//! An embedded key-value engine over a shared, growable memory region:
//! - File-backed regions shared by several processes, or anonymous ones
//!   shared by the threads of one process
//! - Per-key subkey lists, attributes (expiry, history, encryption) and
//!   random access to value bytes
//! - Byte-range locking across threads and processes
//! - Capture of every mutation as a transaction record, delivered inline or
//!   through a region-backed queue
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │      get / set / remove / rename / direct / iter            │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//!  │   Region    │◄──────►│ RecordLock  │        │ Transaction │
//!  │ index/alloc │        │ (fcntl)     │        │   Manager   │
//!  └──────┬──────┘        └─────────────┘        └──────┬──────┘
//!         │                                             │
//!         ▼                                             ▼
//!  ┌─────────────┐                               ┌─────────────┐
//!  │   Mapping   │                               │  Handler /  │
//!  │  (memmap2)  │                               │  log file   │
//!  └─────────────┘                               └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod attr;
pub mod context;
pub mod hash;
pub mod lock;
pub mod subkeys;

mod region;

pub mod direct;
pub mod engine;
pub mod iter;
pub mod txn;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use attr::{AttrState, AttributeBackend, Attributes, SetOptions, StandardAttributes, ValueCipher};
pub use config::{OpenMode, RegionConfig, RegionConfigBuilder, TransactionMode};
pub use context::EngineContext;
pub use direct::{AccessMode, DirectAccess};
pub use engine::Engine;
pub use error::{Result, SubKvError};
pub use hash::{Crc32Pair, KeyHash, KeyHasher};
pub use iter::{KeyEntry, RegionIter, SubkeyIter};
pub use region::{RegionStats, VerifyReport, MAX_MASK, MAX_MASK_BITS, MIN_PAGE_SIZE};
pub use txn::{
    decode_group, encode_group, replay, save_log, CommandType, ErrorPolicy, LogFileHandler,
    LogReader, ReplayStats, TransactionHandler, TransactionManager, TxBatch, TxRecord, TxStats,
    RECORD_HEADER_SIZE,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of SubKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
