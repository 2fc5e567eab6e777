//! Lock Module
//!
//! Cross-process and cross-thread byte-range locks over the region descriptor.
//!
//! ## Responsibilities
//! - Reentrant read/write locks keyed by region offset
//! - Visibility across threads (in-process table) and processes (`fcntl`)
//! - No-op locking for descriptors attached read-only
//!
//! ## Lock Anchors
//! ```text
//! ┌───────────────────────┬──────────────────────────────────────┐
//! │ Header: current mask  │ mask lock (read for every operation) │
//! │ Bucket offset         │ bucket lock (per collision entry)    │
//! │ Header: unassigned    │ region growth / compaction           │
//! │ Header: free heads    │ element / page free lists            │
//! │ Header: txq anchor    │ transaction queue                    │
//! └───────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//! mask → bucket (ascending offset when two) → unassigned → free list.
//! Locks are dropped before transaction dispatch; callers re-acquire and
//! re-validate afterwards.

pub(crate) mod os;
mod record;
mod registry;

pub use record::{LockGuard, RecordLock};
pub use registry::ReadOnlyRegistry;

/// Requested access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared
    Read,
    /// Exclusive
    Write,
}
