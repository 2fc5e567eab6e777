//! Transaction Module
//!
//! Capture and dispatch of committed mutations.
//!
//! ## Responsibilities
//! - Self-describing, checksummed records for every mutation kind
//! - Grouping the records of one logical operation
//! - Inline or queued (worker pool) delivery to a pluggable handler
//! - Default handler appending to a shared log file
//! - Log scan, replay into an engine and full snapshot to a log
//!
//! ## Flow
//! ```text
//! Engine op ──► TxBatch ──(locks released)──► TransactionManager
//!                                                │
//!                          Sync ◄────────────────┼────────────► Async
//!                            │                                    │
//!                            ▼                                    ▼
//!                   handler.apply_group            region queue ──► workers
//!                            │                                    │
//!                            └──── failure ──► recovery queue ◄───┘
//! ```

mod handler;
mod log;
mod manager;
mod queue;
mod record;

pub use handler::{LogFileHandler, TransactionHandler};
pub use log::{replay, save_log, ErrorPolicy, LogReader, ReplayStats};
pub use manager::{TransactionManager, TxBatch, TxStats};
pub use record::{decode_group, encode_group, CommandType, TxRecord, RECORD_HEADER_SIZE};
