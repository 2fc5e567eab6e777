//! Engine context
//!
//! Process-wide state shared by every engine handle that is given the same
//! context: plugin registration tables, the read-only descriptor registry and
//! one lock table per backing file.
//!
//! ## Responsibilities
//! - Register and look up hashers, attribute backends and transaction handlers
//! - Hand out a single [`RecordLock`] per (device, inode) so two handles on the
//!   same file in one process exclude each other
//! - Track descriptors attached read-only

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::attr::{AttributeBackend, StandardAttributes, DEFAULT_BACKEND};
use crate::error::{Result, SubKvError};
use crate::hash::{Crc32Pair, KeyHasher, DEFAULT_HASHER};
use crate::lock::{ReadOnlyRegistry, RecordLock};
use crate::txn::TransactionHandler;

/// Shared registration tables and lock tables
pub struct EngineContext {
    read_only: ReadOnlyRegistry,
    lock_tables: Mutex<HashMap<(u64, u64), Weak<RecordLock>>>,
    hashers: RwLock<HashMap<String, Arc<dyn KeyHasher>>>,
    attribute_backends: RwLock<HashMap<String, Arc<dyn AttributeBackend>>>,
    handlers: RwLock<HashMap<String, Arc<dyn TransactionHandler>>>,
}

impl EngineContext {
    /// Context with the built-in hasher and attribute backend registered
    pub fn new() -> Self {
        let ctx = Self {
            read_only: ReadOnlyRegistry::new(),
            lock_tables: Mutex::new(HashMap::new()),
            hashers: RwLock::new(HashMap::new()),
            attribute_backends: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        };
        ctx.register_hasher(DEFAULT_HASHER, Arc::new(Crc32Pair));
        ctx.register_attribute_backend(DEFAULT_BACKEND, Arc::new(StandardAttributes::new()));
        ctx
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_hasher(&self, name: impl Into<String>, hasher: Arc<dyn KeyHasher>) {
        self.hashers.write().insert(name.into(), hasher);
    }

    pub fn register_attribute_backend(
        &self,
        name: impl Into<String>,
        backend: Arc<dyn AttributeBackend>,
    ) {
        self.attribute_backends.write().insert(name.into(), backend);
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn TransactionHandler>) {
        self.handlers.write().insert(name.into(), handler);
    }

    pub fn hasher(&self, name: &str) -> Result<Arc<dyn KeyHasher>> {
        self.hashers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SubKvError::Config(format!("no hasher registered as {:?}", name)))
    }

    pub fn attribute_backend(&self, name: &str) -> Result<Arc<dyn AttributeBackend>> {
        self.attribute_backends.read().get(name).cloned().ok_or_else(|| {
            SubKvError::Config(format!("no attribute backend registered as {:?}", name))
        })
    }

    pub fn handler(&self, name: &str) -> Result<Arc<dyn TransactionHandler>> {
        self.handlers.read().get(name).cloned().ok_or_else(|| {
            SubKvError::Config(format!("no transaction handler registered as {:?}", name))
        })
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub fn read_only_registry(&self) -> &ReadOnlyRegistry {
        &self.read_only
    }

    /// Lock table for `file`; shared with every other live handle on the same
    /// inode that uses this context
    pub(crate) fn lock_table(&self, file: &File, read_only: bool) -> Result<Arc<RecordLock>> {
        if read_only {
            self.read_only.register(file.as_raw_fd());
            return Ok(Arc::new(RecordLock::bypass()));
        }

        let meta = file.metadata()?;
        let key = (meta.dev(), meta.ino());

        let mut tables = self.lock_tables.lock();
        tables.retain(|_, table| table.strong_count() > 0);
        if let Some(table) = tables.get(&key).and_then(Weak::upgrade) {
            return Ok(table);
        }

        let table = Arc::new(RecordLock::for_file(file.try_clone()?));
        tables.insert(key, Arc::downgrade(&table));
        debug!(dev = key.0, ino = key.1, "lock table created");
        Ok(table)
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}
