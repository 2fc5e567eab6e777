//! Engine Module
//!
//! The public handle on one region.
//!
//! ## Responsibilities
//! - Validate keys and the attach mode before touching the region
//! - Run every mutation under the mask and bucket locks, collect its
//!   transaction records, and dispatch them once the locks are released
//! - Apply attribute semantics (expiry, history, encryption) to reads
//! - Grow the hash mask when a bucket overflows

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::attr::{now_micros, AttrState, AttributeBackend, Attributes, SetOptions};
use crate::config::{RegionConfig, TransactionMode};
use crate::context::EngineContext;
use crate::direct::{AccessMode, DirectAccess};
use crate::error::{Result, SubKvError};
use crate::iter::{KeyEntry, RegionIter, SubkeyIter};
use crate::lock::LockMode;
use crate::region::{
    is_internal_key, ElementData, Field, RegionCore, RegionStats, Session, VerifyReport,
};
use crate::subkeys;
use crate::txn::{
    CommandType, LogFileHandler, TransactionHandler, TransactionManager, TxBatch, TxRecord,
};

/// Version of a key seen by the first phase of a Set
struct Previous {
    element: u64,
    attrs: Vec<u8>,
}

/// Result of moving an element to a new key
enum Moved {
    /// Done; carries the subkey list of the moved element
    Done(Vec<u8>),
    Missing,
    /// `old` is no longer the expected version
    Changed,
}

/// Outcome of moving a key to its history name
enum Archived {
    Kept(Vec<u8>),
    Missing,
    /// Already a history record; removing it deletes it
    AlreadyHistory,
}

/// The main storage engine
///
/// ## Concurrency Model
///
/// - Every operation holds the mask lock shared, so mask growth and
///   compaction (which take it exclusively) never run under a reader
/// - Readers hold their bucket shared, writers exclusively; two-key
///   operations lock both buckets in offset order
/// - Set runs in two critical sections and restarts when the key changed
///   between them, bounded by `set_retry_limit`
/// - Transaction records are dispatched with no region lock held
///
/// Handles on the same file that share an [`EngineContext`] also share its
/// lock table, so they exclude each other like separate processes do.
pub struct Engine {
    /// Dropped first so async workers stop before the region goes away
    txn: TransactionManager,

    core: Arc<RegionCore>,

    attrs: Arc<dyn AttributeBackend>,

    ctx: Arc<EngineContext>,

    config: RegionConfig,
}

impl Engine {
    // =========================================================================
    // Open / Close
    // =========================================================================

    /// Open or create a region with a private context
    pub fn open(config: RegionConfig) -> Result<Self> {
        Self::open_with_context(config, Arc::new(EngineContext::new()))
    }

    /// Open or create a region using the plugins and lock tables of `ctx`
    ///
    /// Steps:
    /// 1. Validate the configuration
    /// 2. Resolve the hasher and attribute backend by name
    /// 3. Create or attach to the region
    /// 4. Start transaction dispatch
    pub fn open_with_context(config: RegionConfig, ctx: Arc<EngineContext>) -> Result<Self> {
        // Step 1: Reject layouts the region cannot represent
        config.validate()?;

        // Step 2: Plugins
        let hasher = ctx.hasher(&config.hasher)?;
        let attrs = ctx.attribute_backend(&config.attribute_backend)?;

        // Step 3: Region
        let core = Arc::new(RegionCore::open(&config, hasher, &ctx)?);

        // Step 4: Transactions
        let txn = Self::start_transactions(&config, &ctx, &core)?;

        info!(
            path = ?config.path,
            read_only = config.read_only,
            transactions = ?txn.mode(),
            "engine opened"
        );

        Ok(Self {
            txn,
            core,
            attrs,
            ctx,
            config,
        })
    }

    fn start_transactions(
        config: &RegionConfig,
        ctx: &EngineContext,
        core: &Arc<RegionCore>,
    ) -> Result<TransactionManager> {
        if config.transaction_mode == TransactionMode::Disabled {
            return Ok(TransactionManager::disabled());
        }
        if config.read_only {
            warn!("read-only attach cannot capture transactions, dispatch disabled");
            return Ok(TransactionManager::disabled());
        }

        let handler: Arc<dyn TransactionHandler> =
            match (&config.transaction_handler, &config.log_path) {
                (Some(name), _) => ctx.handler(name)?,
                (None, Some(path)) => Arc::new(LogFileHandler::open(path)?),
                (None, None) => {
                    return Err(SubKvError::Config(
                        "transactions enabled without a handler or log path".into(),
                    ))
                }
            };

        TransactionManager::start(
            config.transaction_mode,
            handler,
            core.clone(),
            Duration::from_millis(config.queue_poll_ms.max(1)),
        )
    }

    /// Detach gracefully
    ///
    /// Waits for queued transactions (`None` waits indefinitely), stops the
    /// workers and flushes the mapping. Returns false when records were left
    /// in the queue; a file-backed region keeps them for the next attach.
    pub fn close(self, timeout: Option<Duration>) -> Result<bool> {
        let drained = self.txn.shutdown(timeout)?;
        self.core.flush()?;
        Ok(drained)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of a live key, decrypted
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_with(key, true)
    }

    /// Value of `key`; with `check_attr` expired and history keys are absent
    /// and encrypted values are decrypted, without it the stored bytes are
    /// returned as they are
    pub fn get_with(&self, key: &[u8], check_attr: bool) -> Result<Option<Vec<u8>>> {
        match self.fetch(key, check_attr) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_absent() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like [`Engine::get_with`], but says why a key is absent
    pub fn fetch(&self, key: &[u8], check_attr: bool) -> Result<Vec<u8>> {
        let (value, raw_attrs) = self.read_element(key, |element| {
            Ok((
                self.core.read_field(element, Field::Value)?,
                self.core.read_field(element, Field::Attrs)?,
            ))
        })?;

        if !check_attr {
            return Ok(value);
        }
        let attrs = decode_attrs(&raw_attrs)?;
        self.visible_value(attrs.as_ref(), value)
    }

    /// Key is present and live
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let raw_attrs = match self.read_element(key, |element| {
            self.core.read_field(element, Field::Attrs)
        }) {
            Ok(raw) => raw,
            Err(SubKvError::KeyNotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.state_of(decode_attrs(&raw_attrs)?.as_ref()) == AttrState::Live)
    }

    /// Stored length of the value
    pub fn value_len(&self, key: &[u8]) -> Result<u64> {
        self.read_element(key, |element| self.core.field_len(element, Field::Value))
    }

    /// Subkey names of `key`, sorted
    pub fn get_subkeys(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let raw = self.read_element(key, |element| self.core.read_field(element, Field::Subkeys))?;
        subkeys::decode(&raw)
    }

    /// Attribute record of `key` (`None` when it never had one)
    pub fn get_attributes(&self, key: &[u8]) -> Result<Option<Attributes>> {
        let raw = self.read_element(key, |element| self.core.read_field(element, Field::Attrs))?;
        decode_attrs(&raw)
    }

    /// Run `read` on the element of `key` under the bucket read lock
    fn read_element<T>(&self, key: &[u8], read: impl FnOnce(u64) -> Result<T>) -> Result<T> {
        check_key(key)?;
        let session = self.core.session(key, LockMode::Read)?;
        let element = self.find(&session, key)?.ok_or(SubKvError::KeyNotFound)?;
        read(element)
    }

    /// Snapshot of an element; caller holds its bucket lock
    ///
    /// With `live_only`, keys that are not live fail with their absence
    /// error and values come back decrypted.
    pub(crate) fn snapshot(&self, element: u64, live_only: bool) -> Result<KeyEntry> {
        let raw_attributes = self.core.read_field(element, Field::Attrs)?;
        let attributes = decode_attrs(&raw_attributes)?;

        let mut value = self.core.read_field(element, Field::Value)?;
        if live_only {
            value = self.visible_value(attributes.as_ref(), value)?;
        }

        Ok(KeyEntry {
            key: self.core.read_field(element, Field::Key)?,
            value,
            subkeys: subkeys::decode(&self.core.read_field(element, Field::Subkeys)?)?,
            attributes,
            raw_attributes,
        })
    }

    /// Snapshot of a live key
    pub(crate) fn entry(&self, key: &[u8]) -> Result<KeyEntry> {
        self.read_element(key, |element| self.snapshot(element, true))
    }

    fn state_of(&self, attrs: Option<&Attributes>) -> AttrState {
        match attrs {
            Some(attrs) => self.attrs.state(attrs, now_micros()),
            None => AttrState::Live,
        }
    }

    fn visible_value(&self, attrs: Option<&Attributes>, value: Vec<u8>) -> Result<Vec<u8>> {
        let Some(attrs) = attrs else {
            return Ok(value);
        };
        match self.attrs.state(attrs, now_micros()) {
            AttrState::Live => self.attrs.decrypt(attrs, &value),
            AttrState::Expired => Err(SubKvError::Expired),
            AttrState::History => Err(SubKvError::HistoryMarked),
        }
    }

    fn find(&self, session: &Session<'_>, key: &[u8]) -> Result<Option<u64>> {
        self.core.tree_find(session.bucket, session.hash, key)
    }

    // =========================================================================
    // Set
    // =========================================================================

    /// Store `value` under `key` with default attributes, keeping its subkeys
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_with(key, value, None, &SetOptions::default())
    }

    /// Store `value` under `key`
    ///
    /// `subkeys: None` keeps the subkeys of the version being replaced. The
    /// key keeps its unique id across replacements.
    pub fn set_with(
        &self,
        key: &[u8],
        value: &[u8],
        subkeys: Option<&[&[u8]]>,
        options: &SetOptions,
    ) -> Result<()> {
        check_key(key)?;
        let subkeys = subkeys.map(|names| subkeys::encode(names.iter().copied()));
        self.commit(|batch| self.set_inner(key, value, subkeys.as_deref(), options, batch))
    }

    /// Store value, subkey list and attribute bytes exactly as given
    pub fn set_raw(&self, key: &[u8], value: &[u8], subkeys: &[u8], attrs: &[u8]) -> Result<()> {
        check_key(key)?;
        subkeys::decode(subkeys)?;
        self.commit(|batch| {
            self.store_raw(
                ElementData {
                    key,
                    value,
                    subkeys,
                    attrs,
                },
                batch,
            )
        })
    }

    /// Two critical sections around the unlocked attribute/encryption work
    ///
    /// Steps:
    /// 1. Under the bucket read lock, capture the current version
    /// 2. Unlocked, build the new attributes and encrypt
    /// 3. Under the bucket write lock, publish if the key still matches the
    ///    captured version; otherwise back off and start over
    fn set_inner(
        &self,
        key: &[u8],
        value: &[u8],
        subkeys: Option<&[u8]>,
        options: &SetOptions,
        batch: &mut TxBatch,
    ) -> Result<()> {
        let limit = self.config.set_retry_limit.max(1);

        for attempt in 0..limit {
            // Step 1: Capture
            let previous = {
                let session = self.core.session(key, LockMode::Read)?;
                match self.find(&session, key)? {
                    Some(element) => Some(Previous {
                        element,
                        attrs: self.core.read_field(element, Field::Attrs)?,
                    }),
                    None => None,
                }
            };

            // Step 2: Attributes and encryption
            let prev_attrs = match &previous {
                Some(prev) => decode_attrs(&prev.attrs)?,
                None => None,
            };
            let unique_id = match prev_attrs.as_ref().map(|a| a.unique_id) {
                Some(id) if id != 0 => id,
                _ => self.core.next_unique_id()?,
            };
            let attrs = self
                .attrs
                .build(prev_attrs.as_ref(), options, unique_id, now_micros())?;
            let stored = self.attrs.encrypt(&attrs, value)?;
            let attr_bytes = attrs.encode()?;

            // Step 3: Publish
            let mut subkey_bytes = subkeys.map(<[u8]>::to_vec).unwrap_or_default();
            let linked = {
                let session = self.core.session(key, LockMode::Write)?;
                let current = self.find(&session, key)?;
                if self.unchanged(previous.as_ref(), current)? {
                    // Subkey edits made since step 1 are carried over
                    if let (None, Some(old)) = (subkeys, current) {
                        subkey_bytes = self.core.read_field(old, Field::Subkeys)?;
                    }
                    // Built first: an allocation failure leaves the old version
                    let element = self.core.build_element(
                        session.hash,
                        ElementData {
                            key,
                            value: &stored,
                            subkeys: &subkey_bytes,
                            attrs: &attr_bytes,
                        },
                    )?;
                    if let Some(old) = current {
                        self.core.destroy_element(session.bucket, old)?;
                    }
                    let count = self.core.link_element(session.bucket, element)?;
                    self.core.touch()?;
                    Some(count)
                } else {
                    None
                }
            };

            if let Some(count) = linked {
                if previous.is_some() {
                    batch.push(TxRecord::delete(key, false));
                }
                batch.push(TxRecord::set_all(key, &stored, &subkey_bytes, &attr_bytes));
                self.maybe_grow(count)?;
                return Ok(());
            }

            debug!(attempt, "key changed between set phases, retrying");
            backoff(attempt);
        }

        Err(SubKvError::LockFailure(format!(
            "set gave up after {} attempts on a contended key",
            limit
        )))
    }

    fn unchanged(&self, previous: Option<&Previous>, current: Option<u64>) -> Result<bool> {
        Ok(match (previous, current) {
            (None, None) => true,
            (Some(prev), Some(element)) => {
                element == prev.element
                    && self.core.read_field(element, Field::Attrs)? == prev.attrs
            }
            _ => false,
        })
    }

    /// Replace `data.key` with a verbatim element in one critical section
    fn store_raw(&self, data: ElementData<'_>, batch: &mut TxBatch) -> Result<()> {
        let (count, replaced) = {
            let session = self.core.session(data.key, LockMode::Write)?;
            let current = self.find(&session, data.key)?;
            let element = self.core.build_element(session.hash, data)?;
            if let Some(old) = current {
                self.core.destroy_element(session.bucket, old)?;
            }
            let count = self.core.link_element(session.bucket, element)?;
            self.core.touch()?;
            (count, current.is_some())
        };

        if replaced {
            batch.push(TxRecord::delete(data.key, false));
        }
        batch.push(TxRecord::set_all(data.key, data.value, data.subkeys, data.attrs));
        self.maybe_grow(count)
    }

    // =========================================================================
    // Remove / Rename
    // =========================================================================

    /// Remove `key`; returns false if it did not exist
    ///
    /// In history mode a live key is renamed to `key\0<unique id>` and
    /// marked as history; removing a history record deletes it. With
    /// `with_subkeys` the subkeys are removed too, recursively.
    pub fn remove(&self, key: &[u8], with_subkeys: bool) -> Result<bool> {
        check_key(key)?;
        self.commit(|batch| self.remove_inner(key, with_subkeys, self.config.history, batch))
    }

    fn remove_inner(
        &self,
        key: &[u8],
        cascade: bool,
        history: bool,
        batch: &mut TxBatch,
    ) -> Result<bool> {
        let Some(children) = self.remove_one(key, history, batch)? else {
            return Ok(false);
        };
        if !cascade {
            return Ok(true);
        }

        let mut seen = HashSet::new();
        seen.insert(key.to_vec());
        let mut pending = subkeys::decode(&children)?;

        while let Some(next) = pending.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if check_key(&next).is_err() {
                warn!(subkey = %String::from_utf8_lossy(&next), "invalid subkey name skipped");
                continue;
            }
            if let Some(children) = self.remove_one(&next, history, batch)? {
                pending.extend(subkeys::decode(&children)?);
            }
        }
        Ok(true)
    }

    /// Remove one key; returns its encoded subkey list if it existed
    fn remove_one(&self, key: &[u8], history: bool, batch: &mut TxBatch) -> Result<Option<Vec<u8>>> {
        if history {
            match self.archive(key, batch)? {
                Archived::Kept(children) => return Ok(Some(children)),
                Archived::Missing => return Ok(None),
                Archived::AlreadyHistory => {}
            }
        }

        let children = {
            let session = self.core.session(key, LockMode::Write)?;
            let Some(element) = self.find(&session, key)? else {
                return Ok(None);
            };
            let children = self.core.read_field(element, Field::Subkeys)?;
            self.core.destroy_element(session.bucket, element)?;
            self.core.touch()?;
            children
        };
        batch.push(TxRecord::delete(key, false));
        Ok(Some(children))
    }

    /// Move a live key to its history name
    ///
    /// The move only commits if the attributes it was prepared from are
    /// still in place; otherwise it is prepared again.
    fn archive(&self, key: &[u8], batch: &mut TxBatch) -> Result<Archived> {
        let limit = self.config.set_retry_limit.max(1);

        for attempt in 0..limit {
            let seen = self.read_element(key, |element| {
                Ok((element, self.core.read_field(element, Field::Attrs)?))
            });
            let (element, raw_attrs) = match seen {
                Ok(found) => found,
                Err(SubKvError::KeyNotFound) => return Ok(Archived::Missing),
                Err(e) => return Err(e),
            };

            let attrs = decode_attrs(&raw_attrs)?;
            if attrs.as_ref().is_some_and(|a| a.history) {
                return Ok(Archived::AlreadyHistory);
            }
            let unique_id = match attrs.as_ref().map(|a| a.unique_id) {
                Some(id) if id != 0 => id,
                _ => self.core.next_unique_id()?,
            };
            let mut base = attrs.unwrap_or_default();
            base.unique_id = unique_id;
            let marked = self.attrs.mark_history(&base, now_micros()).encode()?;

            let target = history_key(key, unique_id);
            match self.move_element(key, &target, Some(&marked), Some((element, &raw_attrs)))? {
                Moved::Done(children) => {
                    batch.push(TxRecord::rename(key, &target));
                    batch.push(TxRecord::replace_attrs(&target, &marked));
                    debug!(key = %String::from_utf8_lossy(key), unique_id, "key kept as history");
                    return Ok(Archived::Kept(children));
                }
                Moved::Missing => return Ok(Archived::Missing),
                Moved::Changed => {
                    debug!(attempt, "key changed before it was archived, retrying");
                    backoff(attempt);
                }
            }
        }

        Err(SubKvError::LockFailure(format!(
            "history remove gave up after {} attempts on a contended key",
            limit
        )))
    }

    /// Rename `old` to `new`, replacing an existing `new`
    pub fn rename(&self, old: &[u8], new: &[u8]) -> Result<()> {
        check_key(old)?;
        check_key(new)?;
        self.commit(|batch| self.rename_inner(old, new, batch))
    }

    fn rename_inner(&self, old: &[u8], new: &[u8], batch: &mut TxBatch) -> Result<()> {
        if old == new {
            return self.read_element(old, |_| Ok(()));
        }
        if let Moved::Missing = self.move_element(old, new, None, None)? {
            return Err(SubKvError::KeyNotFound);
        }
        batch.push(TxRecord::rename(old, new));
        Ok(())
    }

    /// Move the value, subkey and attribute chains of `old` to a new element
    /// keyed `new`; `old` and `new` must differ
    ///
    /// With `expected`, nothing moves unless `old` is still that element
    /// carrying exactly those attribute bytes.
    fn move_element(
        &self,
        old: &[u8],
        new: &[u8],
        attrs: Option<&[u8]>,
        expected: Option<(u64, &[u8])>,
    ) -> Result<Moved> {
        let (count, children) = {
            let pair = self.core.session_pair(old, new)?;
            let Some(element) = self.core.tree_find(pair.first, pair.first_hash, old)? else {
                return Ok(Moved::Missing);
            };
            if let Some((seen, seen_attrs)) = expected {
                if element != seen || self.core.read_field(element, Field::Attrs)? != seen_attrs {
                    return Ok(Moved::Changed);
                }
            }
            let children = self.core.read_field(element, Field::Subkeys)?;
            let existing = self.core.tree_find(pair.second, pair.second_hash, new)?;

            let moved = self.core.build_element(
                pair.second_hash,
                ElementData {
                    key: new,
                    ..Default::default()
                },
            )?;
            if let Some(target) = existing {
                self.core.destroy_element(pair.second, target)?;
            }

            for field in [Field::Value, Field::Subkeys, Field::Attrs] {
                let (head, len) = self.core.chain_of(element, field)?;
                self.core.set_chain_of(moved, field, head, len)?;
                self.core.set_chain_of(element, field, 0, 0)?;
            }
            if let Some(bytes) = attrs {
                self.core.replace_field(moved, Field::Attrs, bytes)?;
            }

            // Frees the old key chain and slot only
            self.core.destroy_element(pair.first, element)?;
            let count = self.core.link_element(pair.second, moved)?;
            self.core.touch()?;
            (count, children)
        };

        self.maybe_grow(count)?;
        Ok(Moved::Done(children))
    }

    // =========================================================================
    // Field Updates
    // =========================================================================

    /// Replace the value, creating the key if needed. Encrypted keys stay
    /// encrypted.
    pub fn replace_value(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        self.commit(|batch| {
            let (stored, _) = self.with_element(key, true, |element| {
                let attrs = decode_attrs(&self.core.read_field(element, Field::Attrs)?)?;
                let stored = match attrs {
                    Some(attrs) => self.attrs.encrypt(&attrs, value)?,
                    None => value.to_vec(),
                };
                self.core.replace_field(element, Field::Value, &stored)?;
                Ok(stored)
            })?;
            batch.push(TxRecord::replace_value(key, &stored));
            Ok(())
        })
    }

    /// Replace the subkey list, creating the key if needed
    pub fn replace_subkeys(&self, key: &[u8], names: &[&[u8]]) -> Result<()> {
        check_key(key)?;
        let encoded = subkeys::encode(names.iter().copied());
        self.commit(|batch| {
            self.with_element(key, true, |element| {
                self.core.replace_field(element, Field::Subkeys, &encoded)
            })?;
            batch.push(TxRecord::replace_subkeys(key, &encoded));
            Ok(())
        })
    }

    /// Replace the attribute record, creating the key if needed
    pub fn replace_attributes(&self, key: &[u8], attributes: &Attributes) -> Result<()> {
        check_key(key)?;
        let encoded = attributes.encode()?;
        self.commit(|batch| {
            self.with_element(key, true, |element| {
                self.core.replace_field(element, Field::Attrs, &encoded)
            })?;
            batch.push(TxRecord::replace_attrs(key, &encoded));
            Ok(())
        })
    }

    /// Add `child` to the subkeys of an existing `parent`; false if present
    pub fn add_subkey(&self, parent: &[u8], child: &[u8]) -> Result<bool> {
        check_key(parent)?;
        check_key(child)?;
        self.update_subkeys(parent, |current| {
            if subkeys::decode(current)?.iter().any(|name| name.as_slice() == child) {
                return Ok(None);
            }
            subkeys::insert(current, child).map(Some)
        })
    }

    /// Remove `child` from the subkeys of `parent`; false if absent
    pub fn remove_subkey(&self, parent: &[u8], child: &[u8]) -> Result<bool> {
        check_key(parent)?;
        self.update_subkeys(parent, |current| {
            let (updated, removed) = subkeys::remove(current, child)?;
            Ok(removed.then_some(updated))
        })
    }

    /// Read-modify-write of a subkey list under the bucket write lock
    fn update_subkeys(
        &self,
        parent: &[u8],
        update: impl FnOnce(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<bool> {
        self.commit(|batch| {
            let (updated, _) = self.with_element(parent, false, |element| {
                let current = self.core.read_field(element, Field::Subkeys)?;
                let updated = update(&current)?;
                if let Some(bytes) = &updated {
                    self.core.replace_field(element, Field::Subkeys, bytes)?;
                }
                Ok(updated)
            })?;

            match updated {
                Some(bytes) => {
                    batch.push(TxRecord::replace_subkeys(parent, &bytes));
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Shrink or zero-extend the stored value to `len` bytes
    pub fn truncate(&self, key: &[u8], len: u64) -> Result<()> {
        check_key(key)?;
        self.commit(|batch| {
            self.truncate_inner(key, len)?;
            batch.push(TxRecord::truncate(key, len));
            Ok(())
        })
    }

    fn truncate_inner(&self, key: &[u8], len: u64) -> Result<()> {
        self.with_element(key, false, |element| self.resize_value(element, len))?;
        Ok(())
    }

    /// Resize the value chain of an element; caller holds its bucket lock
    pub(crate) fn resize_value(&self, element: u64, len: u64) -> Result<()> {
        let (head, current) = self.core.chain_of(element, Field::Value)?;
        let head = self.core.resize_chain(head, current, len)?;
        self.core.set_chain_of(element, Field::Value, head, len)
    }

    /// Write `data` into the value at `offset`; caller holds the bucket lock
    pub(crate) fn write_value_at(&self, element: u64, offset: u64, data: &[u8]) -> Result<()> {
        let (head, len) = self.core.chain_of(element, Field::Value)?;
        let (head, len) = self.core.write_chain_at(head, len, offset, data)?;
        self.core.set_chain_of(element, Field::Value, head, len)
    }

    /// Run `apply` on the element of `key` under the bucket write lock
    ///
    /// With `create`, a missing key gets an empty element that is linked only
    /// if `apply` succeeds. The flag in the result tells whether the key was
    /// created.
    pub(crate) fn with_element<T>(
        &self,
        key: &[u8],
        create: bool,
        apply: impl FnOnce(u64) -> Result<T>,
    ) -> Result<(T, bool)> {
        self.check_writable()?;

        let (out, count) = {
            let session = self.core.session(key, LockMode::Write)?;
            let existing = self.find(&session, key)?;
            let element = match existing {
                Some(element) => element,
                None if create => self.core.build_element(
                    session.hash,
                    ElementData {
                        key,
                        ..Default::default()
                    },
                )?,
                None => return Err(SubKvError::KeyNotFound),
            };

            let out = match apply(element) {
                Ok(out) => out,
                Err(e) => {
                    if existing.is_none() {
                        self.core.discard_element(element)?;
                    }
                    return Err(e);
                }
            };

            let count = match existing {
                Some(_) => None,
                None => Some(self.core.link_element(session.bucket, element)?),
            };
            self.core.touch()?;
            (out, count)
        };

        let created = count.is_some();
        if let Some(count) = count {
            self.maybe_grow(count)?;
        }
        Ok((out, created))
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Random access to the stored value bytes of `key`
    ///
    /// Write mode creates the key if needed. The cursor bypasses encryption.
    pub fn direct(&self, key: &[u8], mode: AccessMode) -> Result<DirectAccess<'_>> {
        check_key(key)?;
        DirectAccess::open(self, key, mode)
    }

    /// Live keys in physical order, values decrypted
    pub fn iter(&self) -> RegionIter<'_> {
        RegionIter::new(self, true)
    }

    /// Every stored key (expired and history records included) with the
    /// bytes as stored
    pub fn iter_all(&self) -> RegionIter<'_> {
        RegionIter::new(self, false)
    }

    /// Live subkeys of `key`
    pub fn iter_subkeys(&self, key: &[u8]) -> Result<SubkeyIter<'_>> {
        let names = self.get_subkeys(key)?;
        Ok(SubkeyIter::new(self, names))
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn transactions(&self) -> &TransactionManager {
        &self.txn
    }

    /// Re-apply failed transaction groups
    pub fn retry_failed(&self) -> Result<usize> {
        self.txn.retry_failed()
    }

    /// Apply a captured record without dispatching it again
    pub fn apply_record(&self, record: &TxRecord) -> Result<()> {
        self.check_writable()?;
        check_key(&record.key)?;
        let key = record.key.as_slice();
        let mut discarded = TxBatch::new();

        match record.command {
            CommandType::SetAll => {
                subkeys::decode(&record.subkeys)?;
                self.store_raw(
                    ElementData {
                        key,
                        value: &record.value,
                        subkeys: &record.subkeys,
                        attrs: &record.attrs,
                    },
                    &mut discarded,
                )
            }
            CommandType::ReplaceValue => self.replace_raw(key, Field::Value, &record.value),
            CommandType::ReplaceSubkeys => {
                subkeys::decode(&record.subkeys)?;
                self.replace_raw(key, Field::Subkeys, &record.subkeys)
            }
            CommandType::ReplaceAttrs => self.replace_raw(key, Field::Attrs, &record.attrs),
            CommandType::Delete => self
                .remove_inner(key, record.with_subkeys(), false, &mut discarded)
                .map(drop),
            CommandType::OverwriteAt => {
                let offset = record.extra_u64()?;
                self.with_element(key, true, |element| {
                    self.write_value_at(element, offset, &record.value)
                })?;
                Ok(())
            }
            CommandType::Rename => {
                check_key(record.new_key())?;
                self.rename_inner(key, record.new_key(), &mut discarded)
            }
            CommandType::Truncate => self.truncate_inner(key, record.extra_u64()?),
        }
    }

    fn replace_raw(&self, key: &[u8], field: Field, bytes: &[u8]) -> Result<()> {
        self.with_element(key, true, |element| self.core.replace_field(element, field, bytes))?;
        Ok(())
    }

    /// Run a mutation and dispatch its records once it released its locks
    fn commit<T>(&self, op: impl FnOnce(&mut TxBatch) -> Result<T>) -> Result<T> {
        self.check_writable()?;
        let mut batch = TxBatch::new();
        let out = op(&mut batch)?;
        self.txn.dispatch(batch)?;
        Ok(out)
    }

    pub(crate) fn dispatch(&self, batch: TxBatch) -> Result<()> {
        self.txn.dispatch(batch)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn stats(&self) -> Result<RegionStats> {
        self.core.stats()
    }

    /// Release the last area if its content fits elsewhere
    pub fn compact(&self) -> Result<bool> {
        self.check_writable()?;
        self.core.compact()
    }

    /// Structural check; bucket counts are repaired unless read-only
    pub fn verify(&self) -> Result<VerifyReport> {
        self.core.verify()
    }

    /// Flush the mapping to the backing file
    pub fn sync(&self) -> Result<()> {
        self.core.flush()
    }

    fn maybe_grow(&self, count: u64) -> Result<()> {
        if count > self.core.max_element_count() && self.core.try_grow_mask()? {
            debug!(count, "bucket overflow grew the mask");
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.core.is_read_only() {
            return Err(SubKvError::ReadOnly);
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn core(&self) -> &RegionCore {
        &self.core
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.core.is_read_only() {
            if let Some(fd) = self.core.raw_fd() {
                self.ctx.read_only_registry().unregister(fd);
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.config.path)
            .field("read_only", &self.core.is_read_only())
            .field("transactions", &self.txn.mode())
            .finish()
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(SubKvError::InvalidArgument("key must not be empty".into()));
    }
    if is_internal_key(key) {
        return Err(SubKvError::InvalidArgument(
            "key starts with the reserved internal prefix".into(),
        ));
    }
    Ok(())
}

fn decode_attrs(raw: &[u8]) -> Result<Option<Attributes>> {
    if raw.is_empty() {
        return Ok(None);
    }
    Attributes::decode(raw).map(Some)
}

/// Name a removed key keeps in history mode
fn history_key(key: &[u8], unique_id: u64) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out.extend_from_slice(unique_id.to_string().as_bytes());
    out
}

/// Yield for the first retries, then sleep up to 1 ms
fn backoff(attempt: u32) {
    if attempt < 4 {
        thread::yield_now();
    } else {
        let micros = (1u64 << attempt.min(10)).min(1_000);
        thread::sleep(Duration::from_micros(micros));
    }
}
