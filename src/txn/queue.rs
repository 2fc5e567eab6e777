//! Region-backed record queues
//!
//! Pending groups are stored inside the region itself as internal keys, so
//! every process attached to a file-backed region shares them and they
//! survive a detach:
//!
//! ```text
//! <prefix>txq/head  ─┐      <prefix>txq/00000000000000000007  (group bytes)
//! <prefix>txq/tail  ─┼───►  <prefix>txq/00000000000000000008
//!                    └───►  ...
//! ```
//!
//! Both queues share the queue lock, which is taken before any bucket lock.

use std::sync::Arc;

use crate::error::{Result, SubKvError};
use crate::lock::LockMode;
use crate::region::{ElementData, Field, RegionCore, INTERNAL_PREFIX};

/// Which end `pop` takes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    Fifo,
    Lifo,
}

/// Named queue of byte blobs stored as internal keys
pub(crate) struct RegionQueue {
    core: Arc<RegionCore>,
    name: &'static str,
    order: QueueOrder,
}

impl RegionQueue {
    pub(crate) fn new(core: Arc<RegionCore>, name: &'static str, order: QueueOrder) -> Self {
        Self { core, name, order }
    }

    fn key(&self, suffix: &str) -> Vec<u8> {
        let mut key = INTERNAL_PREFIX.to_vec();
        key.extend_from_slice(self.name.as_bytes());
        key.push(b'/');
        key.extend_from_slice(suffix.as_bytes());
        key
    }

    fn entry_key(&self, seq: u64) -> Vec<u8> {
        self.key(&format!("{:020}", seq))
    }

    fn counter(&self, suffix: &str) -> Result<u64> {
        match get_raw(&self.core, &self.key(suffix))? {
            None => Ok(0),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    SubKvError::Corruption(format!("queue {} {} counter is malformed", self.name, suffix))
                })?;
                Ok(u64::from_le_bytes(bytes))
            }
        }
    }

    fn set_counter(&self, suffix: &str, value: u64) -> Result<()> {
        put_raw(&self.core, &self.key(suffix), &value.to_le_bytes())
    }

    pub(crate) fn push(&self, blob: &[u8]) -> Result<()> {
        let _queue = self.core.queue_lock()?;
        let tail = self.counter("tail")?;
        put_raw(&self.core, &self.entry_key(tail), blob)?;
        self.set_counter("tail", tail + 1)
    }

    pub(crate) fn pop(&self) -> Result<Option<Vec<u8>>> {
        let _queue = self.core.queue_lock()?;
        let head = self.counter("head")?;
        let tail = self.counter("tail")?;
        if head >= tail {
            return Ok(None);
        }

        let seq = match self.order {
            QueueOrder::Fifo => head,
            QueueOrder::Lifo => tail - 1,
        };
        let key = self.entry_key(seq);
        let blob = get_raw(&self.core, &key)?;
        delete_raw(&self.core, &key)?;

        match self.order {
            QueueOrder::Fifo => self.set_counter("head", head + 1)?,
            QueueOrder::Lifo => self.set_counter("tail", tail - 1)?,
        }

        // A missing entry means a crashed writer; the counters moved past it
        Ok(Some(blob.unwrap_or_default()))
    }

    pub(crate) fn len(&self) -> Result<u64> {
        let _queue = self.core.queue_lock()?;
        Ok(self.counter("tail")?.saturating_sub(self.counter("head")?))
    }
}

fn get_raw(core: &RegionCore, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let session = core.session(key, LockMode::Read)?;
    match core.tree_find(session.bucket, session.hash, key)? {
        Some(element) => Ok(Some(core.read_field(element, Field::Value)?)),
        None => Ok(None),
    }
}

fn put_raw(core: &RegionCore, key: &[u8], value: &[u8]) -> Result<()> {
    let count = {
        let session = core.session(key, LockMode::Write)?;
        match core.tree_find(session.bucket, session.hash, key)? {
            Some(element) => {
                core.replace_field(element, Field::Value, value)?;
                return Ok(());
            }
            None => {
                let element = core.build_element(
                    session.hash,
                    ElementData {
                        key,
                        value,
                        ..Default::default()
                    },
                )?;
                core.link_element(session.bucket, element)?
            }
        }
    };

    if count > core.max_element_count() {
        core.try_grow_mask()?;
    }
    Ok(())
}

fn delete_raw(core: &RegionCore, key: &[u8]) -> Result<()> {
    let session = core.session(key, LockMode::Write)?;
    if let Some(element) = core.tree_find(session.bucket, session.hash, key)? {
        core.destroy_element(session.bucket, element)?;
    }
    Ok(())
}
