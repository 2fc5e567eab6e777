//! Hash index
//!
//! Two-level index: the Key-Index holds one collision array per mask width,
//! each bucket of a collision array roots an intrusive binary tree of
//! elements ordered by `(hash2, element offset)`.
//!
//! ## Incremental rehash
//! ```text
//!   level n-1   [ b0 ][ b1 ]                 (assigned)
//!                 │  ╲
//!   level n     [ b0 ][ b1 ][ b2 ][ b3 ]     (created unassigned)
//!                 ▲           ▲
//!                 └── first access migrates the matching elements
//!                     out of the parent bucket (recursively)
//! ```
//!
//! Elements always live in the deepest assigned bucket along their path, so
//! a lookup at the current mask finds every key once that bucket has been
//! assigned.

use tracing::{debug, info, warn};

use crate::error::{Result, SubKvError};
use crate::hash::KeyHash;
use crate::lock::{LockGuard, LockMode};

use super::layout::*;
use super::RegionCore;

/// Mask-read lock plus one bucket lock, resolved for a single key
///
/// Field order matters: the bucket lock is released before the mask lock.
pub(crate) struct Session<'a> {
    pub(crate) bucket: u64,
    pub(crate) hash: KeyHash,
    _bucket: LockGuard<'a>,
    _mask: LockGuard<'a>,
}

/// Mask-read lock plus the write locks of two buckets (taken in offset order)
pub(crate) struct PairSession<'a> {
    pub(crate) first: u64,
    pub(crate) first_hash: KeyHash,
    pub(crate) second: u64,
    pub(crate) second_hash: KeyHash,
    _buckets: Vec<LockGuard<'a>>,
    _mask: LockGuard<'a>,
}

impl RegionCore {
    // =========================================================================
    // Sessions
    // =========================================================================

    /// Lock the bucket owning `key` in `mode`, migrating it first if needed
    pub(crate) fn session(&self, key: &[u8], mode: LockMode) -> Result<Session<'_>> {
        let hash = self.hasher().hash(key);
        let mask_guard = self.mask_lock(LockMode::Read)?;
        let bucket = self.resolve_bucket(hash)?;
        let bucket_guard = self.locks().acquire(bucket, mode)?;

        Ok(Session {
            bucket,
            hash,
            _bucket: bucket_guard,
            _mask: mask_guard,
        })
    }

    /// Write-lock the buckets of two keys
    pub(crate) fn session_pair(&self, first: &[u8], second: &[u8]) -> Result<PairSession<'_>> {
        let first_hash = self.hasher().hash(first);
        let second_hash = self.hasher().hash(second);
        let mask_guard = self.mask_lock(LockMode::Read)?;

        // Migrations take their own locks, so both finish before we hold any
        let first_bucket = self.resolve_bucket(first_hash)?;
        let second_bucket = self.resolve_bucket(second_hash)?;

        let lo = first_bucket.min(second_bucket);
        let hi = first_bucket.max(second_bucket);
        let mut buckets = Vec::with_capacity(2);
        buckets.push(self.locks().write(lo)?);
        if hi != lo {
            buckets.push(self.locks().write(hi)?);
        }

        Ok(PairSession {
            first: first_bucket,
            first_hash,
            second: second_bucket,
            second_hash,
            _buckets: buckets,
            _mask: mask_guard,
        })
    }

    /// Bucket for `hash` at the current mask. Caller holds the mask lock.
    pub(crate) fn resolve_bucket(&self, hash: KeyHash) -> Result<u64> {
        let mask = self.hdr(HDR_CUR_MASK)?;
        let bits = mask_bits(mask);
        let index = hash.primary & mask;

        if self.is_read_only() {
            return self.deepest_assigned(bits, index);
        }

        self.ensure_assigned(bits, index)?;
        self.bucket_offset(bits, index)
    }

    /// Read-only attach cannot migrate; follow the parents instead
    fn deepest_assigned(&self, bits: u32, index: u64) -> Result<u64> {
        let min_bits = mask_bits(self.hdr(HDR_MIN_MASK)?);
        let mut level = bits;
        loop {
            let bucket = self.bucket_offset(level, index & mask_of(level))?;
            if level <= min_bits || self.is_assigned(bucket)? {
                return Ok(bucket);
            }
            level -= 1;
        }
    }

    // =========================================================================
    // Levels
    // =========================================================================

    fn level_entry(&self, bits: u32) -> Result<u64> {
        if bits as u64 >= KEY_INDEX_ENTRIES {
            return Err(SubKvError::Corruption(format!("mask width {} out of range", bits)));
        }
        Ok(self.hdr(HDR_KEY_INDEX)? + bits as u64 * KI_ENTRY_SIZE)
    }

    /// Offset of bucket `index` of the level with `bits` mask bits
    pub(crate) fn bucket_offset(&self, bits: u32, index: u64) -> Result<u64> {
        let entry = self.level_entry(bits)?;
        let collision = self.map().read_u64(entry + KI_COLLISION)?;
        let count = self.map().read_u64(entry + KI_BUCKETS)?;
        if collision == 0 || index >= count {
            return Err(SubKvError::Corruption(format!(
                "level {} has no bucket {} ({} buckets)",
                bits, index, count
            )));
        }
        Ok(collision + index * BUCKET_SIZE)
    }

    /// `(bucket_count, assigned_count)` of a level; zero when it does not exist
    pub(crate) fn level_counts(&self, bits: u32) -> Result<(u64, u64)> {
        let entry = self.level_entry(bits)?;
        Ok((
            self.map().read_u64(entry + KI_BUCKETS)?,
            self.map().read_u64(entry + KI_ASSIGNED)?,
        ))
    }

    pub(crate) fn is_assigned(&self, bucket: u64) -> Result<bool> {
        Ok(self.map().read_u64(bucket + BK_FLAGS)? & BUCKET_ASSIGNED != 0)
    }

    /// Allocate the collision array of a level and register it in the Key-Index
    pub(crate) fn create_level(&self, bits: u32, assigned: bool) -> Result<u64> {
        let buckets = 1u64 << bits;
        let (offset, _) = self.append_area(AreaKind::CollisionIndex, buckets * BUCKET_SIZE)?;

        if assigned {
            for i in 0..buckets {
                self.map().write_u64(offset + i * BUCKET_SIZE + BK_FLAGS, BUCKET_ASSIGNED)?;
            }
        }

        let entry = self.level_entry(bits)?;
        self.map().write_u64(entry + KI_COLLISION, offset)?;
        self.map().write_u64(entry + KI_BUCKETS, buckets)?;
        self.map().write_u64(entry + KI_ASSIGNED, if assigned { buckets } else { 0 })?;

        debug!(bits, buckets, offset, "collision level created");
        Ok(offset)
    }

    /// Add one bit to the mask if nobody else holds the mask lock
    ///
    /// Returns `Ok(false)` when the mask is busy or already at its maximum.
    pub(crate) fn try_grow_mask(&self) -> Result<bool> {
        if self.is_read_only() {
            return Ok(false);
        }

        let Some(_guard) = self.locks().try_acquire(HDR_CUR_MASK, LockMode::Write)? else {
            debug!("mask lock busy, growth deferred");
            return Ok(false);
        };
        self.sync_mapping()?;

        let mask = self.hdr(HDR_CUR_MASK)?;
        if mask >= self.hdr(HDR_MAX_MASK)? {
            return Ok(false);
        }

        let bits = mask_bits(mask) + 1;
        self.create_level(bits, false)?;
        self.set_hdr(HDR_CUR_MASK, mask_of(bits))?;

        info!(mask = mask_of(bits), bits, "hash mask grown");
        Ok(true)
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Make sure bucket `index` of level `bits` holds its elements
    fn ensure_assigned(&self, bits: u32, index: u64) -> Result<()> {
        let bucket = self.bucket_offset(bits, index)?;
        if self.is_assigned(bucket)? {
            return Ok(());
        }

        let min_bits = mask_bits(self.hdr(HDR_MIN_MASK)?);
        if bits <= min_bits {
            warn!(bucket, "base level bucket not flagged assigned, repairing");
            let _guard = self.locks().write(bucket)?;
            self.map().write_u64(bucket + BK_FLAGS, BUCKET_ASSIGNED)?;
            return Ok(());
        }

        let parent_bits = bits - 1;
        let parent_index = index & mask_of(parent_bits);
        self.ensure_assigned(parent_bits, parent_index)?;
        let parent = self.bucket_offset(parent_bits, parent_index)?;

        // Shallower level first
        let _parent_guard = self.locks().write(parent)?;
        let _guard = self.locks().write(bucket)?;
        if self.is_assigned(bucket)? {
            return Ok(());
        }

        let mask = mask_of(bits);
        let mut moved = 0u64;
        for element in self.tree_elements(parent)? {
            if self.map().read_u64(element + EL_HASH1)? & mask == index {
                self.tree_remove(parent, element)?;
                self.tree_insert(bucket, element)?;
                moved += 1;
            }
        }

        self.map().write_u64(bucket + BK_FLAGS, BUCKET_ASSIGNED)?;

        let entry = self.level_entry(bits)?;
        let assigned = self.map().fetch_add_u64(entry + KI_ASSIGNED, 1)? + 1;
        if assigned >= self.map().read_u64(entry + KI_BUCKETS)? {
            // Parent level is drained
            self.map().fetch_max_u64(HDR_COLLISION_MASK, mask)?;
            debug!(bits, "collision level fully assigned");
        }

        debug!(bits, index, moved, "bucket migrated");
        Ok(())
    }

    // =========================================================================
    // Bucket Tree
    // =========================================================================

    fn tree_limit(&self) -> Result<u64> {
        Ok(self.hdr(HDR_TOTAL_ELEMENTS)? + 2)
    }

    /// Child link of `node`, treating a self link as empty
    fn child(&self, node: u64, slot: u64) -> Result<u64> {
        let next = self.map().read_u64(node + slot)?;
        if next == node {
            warn!(element = node, "self link in bucket tree ignored");
            return Ok(0);
        }
        Ok(next)
    }

    /// Locate `key` in the tree of `bucket`
    pub(crate) fn tree_find(&self, bucket: u64, hash: KeyHash, key: &[u8]) -> Result<Option<u64>> {
        let limit = self.tree_limit()?;
        let mut stack = vec![self.map().read_u64(bucket + BK_ROOT)?];
        let mut visited = 0u64;

        while let Some(node) = stack.pop() {
            if node == 0 {
                continue;
            }
            visited += 1;
            if visited > limit {
                return Err(SubKvError::Corruption(format!(
                    "tree of bucket {} does not terminate",
                    bucket
                )));
            }

            let h2 = self.map().read_u64(node + EL_HASH2)?;
            if hash.secondary < h2 {
                stack.push(self.child(node, EL_SMALL)?);
            } else if hash.secondary > h2 {
                stack.push(self.child(node, EL_BIG)?);
            } else {
                if self.map().read_u64(node + EL_HASH1)? == hash.primary
                    && self.key_matches(node, key)?
                {
                    return Ok(Some(node));
                }
                // Equal hash2 may sit on either side (ties broken by offset)
                stack.push(self.child(node, EL_SMALL)?);
                stack.push(self.child(node, EL_BIG)?);
            }
        }

        Ok(None)
    }

    /// Link `element` into the tree of `bucket`; returns the new bucket count
    pub(crate) fn tree_insert(&self, bucket: u64, element: u64) -> Result<u64> {
        let map = self.map();
        map.write_u64(element + EL_PARENT, 0)?;
        map.write_u64(element + EL_SMALL, 0)?;
        map.write_u64(element + EL_BIG, 0)?;
        map.write_u64(element + EL_BUCKET, bucket)?;

        let key = (map.read_u64(element + EL_HASH2)?, element);
        let root = map.read_u64(bucket + BK_ROOT)?;

        if root == 0 {
            map.write_u64(bucket + BK_ROOT, element)?;
        } else {
            let limit = self.tree_limit()?;
            let mut current = root;
            let mut steps = 0u64;
            loop {
                steps += 1;
                if steps > limit {
                    return Err(SubKvError::Corruption(format!(
                        "tree of bucket {} does not terminate",
                        bucket
                    )));
                }

                let current_key = (map.read_u64(current + EL_HASH2)?, current);
                let slot = if key < current_key { EL_SMALL } else { EL_BIG };
                let mut next = map.read_u64(current + slot)?;
                if next == current {
                    warn!(element = current, "dropping self link in bucket tree");
                    map.write_u64(current + slot, 0)?;
                    next = 0;
                }

                if next == 0 {
                    map.write_u64(current + slot, element)?;
                    map.write_u64(element + EL_PARENT, current)?;
                    break;
                }
                current = next;
            }
        }

        let count = map.read_u64(bucket + BK_COUNT)? + 1;
        map.write_u64(bucket + BK_COUNT, count)?;
        Ok(count)
    }

    /// Unlink `element` from the tree of `bucket`
    pub(crate) fn tree_remove(&self, bucket: u64, element: u64) -> Result<()> {
        let map = self.map();
        let small = map.read_u64(element + EL_SMALL)?;
        let big = map.read_u64(element + EL_BIG)?;

        if small == 0 {
            self.transplant(bucket, element, big)?;
        } else if big == 0 {
            self.transplant(bucket, element, small)?;
        } else {
            let successor = self.tree_minimum(big)?;
            if map.read_u64(successor + EL_PARENT)? != element {
                let successor_big = map.read_u64(successor + EL_BIG)?;
                self.transplant(bucket, successor, successor_big)?;
                map.write_u64(successor + EL_BIG, big)?;
                map.write_u64(big + EL_PARENT, successor)?;
            }
            self.transplant(bucket, element, successor)?;
            map.write_u64(successor + EL_SMALL, small)?;
            map.write_u64(small + EL_PARENT, successor)?;
        }

        map.write_u64(element + EL_PARENT, 0)?;
        map.write_u64(element + EL_SMALL, 0)?;
        map.write_u64(element + EL_BIG, 0)?;

        let count = map.read_u64(bucket + BK_COUNT)?;
        if count == 0 {
            warn!(bucket, "bucket count underflow, recounting");
            self.recount_bucket(bucket)?;
        } else {
            map.write_u64(bucket + BK_COUNT, count - 1)?;
        }
        Ok(())
    }

    /// Replace the subtree rooted at `old` with the one rooted at `new`
    fn transplant(&self, bucket: u64, old: u64, new: u64) -> Result<()> {
        let map = self.map();
        let parent = map.read_u64(old + EL_PARENT)?;

        if parent == 0 {
            if map.read_u64(bucket + BK_ROOT)? != old {
                return Err(SubKvError::Corruption(format!(
                    "element {} has no parent but is not the root of bucket {}",
                    old, bucket
                )));
            }
            map.write_u64(bucket + BK_ROOT, new)?;
        } else if map.read_u64(parent + EL_SMALL)? == old {
            map.write_u64(parent + EL_SMALL, new)?;
        } else {
            map.write_u64(parent + EL_BIG, new)?;
        }

        if new != 0 {
            map.write_u64(new + EL_PARENT, parent)?;
        }
        Ok(())
    }

    fn tree_minimum(&self, mut node: u64) -> Result<u64> {
        let limit = self.tree_limit()?;
        for _ in 0..limit {
            let small = self.child(node, EL_SMALL)?;
            if small == 0 {
                return Ok(node);
            }
            node = small;
        }
        Err(SubKvError::Corruption(format!("subtree at {} does not terminate", node)))
    }

    /// Every element reachable from the root of `bucket`
    pub(crate) fn tree_elements(&self, bucket: u64) -> Result<Vec<u64>> {
        let limit = self.tree_limit()?;
        let mut out = Vec::new();
        let mut stack = vec![self.map().read_u64(bucket + BK_ROOT)?];

        while let Some(node) = stack.pop() {
            if node == 0 {
                continue;
            }
            if out.len() as u64 >= limit {
                return Err(SubKvError::Corruption(format!(
                    "tree of bucket {} does not terminate",
                    bucket
                )));
            }
            out.push(node);
            stack.push(self.child(node, EL_SMALL)?);
            stack.push(self.child(node, EL_BIG)?);
        }
        Ok(out)
    }

    /// Reset a bucket's element count to the number of reachable elements
    pub(crate) fn recount_bucket(&self, bucket: u64) -> Result<(u64, u64)> {
        let recorded = self.map().read_u64(bucket + BK_COUNT)?;
        let actual = self.tree_elements(bucket)?.len() as u64;
        if recorded != actual {
            warn!(bucket, recorded, actual, "bucket count repaired");
            self.map().write_u64(bucket + BK_COUNT, actual)?;
        }
        Ok((recorded, actual))
    }
}
