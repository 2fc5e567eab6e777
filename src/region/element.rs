//! Element lifecycle
//!
//! An element is built detached (slot + chains), linked into a bucket tree
//! when the caller is ready to publish it, and discarded together with its
//! chains. Splitting build from link lets a writer allocate everything before
//! touching the previous version of a key, so a failed allocation leaves the
//! old value in place.

use crate::error::Result;
use crate::hash::KeyHash;

use super::layout::*;
use super::RegionCore;

/// Field payloads of a new element
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ElementData<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub subkeys: &'a [u8],
    pub attrs: &'a [u8],
}

impl RegionCore {
    pub(crate) fn chain_of(&self, element: u64, field: Field) -> Result<(u64, u64)> {
        Ok((
            self.map().read_u64(field.head_offset(element))?,
            self.map().read_u64(field.len_offset(element))?,
        ))
    }

    pub(crate) fn set_chain_of(&self, element: u64, field: Field, head: u64, len: u64) -> Result<()> {
        self.map().write_u64(field.head_offset(element), head)?;
        self.map().write_u64(field.len_offset(element), len)
    }

    pub(crate) fn field_len(&self, element: u64, field: Field) -> Result<u64> {
        self.map().read_u64(field.len_offset(element))
    }

    pub(crate) fn read_field(&self, element: u64, field: Field) -> Result<Vec<u8>> {
        let (head, len) = self.chain_of(element, field)?;
        self.read_chain(head, len)
    }

    /// Swap one field for `data`; the old chain is freed once the new one exists
    pub(crate) fn replace_field(&self, element: u64, field: Field, data: &[u8]) -> Result<()> {
        let (old_head, _) = self.chain_of(element, field)?;
        let head = self.write_chain(data)?;
        self.set_chain_of(element, field, head, data.len() as u64)?;
        self.free_chain(old_head)?;
        Ok(())
    }

    pub(crate) fn is_live(&self, element: u64) -> Result<bool> {
        Ok(self.map().read_u64(element + EL_FLAGS)? & ELEMENT_LIVE != 0)
    }

    pub(crate) fn element_bucket(&self, element: u64) -> Result<u64> {
        self.map().read_u64(element + EL_BUCKET)
    }

    pub(crate) fn key_matches(&self, element: u64, key: &[u8]) -> Result<bool> {
        let (head, len) = self.chain_of(element, Field::Key)?;
        if len != key.len() as u64 {
            return Ok(false);
        }
        Ok(self.read_chain(head, len)? == key)
    }

    /// Allocate a detached element holding `data`
    pub(crate) fn build_element(&self, hash: KeyHash, data: ElementData<'_>) -> Result<u64> {
        let element = self.alloc_element()?;
        self.map().write_u64(element + EL_HASH1, hash.primary)?;
        self.map().write_u64(element + EL_HASH2, hash.secondary)?;

        let fields = [
            (Field::Key, data.key),
            (Field::Value, data.value),
            (Field::Subkeys, data.subkeys),
            (Field::Attrs, data.attrs),
        ];
        for (field, bytes) in fields {
            match self.write_chain(bytes) {
                Ok(head) => self.set_chain_of(element, field, head, bytes.len() as u64)?,
                Err(e) => {
                    self.discard_element(element)?;
                    return Err(e);
                }
            }
        }

        Ok(element)
    }

    /// Publish a built element in `bucket`; returns the bucket population
    pub(crate) fn link_element(&self, bucket: u64, element: u64) -> Result<u64> {
        let count = self.tree_insert(bucket, element)?;
        let flags = self.map().read_u64(element + EL_FLAGS)?;
        self.map().write_u64(element + EL_FLAGS, flags | ELEMENT_LIVE)?;
        self.map().fetch_add_u64(HDR_LIVE_COUNT, 1)?;
        Ok(count)
    }

    /// Take an element out of its bucket without freeing anything
    pub(crate) fn unlink_element(&self, bucket: u64, element: u64) -> Result<()> {
        self.tree_remove(bucket, element)?;
        let flags = self.map().read_u64(element + EL_FLAGS)?;
        self.map().write_u64(element + EL_FLAGS, flags & !ELEMENT_LIVE)?;
        self.map().write_u64(element + EL_BUCKET, 0)?;
        self.map().fetch_sub_u64(HDR_LIVE_COUNT, 1)?;
        Ok(())
    }

    /// Free the chains of a detached element and the slot itself
    pub(crate) fn discard_element(&self, element: u64) -> Result<()> {
        for field in Field::ALL {
            let (head, _) = self.chain_of(element, field)?;
            self.free_chain(head)?;
            self.set_chain_of(element, field, 0, 0)?;
        }
        self.free_element(element)
    }

    pub(crate) fn destroy_element(&self, bucket: u64, element: u64) -> Result<()> {
        self.unlink_element(bucket, element)?;
        self.discard_element(element)
    }
}
