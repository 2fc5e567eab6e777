//! Page chains
//!
//! A variable-length field is a doubly-linked chain of fixed-size pages.
//! Every page except the last is full, so byte `n` of a field lives in page
//! `n / payload` at offset `n % payload`.
//!
//! ```text
//! head ──► ┌──────┬──────┬─────┬─────────┐    ┌──────┬──────┬─────┬──────┐
//!          │ prev │ next │ len │ payload │ ─► │ prev │ next │ len │ ...  │
//!          └──────┴──────┴─────┴─────────┘    └──────┴──────┴─────┴──────┘
//! ```

use crate::error::{Result, SubKvError};

use super::layout::*;
use super::RegionCore;

impl RegionCore {
    /// Payload bytes per page
    pub(crate) fn payload(&self) -> u64 {
        self.page_size() - PAGE_HEADER
    }

    pub(crate) fn pages_for(&self, len: u64) -> u64 {
        (len + self.payload() - 1) / self.payload()
    }

    /// Length stored in page `index` of a chain of `total` bytes
    fn page_len(&self, index: u64, total: u64) -> u64 {
        (total - index * self.payload()).min(self.payload())
    }

    /// Store `data` in a fresh chain; returns its head (0 for empty data)
    pub(crate) fn write_chain(&self, data: &[u8]) -> Result<u64> {
        if data.is_empty() {
            return Ok(0);
        }

        let total = data.len() as u64;
        let pages = self.alloc_pages(self.pages_for(total))?;
        let payload = self.payload() as usize;

        for (i, &page) in pages.iter().enumerate() {
            let prev = if i == 0 { 0 } else { pages[i - 1] };
            let next = pages.get(i + 1).copied().unwrap_or(0);
            let len = self.page_len(i as u64, total);
            let start = i * payload;

            self.map().write_u64(page + PG_PREV, prev)?;
            self.map().write_u64(page + PG_NEXT, next)?;
            self.map().write_u64(page + PG_LEN, len)?;
            self.map().write(page + PAGE_HEADER, &data[start..start + len as usize])?;
        }

        Ok(pages[0])
    }

    /// Pages of the chain starting at `head`, in order
    pub(crate) fn chain_pages(&self, head: u64) -> Result<Vec<u64>> {
        let limit = self.hdr(HDR_TOTAL_PAGES)?;
        let mut pages = Vec::new();
        let mut current = head;

        while current != 0 {
            if pages.len() as u64 >= limit {
                return Err(SubKvError::Corruption(format!(
                    "page chain at {} does not terminate",
                    head
                )));
            }
            pages.push(current);
            current = self.map().read_u64(current + PG_NEXT)?;
        }
        Ok(pages)
    }

    /// Whole content of a chain of `len` bytes
    pub(crate) fn read_chain(&self, head: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        let read = self.read_chain_at(head, len, 0, &mut out)?;
        if read as u64 != len {
            return Err(SubKvError::Corruption(format!(
                "chain at {} holds {} of {} bytes",
                head, read, len
            )));
        }
        Ok(out)
    }

    /// Page holding byte `offset` and the position inside its payload
    fn seek_page(&self, head: u64, offset: u64) -> Result<(u64, u64)> {
        let mut page = head;
        for _ in 0..offset / self.payload() {
            if page == 0 {
                break;
            }
            page = self.map().read_u64(page + PG_NEXT)?;
        }
        if page == 0 {
            return Err(SubKvError::Corruption(format!(
                "chain at {} ends before byte {}",
                head, offset
            )));
        }
        Ok((page, offset % self.payload()))
    }

    /// Copy bytes starting at `offset` into `buf`; returns the count copied
    pub(crate) fn read_chain_at(
        &self,
        head: u64,
        len: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }

        let wanted = (buf.len() as u64).min(len - offset) as usize;
        let (mut page, mut within) = self.seek_page(head, offset)?;
        let mut done = 0usize;

        while done < wanted {
            if page == 0 {
                return Err(SubKvError::Corruption(format!(
                    "chain at {} ends {} bytes early",
                    head,
                    wanted - done
                )));
            }
            let page_len = self.map().read_u64(page + PG_LEN)?;
            if within < page_len {
                let take = ((page_len - within) as usize).min(wanted - done);
                self.map()
                    .read_into(page + PAGE_HEADER + within, &mut buf[done..done + take])?;
                done += take;
            }
            within = 0;
            page = self.map().read_u64(page + PG_NEXT)?;
        }

        Ok(done)
    }

    /// Overwrite bytes at `offset`, extending the chain first when needed
    ///
    /// Returns the (possibly new) head and length.
    pub(crate) fn write_chain_at(
        &self,
        head: u64,
        len: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<(u64, u64)> {
        let end = offset + data.len() as u64;
        let (head, len) = if end > len {
            (self.resize_chain(head, len, end)?, end)
        } else {
            (head, len)
        };

        if data.is_empty() {
            return Ok((head, len));
        }

        let (mut page, mut within) = self.seek_page(head, offset)?;
        let mut done = 0usize;
        while done < data.len() {
            if page == 0 {
                return Err(SubKvError::Corruption(format!(
                    "chain at {} ends inside a write",
                    head
                )));
            }
            let take = ((self.payload() - within) as usize).min(data.len() - done);
            self.map()
                .write(page + PAGE_HEADER + within, &data[done..done + take])?;
            done += take;
            within = 0;
            page = self.map().read_u64(page + PG_NEXT)?;
        }

        Ok((head, len))
    }

    /// Change the length of a chain; new bytes read as zero
    ///
    /// Returns the head, which is 0 once the chain is empty.
    pub(crate) fn resize_chain(&self, head: u64, len: u64, new_len: u64) -> Result<u64> {
        if new_len == len {
            return Ok(head);
        }
        if new_len == 0 {
            self.free_chain(head)?;
            return Ok(0);
        }

        let pages = self.chain_pages(head)?;
        let have = pages.len() as u64;
        let need = self.pages_for(new_len);
        let payload = self.payload();
        if have != self.pages_for(len) {
            return Err(SubKvError::Corruption(format!(
                "chain at {} has {} pages for {} bytes",
                head, have, len
            )));
        }

        if new_len < len {
            let last = pages[need as usize - 1];
            let tail = &pages[need as usize..];
            if let (Some(&first), Some(&end)) = (tail.first(), tail.last()) {
                self.map().write_u64(last + PG_NEXT, 0)?;
                self.map().write_u64(first + PG_PREV, 0)?;
                self.release_pages(first, end, tail.len() as u64)?;
            }
            self.map()
                .write_u64(last + PG_LEN, self.page_len(need - 1, new_len))?;
            return Ok(head);
        }

        // Nothing in the chain changes until the new pages are ours
        let fresh = self.alloc_pages(need - have)?;

        // Zero the unused tail of the current last page, it becomes content
        if let Some(&last) = pages.last() {
            let used = self.map().read_u64(last + PG_LEN)?;
            self.map()
                .fill(last + PAGE_HEADER + used, payload - used, 0)?;
            self.map()
                .write_u64(last + PG_LEN, self.page_len(have - 1, new_len))?;
        }
        let mut prev = pages.last().copied().unwrap_or(0);
        for (i, &page) in fresh.iter().enumerate() {
            let index = have + i as u64;
            let next = fresh.get(i + 1).copied().unwrap_or(0);
            self.map().write_u64(page + PG_PREV, prev)?;
            self.map().write_u64(page + PG_NEXT, next)?;
            self.map()
                .write_u64(page + PG_LEN, self.page_len(index, new_len))?;
            self.map().fill(page + PAGE_HEADER, payload, 0)?;
            if prev != 0 {
                self.map().write_u64(prev + PG_NEXT, page)?;
            }
            prev = page;
        }

        Ok(if head == 0 { fresh[0] } else { head })
    }

    /// Return every page of a chain to the free list
    pub(crate) fn free_chain(&self, head: u64) -> Result<u64> {
        let pages = self.chain_pages(head)?;
        if let (Some(&first), Some(&last)) = (pages.first(), pages.last()) {
            self.release_pages(first, last, pages.len() as u64)?;
        }
        Ok(pages.len() as u64)
    }

    /// Sum of page lengths along a chain
    pub(crate) fn chain_byte_len(&self, head: u64) -> Result<u64> {
        let mut total = 0;
        for page in self.chain_pages(head)? {
            total += self.map().read_u64(page + PG_LEN)?;
        }
        Ok(total)
    }
}
