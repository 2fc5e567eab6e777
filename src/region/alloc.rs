//! Element and page allocators
//!
//! Both are singly-linked free lists anchored in the header. Pops and pushes
//! are O(1) under the free-list lock; an empty list triggers region growth
//! (under the unassigned-area lock) and a retry.

use tracing::debug;

use crate::error::{Result, SubKvError};

use super::layout::*;
use super::RegionCore;

/// Growth attempts before an allocation gives up
const MAX_ALLOC_ATTEMPTS: u32 = 8;

/// Smallest number of slots one growth step adds
const MIN_GROW_SLOTS: u64 = 64;

impl RegionCore {
    // =========================================================================
    // Elements
    // =========================================================================

    /// Pop a zeroed element slot
    pub(crate) fn alloc_element(&self) -> Result<u64> {
        for _ in 0..MAX_ALLOC_ATTEMPTS {
            {
                let _guard = self.locks().write(HDR_FREE_ELEMENTS)?;
                let head = self.hdr(HDR_FREE_ELEMENTS)?;
                if head != 0 {
                    let next = self.map().read_u64(head + EL_NEXT_FREE)?;
                    let count = self.hdr(HDR_FREE_ELEMENT_COUNT)?;
                    self.set_hdr(HDR_FREE_ELEMENTS, next)?;
                    self.set_hdr(HDR_FREE_ELEMENT_COUNT, count.saturating_sub(1))?;
                    self.map().fill(head, ELEMENT_SIZE, 0)?;
                    return Ok(head);
                }
            }
            self.grow_elements()?;
        }

        Err(SubKvError::AllocationFailure(
            "element free list stayed empty after growth".into(),
        ))
    }

    /// Zero an element slot and push it onto the free list
    pub(crate) fn free_element(&self, element: u64) -> Result<()> {
        self.map().fill(element, ELEMENT_SIZE, 0)?;

        let _guard = self.locks().write(HDR_FREE_ELEMENTS)?;
        let head = self.hdr(HDR_FREE_ELEMENTS)?;
        self.map().write_u64(element + EL_NEXT_FREE, head)?;
        self.set_hdr(HDR_FREE_ELEMENTS, element)?;
        self.set_hdr(HDR_FREE_ELEMENT_COUNT, self.hdr(HDR_FREE_ELEMENT_COUNT)? + 1)?;
        Ok(())
    }

    fn grow_elements(&self) -> Result<()> {
        let _guard = self.locks().write(HDR_UNASSIGNED)?;
        // Someone else may have grown the list while we waited
        if self.hdr(HDR_FREE_ELEMENT_COUNT)? > 0 {
            return Ok(());
        }

        let slots = self.growth_size(self.hdr(HDR_LIVE_COUNT)?, 1);
        self.add_elements(slots)
    }

    /// Append an element area of at least `slots` elements to the free list
    pub(crate) fn add_elements(&self, slots: u64) -> Result<()> {
        let _guard = self.locks().write(HDR_UNASSIGNED)?;
        let slots = slots.max(1);
        let (offset, length) = self.append_area(AreaKind::ElementList, slots * ELEMENT_SIZE)?;
        let slots = length / ELEMENT_SIZE;

        for i in 0..slots - 1 {
            let element = offset + i * ELEMENT_SIZE;
            self.map()
                .write_u64(element + EL_NEXT_FREE, element + ELEMENT_SIZE)?;
        }
        let last = offset + (slots - 1) * ELEMENT_SIZE;

        let _free = self.locks().write(HDR_FREE_ELEMENTS)?;
        self.map()
            .write_u64(last + EL_NEXT_FREE, self.hdr(HDR_FREE_ELEMENTS)?)?;
        self.set_hdr(HDR_FREE_ELEMENTS, offset)?;
        self.set_hdr(HDR_FREE_ELEMENT_COUNT, self.hdr(HDR_FREE_ELEMENT_COUNT)? + slots)?;
        self.set_hdr(HDR_TOTAL_ELEMENTS, self.hdr(HDR_TOTAL_ELEMENTS)? + slots)?;

        debug!(offset, slots, "element area added");
        Ok(())
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Pop `count` pages (links and lengths are left for the caller to set)
    pub(crate) fn alloc_pages(&self, count: u64) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        for _ in 0..MAX_ALLOC_ATTEMPTS {
            {
                let _guard = self.locks().write(HDR_FREE_PAGES)?;
                let available = self.hdr(HDR_FREE_PAGE_COUNT)?;
                if available >= count {
                    let mut pages = Vec::with_capacity(count as usize);
                    let mut current = self.hdr(HDR_FREE_PAGES)?;
                    for _ in 0..count {
                        if current == 0 {
                            return Err(SubKvError::Corruption(format!(
                                "free page list shorter than its count {}",
                                available
                            )));
                        }
                        pages.push(current);
                        current = self.map().read_u64(current + PG_NEXT)?;
                    }
                    self.set_hdr(HDR_FREE_PAGES, current)?;
                    self.set_hdr(HDR_FREE_PAGE_COUNT, available - count)?;
                    return Ok(pages);
                }
            }
            self.grow_pages(count)?;
        }

        Err(SubKvError::AllocationFailure(format!(
            "could not obtain {} pages after growth",
            count
        )))
    }

    /// Splice a linked run of pages (`first` .. `last`) onto the free list
    pub(crate) fn release_pages(&self, first: u64, last: u64, count: u64) -> Result<()> {
        let _guard = self.locks().write(HDR_FREE_PAGES)?;
        self.map()
            .write_u64(last + PG_NEXT, self.hdr(HDR_FREE_PAGES)?)?;
        self.map().write_u64(first + PG_PREV, 0)?;
        self.set_hdr(HDR_FREE_PAGES, first)?;
        self.set_hdr(HDR_FREE_PAGE_COUNT, self.hdr(HDR_FREE_PAGE_COUNT)? + count)?;
        Ok(())
    }

    fn grow_pages(&self, needed: u64) -> Result<()> {
        let _guard = self.locks().write(HDR_UNASSIGNED)?;
        let free = self.hdr(HDR_FREE_PAGE_COUNT)?;
        if free >= needed {
            return Ok(());
        }

        let used = self.hdr(HDR_TOTAL_PAGES)?.saturating_sub(free);
        let slots = self.growth_size(used, needed - free);
        self.add_pages(slots)
    }

    /// Append a page area of at least `slots` pages to the free list
    pub(crate) fn add_pages(&self, slots: u64) -> Result<()> {
        let _guard = self.locks().write(HDR_UNASSIGNED)?;
        let page_size = self.page_size();
        let slots = slots.max(1);
        let (offset, length) = self.append_area(AreaKind::PageList, slots * page_size)?;
        let slots = length / page_size;

        for i in 0..slots - 1 {
            let page = offset + i * page_size;
            self.map().write_u64(page + PG_NEXT, page + page_size)?;
        }
        let last = offset + (slots - 1) * page_size;

        let _free = self.locks().write(HDR_FREE_PAGES)?;
        self.map()
            .write_u64(last + PG_NEXT, self.hdr(HDR_FREE_PAGES)?)?;
        self.set_hdr(HDR_FREE_PAGES, offset)?;
        self.set_hdr(HDR_FREE_PAGE_COUNT, self.hdr(HDR_FREE_PAGE_COUNT)? + slots)?;
        self.set_hdr(HDR_TOTAL_PAGES, self.hdr(HDR_TOTAL_PAGES)? + slots)?;

        debug!(offset, slots, "page area added");
        Ok(())
    }

    /// Slots added by one growth step: `base × ratio`, clamped to
    /// `[MIN_GROW_SLOTS, max_grow]` but never less than `needed`
    fn growth_size(&self, base: u64, needed: u64) -> u64 {
        let (ratio, max_grow) = self.growth_params();
        let scaled = base.saturating_mul(ratio) / 100;
        scaled.max(MIN_GROW_SLOTS).min(max_grow).max(needed)
    }
}
