//! Areas and compaction
//!
//! The region grows by appending areas at the unassigned cursor; the area
//! table in the header records each one. Compaction can only give back the
//! last area, after relocating whatever still lives in it.

use tracing::{debug, info, warn};

use crate::attr::now_micros;
use crate::error::{Result, SubKvError};
use crate::lock::LockMode;

use super::layout::*;
use super::RegionCore;

impl RegionCore {
    // =========================================================================
    // Area Table
    // =========================================================================

    fn area_entry(index: u64) -> u64 {
        HDR_AREA_TABLE + index * AREA_ENTRY_SIZE
    }

    pub(crate) fn write_area(&self, index: u64, area: Area) -> Result<()> {
        let entry = Self::area_entry(index);
        self.map().write_u64(entry, area.kind as u64)?;
        self.map().write_u64(entry + 8, area.offset)?;
        self.map().write_u64(entry + 16, area.length)?;
        Ok(())
    }

    pub(crate) fn area_at(&self, index: u64) -> Result<Area> {
        let entry = Self::area_entry(index);
        let raw_kind = self.map().read_u64(entry)?;
        let kind = AreaKind::from_u64(raw_kind).ok_or_else(|| {
            SubKvError::Corruption(format!("area {} has unknown kind {}", index, raw_kind))
        })?;
        Ok(Area {
            kind,
            offset: self.map().read_u64(entry + 8)?,
            length: self.map().read_u64(entry + 16)?,
        })
    }

    /// Snapshot of the area table
    pub(crate) fn areas(&self) -> Result<Vec<Area>> {
        let count = self.hdr(HDR_AREA_COUNT)?.min(MAX_AREAS);
        (0..count).map(|i| self.area_at(i)).collect()
    }

    pub(crate) fn element_areas(&self) -> Result<Vec<Area>> {
        Ok(self
            .areas()?
            .into_iter()
            .filter(|a| a.kind == AreaKind::ElementList)
            .collect())
    }

    /// Append a zeroed area of at least `bytes` bytes, page aligned
    pub(crate) fn append_area(&self, kind: AreaKind, bytes: u64) -> Result<(u64, u64)> {
        let _guard = self.locks().write(HDR_UNASSIGNED)?;

        let count = self.hdr(HDR_AREA_COUNT)?;
        if count >= MAX_AREAS {
            return Err(SubKvError::AllocationFailure(format!(
                "area table full ({} areas)",
                MAX_AREAS
            )));
        }

        let sys_page = self.system_page();
        let start = align_up(self.hdr(HDR_UNASSIGNED)?, sys_page);
        let end = align_up(start + bytes.max(1), sys_page);

        self.map().resize(end).map_err(|e| match e {
            SubKvError::Io(io) => SubKvError::AllocationFailure(format!(
                "cannot grow region to {} bytes: {}",
                end, io
            )),
            other => other,
        })?;
        self.map().fill(start, end - start, 0)?;

        self.write_area(
            count,
            Area {
                kind,
                offset: start,
                length: end - start,
            },
        )?;
        self.set_hdr(HDR_AREA_COUNT, count + 1)?;
        self.set_hdr(HDR_UNASSIGNED, end)?;
        self.set_hdr(HDR_REGION_LEN, end)?;
        self.set_hdr(HDR_AREA_UPDATE, now_micros())?;

        debug!(kind = ?kind, offset = start, length = end - start, "area appended");
        Ok((start, end - start))
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Give back the last area if everything in it can move elsewhere
    ///
    /// Returns `Ok(false)` without changing anything when the last area is
    /// not an element/page area or there is not enough free room outside it.
    pub(crate) fn compact(&self) -> Result<bool> {
        if self.is_read_only() {
            return Err(SubKvError::ReadOnly);
        }

        let _mask = self.mask_lock(LockMode::Write)?;
        let _unassigned = self.locks().write(HDR_UNASSIGNED)?;
        let _elements = self.locks().write(HDR_FREE_ELEMENTS)?;
        let _pages = self.locks().write(HDR_FREE_PAGES)?;

        let count = self.hdr(HDR_AREA_COUNT)?;
        if count <= 1 {
            return Ok(false);
        }

        let area = self.area_at(count - 1)?;
        let reclaimed = match area.kind {
            AreaKind::ElementList => self.evacuate_elements(&area)?,
            AreaKind::PageList => self.evacuate_pages(&area)?,
            kind => {
                debug!(kind = ?kind, "last area is not reclaimable");
                false
            }
        };
        if !reclaimed {
            return Ok(false);
        }

        self.map()
            .fill(Self::area_entry(count - 1), AREA_ENTRY_SIZE, 0)?;
        self.set_hdr(HDR_AREA_COUNT, count - 1)?;
        self.set_hdr(HDR_UNASSIGNED, area.offset)?;
        self.set_hdr(HDR_REGION_LEN, area.offset)?;
        self.set_hdr(HDR_AREA_UPDATE, now_micros())?;
        self.map().resize(area.offset)?;

        info!(
            kind = ?area.kind,
            offset = area.offset,
            length = area.length,
            "area released by compaction"
        );
        Ok(true)
    }

    /// Split a free list into the slots inside `area` and the ones outside
    fn split_free_list(
        &self,
        head_field: u64,
        link: u64,
        area: &Area,
        limit: u64,
    ) -> Result<(Vec<u64>, Vec<u64>)> {
        let mut inside = Vec::new();
        let mut outside = Vec::new();
        let mut current = self.hdr(head_field)?;

        while current != 0 {
            if (inside.len() + outside.len()) as u64 >= limit {
                return Err(SubKvError::Corruption("free list does not terminate".into()));
            }
            if area.contains(current) {
                inside.push(current);
            } else {
                outside.push(current);
            }
            current = self.map().read_u64(current + link)?;
        }
        Ok((inside, outside))
    }

    /// Rebuild a free list from `slots`
    fn relink_free(&self, head_field: u64, count_field: u64, link: u64, slots: &[u64]) -> Result<()> {
        for pair in slots.windows(2) {
            self.map().write_u64(pair[0] + link, pair[1])?;
        }
        if let Some(&last) = slots.last() {
            self.map().write_u64(last + link, 0)?;
        }
        self.set_hdr(head_field, slots.first().copied().unwrap_or(0))?;
        self.set_hdr(count_field, slots.len() as u64)?;
        Ok(())
    }

    fn evacuate_elements(&self, area: &Area) -> Result<bool> {
        let slots = area.length / ELEMENT_SIZE;
        let mut live = Vec::new();
        for i in 0..slots {
            let element = area.offset + i * ELEMENT_SIZE;
            if self.map().read_u64(element + EL_FLAGS)? & ELEMENT_LIVE != 0 {
                live.push(element);
            }
        }

        let limit = self.hdr(HDR_TOTAL_ELEMENTS)? + 1;
        let (_, outside) = self.split_free_list(HDR_FREE_ELEMENTS, EL_NEXT_FREE, area, limit)?;
        if live.len() > outside.len() {
            debug!(
                live = live.len(),
                free_outside = outside.len(),
                "not enough free elements to evacuate last area"
            );
            return Ok(false);
        }

        for (&old, &new) in live.iter().zip(outside.iter()) {
            let bucket = self.map().read_u64(old + EL_BUCKET)?;
            self.tree_remove(bucket, old)?;
            self.map().copy_within(old, new, ELEMENT_SIZE)?;
            self.tree_insert(bucket, new)?;
            self.map().fill(old, ELEMENT_SIZE, 0)?;
        }

        self.relink_free(
            HDR_FREE_ELEMENTS,
            HDR_FREE_ELEMENT_COUNT,
            EL_NEXT_FREE,
            &outside[live.len()..],
        )?;
        self.set_hdr(
            HDR_TOTAL_ELEMENTS,
            self.hdr(HDR_TOTAL_ELEMENTS)?.saturating_sub(slots),
        )?;

        debug!(moved = live.len(), "element area evacuated");
        Ok(true)
    }

    fn evacuate_pages(&self, area: &Area) -> Result<bool> {
        let page_size = self.page_size();
        let slots = area.length / page_size;
        let limit = self.hdr(HDR_TOTAL_PAGES)? + 1;
        let (inside, outside) = self.split_free_list(HDR_FREE_PAGES, PG_NEXT, area, limit)?;

        let live_inside = slots.saturating_sub(inside.len() as u64) as usize;
        if live_inside > outside.len() {
            debug!(
                live = live_inside,
                free_outside = outside.len(),
                "not enough free pages to evacuate last area"
            );
            return Ok(false);
        }

        let mut used = 0usize;
        if live_inside > 0 {
            for element_area in self.element_areas()? {
                for i in 0..element_area.length / ELEMENT_SIZE {
                    let element = element_area.offset + i * ELEMENT_SIZE;
                    if self.map().read_u64(element + EL_FLAGS)? & ELEMENT_LIVE == 0 {
                        continue;
                    }
                    for field in Field::ALL {
                        used += self.relocate_chain(element, field, area, &outside[used..])?;
                    }
                }
            }
        }

        if used != live_inside {
            warn!(
                expected = live_inside,
                moved = used,
                "pages in released area were not reachable from any chain"
            );
        }

        self.relink_free(HDR_FREE_PAGES, HDR_FREE_PAGE_COUNT, PG_NEXT, &outside[used..])?;
        self.set_hdr(
            HDR_TOTAL_PAGES,
            self.hdr(HDR_TOTAL_PAGES)?.saturating_sub(slots),
        )?;

        debug!(moved = used, "page area evacuated");
        Ok(true)
    }

    /// Move the pages of one chain that lie in `area` into `spare` slots;
    /// returns how many spare slots were consumed
    fn relocate_chain(&self, element: u64, field: Field, area: &Area, spare: &[u64]) -> Result<usize> {
        let page_size = self.page_size();
        let limit = self.hdr(HDR_TOTAL_PAGES)?;
        let mut used = 0usize;
        let mut prev = 0u64;
        let mut page = self.map().read_u64(field.head_offset(element))?;
        let mut steps = 0u64;

        while page != 0 {
            steps += 1;
            if steps > limit {
                return Err(SubKvError::Corruption(format!(
                    "chain of element {} does not terminate",
                    element
                )));
            }

            let next = self.map().read_u64(page + PG_NEXT)?;
            let mut current = page;

            if area.contains(page) {
                let target = *spare.get(used).ok_or_else(|| {
                    SubKvError::Corruption("more live pages than counted".into())
                })?;
                used += 1;

                self.map().copy_within(page, target, page_size)?;
                self.map().write_u64(target + PG_PREV, prev)?;
                if prev == 0 {
                    self.map().write_u64(field.head_offset(element), target)?;
                } else {
                    self.map().write_u64(prev + PG_NEXT, target)?;
                }
                if next != 0 {
                    self.map().write_u64(next + PG_PREV, target)?;
                }
                current = target;
            }

            prev = current;
            page = next;
        }

        Ok(used)
    }
}
