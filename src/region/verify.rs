//! Structural verification
//!
//! Walks every level, bucket tree, chain and free list while holding the
//! mask lock exclusively. Bucket counts are repaired in place; everything
//! else is reported.

use tracing::warn;

use crate::error::Result;
use crate::lock::LockMode;

use super::layout::*;
use super::RegionCore;

/// Outcome of [`crate::Engine::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub levels: u32,
    pub buckets: u64,
    pub elements: u64,
    pub chain_pages: u64,
    pub free_elements: u64,
    pub free_pages: u64,
    pub repaired_buckets: u64,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

impl RegionCore {
    pub(crate) fn verify(&self) -> Result<VerifyReport> {
        let _mask = self.mask_lock(LockMode::Write)?;
        let _unassigned = self.locks().write(HDR_UNASSIGNED)?;
        let _elements = self.locks().write(HDR_FREE_ELEMENTS)?;
        let _pages = self.locks().write(HDR_FREE_PAGES)?;

        let mut report = VerifyReport::default();
        let min_bits = mask_bits(self.hdr(HDR_MIN_MASK)?);
        let cur_bits = mask_bits(self.hdr(HDR_CUR_MASK)?);

        for bits in min_bits..=cur_bits {
            let (buckets, _) = self.level_counts(bits)?;
            if buckets != 1u64 << bits {
                report
                    .problems
                    .push(format!("level {} has {} buckets", bits, buckets));
                continue;
            }
            report.levels += 1;

            for index in 0..buckets {
                let bucket = self.bucket_offset(bits, index)?;
                self.verify_bucket(bits, index, bucket, &mut report)?;
            }
        }

        let live = self.hdr(HDR_LIVE_COUNT)?;
        if live != report.elements {
            report.problems.push(format!(
                "header counts {} live elements, trees hold {}",
                live, report.elements
            ));
        }

        report.free_elements = self.verify_free_list(
            HDR_FREE_ELEMENTS,
            HDR_FREE_ELEMENT_COUNT,
            EL_NEXT_FREE,
            HDR_TOTAL_ELEMENTS,
            &mut report.problems,
        )?;
        report.free_pages = self.verify_free_list(
            HDR_FREE_PAGES,
            HDR_FREE_PAGE_COUNT,
            PG_NEXT,
            HDR_TOTAL_PAGES,
            &mut report.problems,
        )?;

        let total_elements = self.hdr(HDR_TOTAL_ELEMENTS)?;
        if report.elements + report.free_elements != total_elements {
            report.problems.push(format!(
                "{} live + {} free elements, {} slots exist",
                report.elements, report.free_elements, total_elements
            ));
        }

        let total_pages = self.hdr(HDR_TOTAL_PAGES)?;
        if report.chain_pages + report.free_pages != total_pages {
            report.problems.push(format!(
                "{} chained + {} free pages, {} slots exist",
                report.chain_pages, report.free_pages, total_pages
            ));
        }

        for problem in &report.problems {
            warn!(problem = problem.as_str(), "region verification");
        }
        Ok(report)
    }

    fn verify_bucket(
        &self,
        bits: u32,
        index: u64,
        bucket: u64,
        report: &mut VerifyReport,
    ) -> Result<()> {
        report.buckets += 1;

        if self.is_read_only() {
            let recorded = self.map().read_u64(bucket + BK_COUNT)?;
            let actual = self.tree_elements(bucket)?.len() as u64;
            if recorded != actual {
                report.problems.push(format!(
                    "bucket {} records {} elements, holds {}",
                    bucket, recorded, actual
                ));
            }
        } else {
            let (recorded, actual) = self.recount_bucket(bucket)?;
            if recorded != actual {
                report.repaired_buckets += 1;
            }
        }

        for element in self.tree_elements(bucket)? {
            report.elements += 1;

            if !self.is_live(element)? {
                report
                    .problems
                    .push(format!("element {} in bucket {} is not live", element, bucket));
            }
            if self.element_bucket(element)? != bucket {
                report.problems.push(format!(
                    "element {} points at bucket {}, found in {}",
                    element,
                    self.element_bucket(element)?,
                    bucket
                ));
            }
            if self.map().read_u64(element + EL_HASH1)? & mask_of(bits) != index {
                report
                    .problems
                    .push(format!("element {} hashed into the wrong bucket", element));
            }

            for field in Field::ALL {
                let (head, len) = self.chain_of(element, field)?;
                let pages = self.chain_pages(head)?.len() as u64;
                report.chain_pages += pages;

                if pages != self.pages_for(len) {
                    report.problems.push(format!(
                        "element {} {:?} chain has {} pages for {} bytes",
                        element, field, pages, len
                    ));
                }
                let stored = self.chain_byte_len(head)?;
                if stored != len {
                    report.problems.push(format!(
                        "element {} {:?} chain stores {} bytes, records {}",
                        element, field, stored, len
                    ));
                }
            }
        }
        Ok(())
    }

    fn verify_free_list(
        &self,
        head_field: u64,
        count_field: u64,
        link: u64,
        total_field: u64,
        problems: &mut Vec<String>,
    ) -> Result<u64> {
        let limit = self.hdr(total_field)?;
        let recorded = self.hdr(count_field)?;
        let mut seen = 0u64;
        let mut current = self.hdr(head_field)?;

        while current != 0 {
            if seen >= limit {
                problems.push(format!("free list at header {} does not terminate", head_field));
                return Ok(seen);
            }
            seen += 1;
            current = self.map().read_u64(current + link)?;
        }

        if seen != recorded {
            problems.push(format!(
                "free list at header {} holds {} slots, records {}",
                head_field, seen, recorded
            ));
        }
        Ok(seen)
    }
}
