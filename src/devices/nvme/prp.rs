//! PRP (Physical Region Page) list walking: turns a command's `prp1`/`prp2`
//! pair into a host iovec, handling the single-page, two-page, and
//! chained-list cases, and coalescing contiguous guest pages into one
//! iovec entry.

use super::error::NvmeError;
use super::guest::{GuestMemory, GuestSlice};
use crate::memory::PAGE_SIZE;

/// Maximum number of discrete host iovec segments a single command's
/// transfer may expand to before the executor must drain the in-flight
/// iovec and resume (see `ioreq.rs`).
pub const NVME_MAX_BLOCKIOVS: usize = 512;

const PRP2_ITEMS: usize = PAGE_SIZE / 8;

/// A built host iovec for one walk (or partial walk) and the number of
/// bytes it covers.
pub struct PrpResult {
    pub iov: Vec<GuestSlice>,
    pub bytes: usize,
}

fn append(iov: &mut Vec<GuestSlice>, last_gpa: &mut Option<u64>, gpa: u64, ptr: *mut u8, len: usize) {
    if *last_gpa == Some(gpa) {
        if let Some(last) = iov.last_mut() {
            last.len += len;
            *last_gpa = Some(gpa + len as u64);
            return;
        }
    }
    iov.push(GuestSlice { ptr, len });
    *last_gpa = Some(gpa + len as u64);
}

/// Walk `prp1`/`prp2` for a transfer of `total_len` bytes in one pass,
/// producing a host iovec. Used by callers whose transfers never need to
/// span more than `NVME_MAX_BLOCKIOVS` segments (Identify, Get Log Page,
/// and the RAM-backed I/O path); the async I/O path instead uses
/// `PrpWalk`, which can resume across multiple calls.
pub fn walk(
    mem: &dyn GuestMemory,
    prp1: u64,
    prp2: u64,
    total_len: usize,
) -> Result<PrpResult, NvmeError> {
    let mut walker = PrpWalk::new(prp1, prp2, total_len);
    let mut iov = Vec::new();
    let mut bytes = 0usize;
    while !walker.is_done() {
        let batch = walker.next_batch(mem)?;
        bytes += batch.bytes;
        iov.extend(batch.iov);
        if batch.bytes == 0 {
            break;
        }
    }
    Ok(PrpResult { iov, bytes })
}

struct ListCursor {
    list_gpa: u64,
    idx: usize,
}

/// Resumable PRP1/PRP2 walker used by the async I/O path's drain-and-resume
/// loop. Each call to `next_batch` advances the walk by up to
/// `NVME_MAX_BLOCKIOVS` host iovec segments; the caller drains that batch
/// through the backend and calls `next_batch` again to pick up where the
/// walk left off, until `is_done()`.
pub struct PrpWalk {
    prp1: u64,
    prp2: u64,
    total_len: usize,
    transferred: usize,
    started: bool,
    list_cursor: Option<ListCursor>,
}

impl PrpWalk {
    pub fn new(prp1: u64, prp2: u64, total_len: usize) -> Self {
        Self {
            prp1: prp1 & !0x3,
            prp2: prp2 & !0x3,
            total_len,
            transferred: 0,
            started: false,
            list_cursor: None,
        }
    }

    /// True once the whole transfer has been walked.
    pub fn is_done(&self) -> bool {
        self.started && self.transferred >= self.total_len
    }

    /// Produce the next batch of up to `NVME_MAX_BLOCKIOVS` iovec segments.
    /// Returns an empty, zero-byte batch once `is_done()`.
    pub fn next_batch(&mut self, mem: &dyn GuestMemory) -> Result<PrpResult, NvmeError> {
        if self.is_done() {
            return Ok(PrpResult { iov: Vec::new(), bytes: 0 });
        }

        let mut iov = Vec::new();
        let mut last_gpa: Option<u64> = None;
        let batch_start = self.transferred;

        if !self.started {
            self.started = true;

            let first_chunk = PAGE_SIZE - (self.prp1 as usize % PAGE_SIZE);
            let first_chunk = first_chunk.min(self.total_len);
            let ptr1 = mem.translate(self.prp1, first_chunk)?;
            append(&mut iov, &mut last_gpa, self.prp1, ptr1, first_chunk);
            self.transferred += first_chunk;

            if self.transferred == self.total_len {
                return Ok(PrpResult { iov, bytes: self.transferred - batch_start });
            }

            let remaining = self.total_len - self.transferred;
            if remaining <= PAGE_SIZE {
                let ptr2 = mem.translate(self.prp2, remaining)?;
                append(&mut iov, &mut last_gpa, self.prp2, ptr2, remaining);
                self.transferred += remaining;
                return Ok(PrpResult { iov, bytes: self.transferred - batch_start });
            }

            // prp2 points to a PRP list: a page of 64-bit guest addresses,
            // the last slot of each page optionally chaining to the next.
            self.list_cursor = Some(ListCursor { list_gpa: self.prp2, idx: 0 });
        }

        while self.transferred < self.total_len {
            if iov.len() >= NVME_MAX_BLOCKIOVS {
                return Ok(PrpResult { iov, bytes: self.transferred - batch_start });
            }

            let cursor =
                self.list_cursor.as_mut().expect("list cursor set once list walking begins");
            let remaining = self.total_len - self.transferred;

            if cursor.idx == PRP2_ITEMS - 1 && remaining > PAGE_SIZE {
                let next_ptr = mem.translate(cursor.list_gpa + (cursor.idx * 8) as u64, 8)?;
                let next_gpa = unsafe { std::ptr::read_unaligned(next_ptr as *const u64) } & !0x3;
                cursor.list_gpa = next_gpa;
                cursor.idx = 0;
                continue;
            }

            let entry_ptr = mem.translate(cursor.list_gpa + (cursor.idx * 8) as u64, 8)?;
            let entry_gpa = unsafe { std::ptr::read_unaligned(entry_ptr as *const u64) } & !0x3;
            let chunk = remaining.min(PAGE_SIZE);
            let data_ptr = mem.translate(entry_gpa, chunk)?;
            append(&mut iov, &mut last_gpa, entry_gpa, data_ptr, chunk);
            self.transferred += chunk;
            cursor.idx += 1;
        }

        Ok(PrpResult { iov, bytes: self.transferred - batch_start })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::nvme::guest::TestGuestMemory;

    #[test]
    fn single_page_transfer_produces_one_segment() {
        let mem = TestGuestMemory::new(PAGE_SIZE * 2);
        let result = walk(&mem, 0x1000, 0, 512).unwrap();
        assert_eq!(result.iov.len(), 1);
        assert_eq!(result.iov[0].len, 512);
        assert_eq!(result.bytes, 512);
    }

    #[test]
    fn two_page_transfer_uses_prp2_directly() {
        let mem = TestGuestMemory::new(PAGE_SIZE * 3);
        // First page has only 256 bytes of room before the boundary.
        let prp1 = (PAGE_SIZE - 256) as u64;
        let prp2 = PAGE_SIZE as u64 * 2;
        let result = walk(&mem, prp1, prp2, 256 + 300).unwrap();
        assert_eq!(result.iov.len(), 2);
        assert_eq!(result.bytes, 556);
    }

    #[test]
    fn coalesces_contiguous_prp_list_entries() {
        let mem = TestGuestMemory::new(PAGE_SIZE * 16);
        let prp1 = PAGE_SIZE as u64 * 10; // not contiguous with the list's data pages
        let list_gpa = PAGE_SIZE as u64 * 4;
        // Two contiguous data pages referenced from the PRP list.
        let data0 = PAGE_SIZE as u64;
        let data1 = PAGE_SIZE as u64 * 2;
        mem.write_at(list_gpa, &data0.to_le_bytes());
        mem.write_at(list_gpa + 8, &data1.to_le_bytes());

        let total = PAGE_SIZE + PAGE_SIZE + PAGE_SIZE; // first page full + 2 list pages
        let result = walk(&mem, prp1, list_gpa, total).unwrap();
        // prp1's full page, then two contiguous pages coalesced into one.
        assert_eq!(result.iov.len(), 2);
        assert_eq!(result.iov[1].len, PAGE_SIZE * 2);
    }

    #[test]
    fn resumable_walk_splits_at_max_blockiovs_and_resumes() {
        // One full list page of non-contiguous data pages (so none coalesce)
        // plus prp1's own page pushes the segment count to
        // NVME_MAX_BLOCKIOVS + 1, forcing a split across two next_batch
        // calls without needing to chain to a second list page.
        let nlist_entries = NVME_MAX_BLOCKIOVS;
        let mem = TestGuestMemory::new(PAGE_SIZE * (2 * nlist_entries + 8));
        let list_gpa = 0u64;
        for i in 0..nlist_entries {
            // Every other page, so consecutive entries never coalesce.
            let data_gpa = PAGE_SIZE as u64 * (2 + 2 * i as u64);
            mem.write_at(list_gpa + (i * 8) as u64, &data_gpa.to_le_bytes());
        }
        let prp1 = PAGE_SIZE as u64 * (2 + 2 * nlist_entries as u64); // isolated, full page
        let total = PAGE_SIZE * (nlist_entries + 1);

        let mut walker = PrpWalk::new(prp1, list_gpa, total);
        let first = walker.next_batch(&mem).unwrap();
        assert_eq!(first.iov.len(), NVME_MAX_BLOCKIOVS);
        assert!(!walker.is_done());

        let second = walker.next_batch(&mem).unwrap();
        assert_eq!(first.bytes + second.bytes, total);
        assert!(walker.is_done());
        assert_eq!(second.iov.len(), 1);
    }
}
