//! Free-Space Manager: block allocation, the persisted bitmap, the header
//! region, and the in-memory free-run tree.

pub mod bitmap;
pub mod freetree;

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::os::file::RawFile;
use crate::os::mmap::MmapPool;
use crate::types::{FsmAllocFlags, FsmClearFlags, SyncFlags};
use freetree::{FreeRun, FreeTree};

const MAGIC: &[u8; 4] = b"SKV1";

/// magic(4) + first_db_offset(8) + block_power(1) + bmoff(8) + bmlen(8)
/// + crzsum(8) + crznum(4) + crzvar(8) + reserved(32) + hdrlen(4).
const FIXED_PREFIX_LEN: usize = 4 + 8 + 1 + 8 + 8 + 8 + 4 + 8 + 32 + 4;

pub const MIN_BLOCK_POWER: u8 = 6;
pub const MAX_BLOCK_POWER: u8 = 20;
pub const DEFAULT_BLOCK_POWER: u8 = 6;

/// Allocation statistics (`crzsum`/`crznum`/`crzvar`) reset once `crznum`
/// exceeds this, to keep the running variance from drifting over a very
/// long-lived file.
const CRZNUM_RESET_THRESHOLD: u32 = 65_535;

fn round_up(x: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        x
    } else {
        x.div_ceil(multiple) * multiple
    }
}

/// Options for `Fsm::open`.
pub struct FsmOpenOptions {
    pub create: bool,
    pub block_power: Option<u8>,
    pub readonly: bool,
    pub strict: bool,
    /// Bytes of caller-controlled header beyond the fixed FSM prefix.
    pub extra_header_len: u32,
}

impl Default for FsmOpenOptions {
    fn default() -> Self {
        FsmOpenOptions {
            create: false,
            block_power: None,
            readonly: false,
            strict: false,
            extra_header_len: 0,
        }
    }
}

/// A read-only snapshot of the FSM's persisted allocation statistics
/// (SPEC_FULL §F, `Engine::stats()`).
#[derive(Debug, Clone, Copy)]
pub struct FsmStats {
    pub crzsum: u64,
    pub crznum: u32,
    pub crzvar: u64,
    pub bmoff: u64,
    pub bmlen: u64,
    pub file_size: u64,
}

/// The free-space manager for one open file.
pub struct Fsm {
    file: Arc<dyn RawFile>,
    mmap: MmapPool,
    block_power: u8,
    hdrlen: u32,
    bmoff: u64,
    bmlen: u64,
    first_db_offset: u64,
    crzsum: u64,
    crznum: u32,
    crzvar: u64,
    free: FreeTree,
    readonly: bool,
    strict: bool,
}

impl Fsm {
    pub fn open(file: Arc<dyn RawFile>, opts: FsmOpenOptions) -> Result<Fsm> {
        let file_len = file.len()?;
        if opts.create || file_len == 0 {
            Fsm::create(file, opts)
        } else {
            Fsm::open_existing(file, opts)
        }
    }

    fn create(file: Arc<dyn RawFile>, opts: FsmOpenOptions) -> Result<Fsm> {
        let block_power = opts.block_power.unwrap_or(DEFAULT_BLOCK_POWER);
        if !(MIN_BLOCK_POWER..=MAX_BLOCK_POWER).contains(&block_power) {
            return Err(Error::new(ErrorCode::InvalidBlockSize));
        }
        let block_size = 1u64 << block_power;
        let page_size = MmapPool::page_size() as u64;
        if block_size > page_size {
            return Err(Error::new(ErrorCode::PlatformPage));
        }

        let required_hdr = FIXED_PREFIX_LEN as u64 + opts.extra_header_len as u64;
        let hdrlen = round_up(required_hdr, block_size).max(block_size);
        let bmoff = round_up(hdrlen, page_size);
        let bmlen = page_size.max(block_size);
        let total = bmoff + bmlen;

        file.set_len(total)?;
        let mmap = MmapPool::new(file.raw_fd(), total)?;

        {
            let guard = mmap.acquire();
            let bm = guard.slice_mut(bmoff, bmlen as usize)?;
            bm.fill(0);
            bitmap::set_range(bm, 0, hdrlen / block_size);
            bitmap::set_range(bm, bmoff / block_size, bmlen / block_size);
        }

        // The header region may not reach all the way to the (page-aligned)
        // bitmap offset; the gap between them is free space the tree needs
        // to know about from the start.
        let mut free = FreeTree::new();
        let hdr_blocks = hdrlen / block_size;
        let bm_start_blk = bmoff / block_size;
        if bm_start_blk > hdr_blocks {
            free.insert(hdr_blocks, bm_start_blk - hdr_blocks);
        }

        let mut fsm = Fsm {
            file,
            mmap,
            block_power,
            hdrlen: hdrlen as u32,
            bmoff,
            bmlen,
            first_db_offset: 0,
            crzsum: 0,
            crznum: 0,
            crzvar: 0,
            free,
            readonly: opts.readonly,
            strict: opts.strict,
        };
        fsm.write_meta()?;
        fsm.file.sync(SyncFlags::FSYNC)?;
        debug!(
            "fsm created: block_power={} hdrlen={} bmoff={} bmlen={}",
            block_power, hdrlen, bmoff, bmlen
        );
        Ok(fsm)
    }

    fn open_existing(file: Arc<dyn RawFile>, opts: FsmOpenOptions) -> Result<Fsm> {
        let file_len = file.len()?;
        if file_len < FIXED_PREFIX_LEN as u64 {
            return Err(Error::new(ErrorCode::InvalidFileMeta));
        }
        let mmap = MmapPool::new(file.raw_fd(), file_len)?;

        let (magic, first_db_offset, block_power, bmoff, bmlen, crzsum, crznum, crzvar, hdrlen) = {
            let guard = mmap.acquire();
            let hdr = guard.slice(0, FIXED_PREFIX_LEN)?;
            (
                [hdr[0], hdr[1], hdr[2], hdr[3]],
                u64::from_le_bytes(hdr[4..12].try_into().unwrap()),
                hdr[12],
                u64::from_le_bytes(hdr[13..21].try_into().unwrap()),
                u64::from_le_bytes(hdr[21..29].try_into().unwrap()),
                u64::from_le_bytes(hdr[29..37].try_into().unwrap()),
                u32::from_le_bytes(hdr[37..41].try_into().unwrap()),
                u64::from_le_bytes(hdr[41..49].try_into().unwrap()),
                u32::from_le_bytes(hdr[81..85].try_into().unwrap()),
            )
        };

        if magic != *MAGIC {
            return Err(Error::new(ErrorCode::InvalidFileMeta));
        }
        if !(MIN_BLOCK_POWER..=MAX_BLOCK_POWER).contains(&block_power) {
            return Err(Error::new(ErrorCode::InvalidFileMeta));
        }
        if opts.block_power.is_some() {
            debug!("fsm: ignoring explicit block_power, existing header already fixes it");
        }

        let block_size = 1u64 << block_power;
        let bitmap_bytes = {
            let guard = mmap.acquire();
            guard.slice(bmoff, bmlen as usize)?.to_vec()
        };
        let total_bits = file_len / block_size;
        let free = FreeTree::from_runs(bitmap::scan_free_runs(&bitmap_bytes, total_bits));

        debug!(
            "fsm opened: block_power={} bmoff={} bmlen={} free_runs={}",
            block_power,
            bmoff,
            bmlen,
            free.len()
        );

        Ok(Fsm {
            file,
            mmap,
            block_power,
            hdrlen,
            bmoff,
            bmlen,
            first_db_offset,
            crzsum,
            crznum,
            crzvar,
            free,
            readonly: opts.readonly,
            strict: opts.strict,
        })
    }

    pub fn block_power(&self) -> u8 {
        self.block_power
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.block_power
    }

    pub fn page_size(&self) -> u64 {
        MmapPool::page_size() as u64
    }

    pub fn page_blks(&self) -> u64 {
        self.page_size() / self.block_size()
    }

    pub fn hdrlen(&self) -> u32 {
        self.hdrlen
    }

    pub fn first_db_offset(&self) -> u64 {
        self.first_db_offset
    }

    pub fn set_first_db_offset(&mut self, off: u64) -> Result<()> {
        self.first_db_offset = off;
        self.write_meta()
    }

    pub fn mmap(&self) -> &MmapPool {
        &self.mmap
    }

    pub fn stats(&self) -> Result<FsmStats> {
        Ok(FsmStats {
            crzsum: self.crzsum,
            crznum: self.crznum,
            crzvar: self.crzvar,
            bmoff: self.bmoff,
            bmlen: self.bmlen,
            file_size: self.file.len()?,
        })
    }

    fn write_meta(&mut self) -> Result<()> {
        let guard = self.mmap.acquire();
        let hdr = guard.slice_mut(0, FIXED_PREFIX_LEN)?;
        hdr[0..4].copy_from_slice(MAGIC);
        hdr[4..12].copy_from_slice(&self.first_db_offset.to_le_bytes());
        hdr[12] = self.block_power;
        hdr[13..21].copy_from_slice(&self.bmoff.to_le_bytes());
        hdr[21..29].copy_from_slice(&self.bmlen.to_le_bytes());
        hdr[29..37].copy_from_slice(&self.crzsum.to_le_bytes());
        hdr[37..41].copy_from_slice(&self.crznum.to_le_bytes());
        hdr[41..49].copy_from_slice(&self.crzvar.to_le_bytes());
        hdr[81..85].copy_from_slice(&self.hdrlen.to_le_bytes());
        Ok(())
    }

    /// Copy `buf` into the caller-controlled header tail, at `off` bytes
    /// past the fixed FSM prefix.
    pub fn writehdr(&mut self, off: u32, buf: &[u8]) -> Result<()> {
        let start = FIXED_PREFIX_LEN as u64 + off as u64;
        if start + buf.len() as u64 > self.hdrlen as u64 {
            return Err(Error::new(ErrorCode::OutOfBounds));
        }
        let guard = self.mmap.acquire();
        guard.slice_mut(start, buf.len())?.copy_from_slice(buf);
        Ok(())
    }

    pub fn readhdr(&self, off: u32, buf: &mut [u8]) -> Result<()> {
        let start = FIXED_PREFIX_LEN as u64 + off as u64;
        if start + buf.len() as u64 > self.hdrlen as u64 {
            return Err(Error::new(ErrorCode::OutOfBounds));
        }
        let guard = self.mmap.acquire();
        buf.copy_from_slice(guard.slice(start, buf.len())?);
        Ok(())
    }

    fn mark_allocated(&mut self, offset_blk: u64, len_blk: u64) -> Result<()> {
        let strict = self.strict;
        let guard = self.mmap.acquire();
        let bm = guard.slice_mut(self.bmoff, self.bmlen as usize)?;
        if strict && !bitmap::all_clear(bm, offset_blk, len_blk) {
            warn!(
                "fsm strict check failed: [{}, {}) already has set bits",
                offset_blk,
                offset_blk + len_blk
            );
            return Err(Error::new(ErrorCode::FsmSegmentation));
        }
        bitmap::set_range(bm, offset_blk, len_blk);
        trace!("fsm bits set [{}, {})", offset_blk, offset_blk + len_blk);
        Ok(())
    }

    fn mark_free(&mut self, offset_blk: u64, len_blk: u64) -> Result<()> {
        let strict = self.strict;
        let guard = self.mmap.acquire();
        let bm = guard.slice_mut(self.bmoff, self.bmlen as usize)?;
        if strict && !bitmap::all_set(bm, offset_blk, len_blk) {
            warn!(
                "fsm strict check failed: [{}, {}) is not fully allocated",
                offset_blk,
                offset_blk + len_blk
            );
            return Err(Error::new(ErrorCode::FsmSegmentation));
        }
        bitmap::clear_range(bm, offset_blk, len_blk);
        trace!("fsm bits cleared [{}, {})", offset_blk, offset_blk + len_blk);
        Ok(())
    }

    /// Remove `run` from the tree, mark `[offset_blk, offset_blk+len_blk)`
    /// allocated, and reinsert any head/tail slack left over from `run`.
    fn consume_run(&mut self, run: FreeRun, offset_blk: u64, len_blk: u64) -> Result<()> {
        self.free.remove(run.offset_blk, run.len_blk);
        let head = offset_blk - run.offset_blk;
        if head > 0 {
            self.free.insert(run.offset_blk, head);
        }
        let run_end = run.offset_blk + run.len_blk;
        let tail_start = offset_blk + len_blk;
        if run_end > tail_start {
            self.free.insert(tail_start, run_end - tail_start);
        }
        self.mark_allocated(offset_blk, len_blk)
    }

    fn is_typical_overallocation(&self, remainder_blk: u64) -> bool {
        if self.crznum == 0 {
            return false;
        }
        let avg = self.crzsum as f64 / self.crznum as f64;
        let diff = avg - remainder_blk as f64;
        diff * diff > 6.0 * (self.crzvar as f64) / (self.crznum as f64)
    }

    fn record_stat(&mut self, len_blk: u64) {
        if self.crznum > CRZNUM_RESET_THRESHOLD {
            self.crzsum = 0;
            self.crznum = 0;
            self.crzvar = 0;
        }
        self.crznum += 1;
        self.crzsum += len_blk;
        let avg = self.crzsum as f64 / self.crznum as f64;
        let dev = len_blk as f64 - avg;
        self.crzvar = self.crzvar.saturating_add((dev * dev) as u64);
    }

    fn default_growth_blocks(&self) -> Result<u64> {
        let cur_blocks = self.file.len()? / self.block_size();
        Ok(cur_blocks.max(self.page_blks()))
    }

    /// Grow the file by `additional_blocks`, growing the bitmap first if it
    /// doesn't have enough bit capacity to cover the larger file.
    fn extend_for(&mut self, additional_blocks: u64) -> Result<()> {
        let block_size = self.block_size();
        let cur_len = self.file.len()?;
        let cur_blocks = cur_len / block_size;
        let new_blocks = cur_blocks + additional_blocks;

        if new_blocks > self.bmlen * 8 {
            self.grow_bitmap(new_blocks)?;
        }

        let new_len = new_blocks * block_size;
        self.file.set_len(new_len)?;
        self.mmap.remap(new_len)?;
        self.free.insert(cur_blocks, additional_blocks);
        debug!(
            "fsm extended file: {} -> {} blocks",
            cur_blocks, new_blocks
        );
        Ok(())
    }

    /// Bitmap growth: double
    /// `bmlen` until it covers `min_blocks_capacity`, place the new bitmap
    /// (in-place if the tree already has room, else past the address space
    /// the doubled bitmap implies), copy the old bits forward, mark the new
    /// bitmap's own blocks, install the new meta, and only then reclaim the
    /// old bitmap region.
    fn grow_bitmap(&mut self, min_blocks_capacity: u64) -> Result<()> {
        let block_size = self.block_size();
        let mut new_bmlen = self.bmlen * 2;
        while new_bmlen * 8 < min_blocks_capacity {
            new_bmlen *= 2;
        }
        let want_blocks = new_bmlen / block_size;
        let page_blks = self.page_blks();

        let new_bmoff_blk = if let Some((run, noff)) =
            self.free.find_page_aligned(want_blocks, page_blks, u64::MAX)
        {
            self.consume_run(run, noff, want_blocks)?;
            noff
        } else {
            let target_off = round_up(8 * new_bmlen, self.page_size());
            let needed_file_len = target_off + new_bmlen;
            let cur_len = self.file.len()?;
            if needed_file_len > cur_len {
                self.file.set_len(needed_file_len)?;
            }
            self.mmap.remap(needed_file_len.max(cur_len))?;
            let target_blk = target_off / block_size;
            self.mark_allocated(target_blk, want_blocks)?;
            target_blk
        };

        let new_bmoff = new_bmoff_blk * block_size;
        let old_bmoff = self.bmoff;
        let old_bmlen = self.bmlen;

        {
            let old_bytes = {
                let guard = self.mmap.acquire();
                guard.slice(old_bmoff, old_bmlen as usize)?.to_vec()
            };
            let guard = self.mmap.acquire();
            let new_slice = guard.slice_mut(new_bmoff, new_bmlen as usize)?;
            new_slice.fill(0);
            new_slice[..old_bytes.len()].copy_from_slice(&old_bytes);
            bitmap::set_range(new_slice, new_bmoff_blk, want_blocks);
        }

        self.bmoff = new_bmoff;
        self.bmlen = new_bmlen;
        self.write_meta()?;

        self.deallocate_raw(old_bmoff / block_size, old_bmlen / block_size)?;

        debug!("fsm bitmap grown: {} -> {} bytes", old_bmlen, new_bmlen);
        Ok(())
    }

    /// Allocate `len_bytes`, honouring `flags`.
    pub fn allocate(&mut self, len_bytes: u64, flags: FsmAllocFlags) -> Result<(u64, u64)> {
        self.allocate_near(len_bytes, 0, flags)
    }

    /// Allocate `len_bytes` near `offset_hint` (used by the unaligned path's
    /// best-fit neighbourhood search).
    pub fn allocate_near(
        &mut self,
        len_bytes: u64,
        offset_hint: u64,
        flags: FsmAllocFlags,
    ) -> Result<(u64, u64)> {
        if self.readonly {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if len_bytes == 0 {
            return Err(Error::new(ErrorCode::InvalidArgs));
        }
        let block_size = self.block_size();
        let len_blk = len_bytes.div_ceil(block_size);
        let hint_blk = offset_hint / block_size;

        if flags.contains(FsmAllocFlags::PAGE_ALIGNED) {
            self.allocate_page_aligned(len_blk, flags)
        } else {
            self.allocate_unaligned(len_blk, hint_blk, flags)
        }
    }

    fn allocate_page_aligned(&mut self, len_blk: u64, flags: FsmAllocFlags) -> Result<(u64, u64)> {
        let page_blks = self.page_blks();
        loop {
            if let Some((run, noff)) = self.free.find_page_aligned(len_blk, page_blks, u64::MAX) {
                self.consume_run(run, noff, len_blk)?;
                if !flags.contains(FsmAllocFlags::NO_STATS) {
                    self.record_stat(len_blk);
                }
                let off = noff * self.block_size();
                debug!("fsm allocate page-aligned off={} len_blk={}", off, len_blk);
                return Ok((off, len_blk * self.block_size()));
            }
            if flags.contains(FsmAllocFlags::NO_EXTEND) {
                return Err(Error::new(ErrorCode::NoFreeSpace));
            }
            let growth = self.default_growth_blocks()?;
            self.extend_for((len_blk + page_blks).max(growth))?;
        }
    }

    fn allocate_unaligned(
        &mut self,
        len_blk: u64,
        hint_blk: u64,
        flags: FsmAllocFlags,
    ) -> Result<(u64, u64)> {
        loop {
            if let Some(run) = self.free.best_fit(len_blk, hint_blk) {
                let remainder = run.len_blk - len_blk;
                // Both flags disable the over-allocation heuristic, for
                // different reasons: NO_OVERALLOCATE says the caller never
                // wants it; SOLID_ALLOCATED_SPACE says the caller already
                // guarantees it will use exactly `len_blk` and nothing more.
                let heuristic_disabled = flags.contains(FsmAllocFlags::NO_OVERALLOCATE)
                    || flags.contains(FsmAllocFlags::SOLID_ALLOCATED_SPACE);
                let attach_whole =
                    remainder > 0 && !heuristic_disabled && self.is_typical_overallocation(remainder);

                self.free.remove(run.offset_blk, run.len_blk);
                let assigned_len = if attach_whole { run.len_blk } else { len_blk };
                if !attach_whole && remainder > 0 {
                    self.free.insert(run.offset_blk + len_blk, remainder);
                }
                self.mark_allocated(run.offset_blk, assigned_len)?;
                if !flags.contains(FsmAllocFlags::NO_STATS) {
                    self.record_stat(len_blk);
                }
                let off = run.offset_blk * self.block_size();
                debug!(
                    "fsm allocate off={} len_blk={} assigned_blk={}",
                    off, len_blk, assigned_len
                );
                return Ok((off, assigned_len * self.block_size()));
            }
            if flags.contains(FsmAllocFlags::NO_EXTEND) {
                return Err(Error::new(ErrorCode::NoFreeSpace));
            }
            let growth = self.default_growth_blocks()?;
            self.extend_for(len_blk.max(growth))?;
        }
    }

    /// Free `[offset, offset+len)`, merging with adjacent free runs.
    pub fn deallocate(&mut self, offset: u64, len: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        let block_size = self.block_size();
        if offset % block_size != 0 {
            return Err(Error::new(ErrorCode::RangeNotAligned));
        }
        let offset_blk = offset / block_size;
        let len_blk = len.div_ceil(block_size);
        self.deallocate_raw(offset_blk, len_blk)
    }

    fn deallocate_raw(&mut self, offset_blk: u64, len_blk: u64) -> Result<()> {
        self.mark_free(offset_blk, len_blk)?;

        let file_blocks = self.file.len()? / self.block_size();
        let mut merged_offset = offset_blk;
        let mut merged_len = len_blk;

        {
            let guard = self.mmap.acquire();
            let bm = guard.slice(self.bmoff, self.bmlen as usize)?;

            if merged_offset > 0 && !bitmap::get_bit(bm, merged_offset - 1) {
                let left_start = bitmap::find_prev_set_bit(bm, merged_offset - 1, 0)
                    .map(|b| b + 1)
                    .unwrap_or(0);
                merged_len += merged_offset - left_start;
                merged_offset = left_start;
            }

            let right_probe = merged_offset + merged_len;
            if right_probe < file_blocks && !bitmap::get_bit(bm, right_probe) {
                let right_end = bitmap::find_next_set_bit(bm, right_probe, file_blocks)
                    .unwrap_or(file_blocks);
                merged_len += right_end - right_probe;
            }
        }

        if merged_offset < offset_blk {
            if let Some(left) = self.free.get(merged_offset) {
                self.free.remove(left.offset_blk, left.len_blk);
            }
        }
        let right_start = offset_blk + len_blk;
        if merged_offset + merged_len > right_start {
            if let Some(right) = self.free.get(right_start) {
                self.free.remove(right.offset_blk, right.len_blk);
            }
        }

        self.free.insert(merged_offset, merged_len);
        trace!(
            "fsm deallocate [{}, {}) merged=[{}, {})",
            offset_blk,
            offset_blk + len_blk,
            merged_offset,
            merged_offset + merged_len
        );
        Ok(())
    }

    pub fn ensure_size(&mut self, size: u64) -> Result<()> {
        let cur = self.file.len()?;
        if size > cur {
            self.file.set_len(size)?;
            self.mmap.remap(size)?;
        }
        Ok(())
    }

    /// Discard all allocation state and start over with a fresh bitmap.
    pub fn clear(&mut self, flags: FsmClearFlags) -> Result<()> {
        if self.readonly {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        let block_size = self.block_size();
        self.free = FreeTree::new();
        let total = self.bmoff + self.bmlen;
        self.file.set_len(total)?;
        self.mmap.remap(total)?;
        {
            let guard = self.mmap.acquire();
            let bm = guard.slice_mut(self.bmoff, self.bmlen as usize)?;
            bm.fill(0);
            bitmap::set_range(bm, 0, self.hdrlen as u64 / block_size);
            bitmap::set_range(bm, self.bmoff / block_size, self.bmlen / block_size);
        }
        self.crzsum = 0;
        self.crznum = 0;
        self.crzvar = 0;
        self.write_meta()?;
        if flags.contains(FsmClearFlags::TRIM) {
            self.trim_tail()?;
        }
        debug!("fsm cleared");
        Ok(())
    }

    pub fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        self.write_meta()?;
        let total = self.file.len()?;
        self.mmap.sync(0, total, flags)?;
        if let Err(e) = self.file.sync(flags) {
            warn!("fsm sync failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Truncate the file to the last allocated block, called on close if the file is writable.
    ///
    /// Does not attempt to relocate the bitmap to a lower offset first (the
    /// tree entries beyond the new end are simply dropped). The bitmap's own
    /// blocks are never freed, so it never sits past the last allocated data
    /// block in practice.
    pub fn trim_tail(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        let block_size = self.block_size();
        let file_blocks = self.file.len()? / block_size;
        let last_bit = {
            let guard = self.mmap.acquire();
            let bm = guard.slice(self.bmoff, self.bmlen as usize)?;
            bitmap::find_prev_set_bit(bm, file_blocks.saturating_sub(1), 0)
        };
        let Some(last) = last_bit else {
            return Ok(());
        };
        let new_len = (last + 1) * block_size;
        let cur_len = self.file.len()?;
        if new_len >= cur_len {
            return Ok(());
        }

        let cutoff_blk = new_len / block_size;
        let stale: Vec<FreeRun> = self.free.iter().filter(|r| r.offset_blk >= cutoff_blk).copied().collect();
        for r in stale {
            self.free.remove(r.offset_blk, r.len_blk);
        }

        self.file.set_len(new_len)?;
        self.mmap.remap(new_len)?;
        debug!("fsm tail trimmed to {} bytes ({} blocks)", new_len, cutoff_blk);
        Ok(())
    }

    pub fn lock(&self) -> Result<()> {
        self.file.lock(true)
    }

    pub fn unlock(&self) -> Result<()> {
        self.file.unlock()
    }
}
