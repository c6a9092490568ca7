//! Database registry: the doubly-linked — in practice, forward-linked,
//! see DESIGN.md — chain of fixed 257-byte DB records threaded through the
//! file, and the in-memory id → record map built from it.
//!
//! Each `DbRecord` doubles as the head of its own skip list: `n[30]` are
//! the per-level forward pointers to the first SBLK, `lcnt[30]` the
//! per-level node counts, and `p0` — by analogy with an SBLK's own `p0` —
//! is the level-0 **tail** pointer, giving O(1) access to the last node for
//! `AFTER_LAST` cursor positioning.

use std::collections::HashMap;

use log::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::os::mmap::MmapPool;
use crate::storage::fsm::Fsm;
use crate::storage::sblk::{Sblk, NFWD, SBLK_SIZE};
use crate::types::{DbFlags, DbId};

pub const DB_RECORD_SIZE: u64 = 257;
const DB_MAGIC: &[u8; 4] = b"SKDB";

const OFF_MAGIC: usize = 0;
const OFF_DBFLG: usize = 4;
const OFF_DBID: usize = 5;
const OFF_NEXT: usize = 9;
const OFF_P0: usize = 13;
const OFF_N: usize = 17;
const OFF_LCNT: usize = OFF_N + NFWD * 4; // 137

fn round_up(x: u64, multiple: u64) -> u64 {
    x.div_ceil(multiple) * multiple
}

fn blk_to_addr(blk: u32, block_size: u64) -> Option<u64> {
    if blk == 0 {
        None
    } else {
        Some(blk as u64 * block_size)
    }
}

fn addr_to_blk(addr: Option<u64>, block_size: u64) -> u32 {
    match addr {
        None => 0,
        Some(a) => (a / block_size) as u32,
    }
}

/// A database's skip-list head, persisted at a fixed offset.
#[derive(Debug, Clone)]
pub struct DbRecord {
    pub addr: u64,
    pub dbid: DbId,
    pub dbflg: DbFlags,
    next_db: u32,
    p0: u32,
    n: [u32; NFWD],
    lcnt: [u32; NFWD],
}

impl DbRecord {
    pub fn create(fsm: &mut Fsm, dbid: DbId, dbflg: DbFlags) -> Result<DbRecord> {
        let size = round_up(DB_RECORD_SIZE, fsm.block_size());
        let (addr, _) = fsm.allocate(
            size,
            crate::types::FsmAllocFlags::NO_OVERALLOCATE
                | crate::types::FsmAllocFlags::SOLID_ALLOCATED_SPACE
                | crate::types::FsmAllocFlags::NO_STATS,
        )?;
        let rec = DbRecord {
            addr,
            dbid,
            dbflg,
            next_db: 0,
            p0: 0,
            n: [0; NFWD],
            lcnt: [0; NFWD],
        };
        rec.write(fsm.mmap())?;
        debug!("db record created addr={} dbid={}", addr, dbid);
        Ok(rec)
    }

    pub fn read(mmap: &MmapPool, addr: u64) -> Result<DbRecord> {
        let guard = mmap.acquire();
        let buf = guard.slice(addr, DB_RECORD_SIZE as usize)?;
        if &buf[OFF_MAGIC..OFF_MAGIC + 4] != DB_MAGIC {
            return Err(Error::new(ErrorCode::Corrupted));
        }
        let dbflg = DbFlags::from_bits_truncate(buf[OFF_DBFLG] as u32);
        let dbid = u32::from_le_bytes(buf[OFF_DBID..OFF_DBID + 4].try_into().unwrap());
        let next_db = u32::from_le_bytes(buf[OFF_NEXT..OFF_NEXT + 4].try_into().unwrap());
        let p0 = u32::from_le_bytes(buf[OFF_P0..OFF_P0 + 4].try_into().unwrap());
        let mut n = [0u32; NFWD];
        let mut lcnt = [0u32; NFWD];
        for i in 0..NFWD {
            let no = OFF_N + i * 4;
            n[i] = u32::from_le_bytes(buf[no..no + 4].try_into().unwrap());
            let lo = OFF_LCNT + i * 4;
            lcnt[i] = u32::from_le_bytes(buf[lo..lo + 4].try_into().unwrap());
        }
        Ok(DbRecord {
            addr,
            dbid,
            dbflg,
            next_db,
            p0,
            n,
            lcnt,
        })
    }

    pub fn write(&self, mmap: &MmapPool) -> Result<()> {
        let guard = mmap.acquire();
        let buf = guard.slice_mut(self.addr, DB_RECORD_SIZE as usize)?;
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(DB_MAGIC);
        buf[OFF_DBFLG] = self.dbflg.bits() as u8;
        buf[OFF_DBID..OFF_DBID + 4].copy_from_slice(&self.dbid.to_le_bytes());
        buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&self.next_db.to_le_bytes());
        buf[OFF_P0..OFF_P0 + 4].copy_from_slice(&self.p0.to_le_bytes());
        for i in 0..NFWD {
            let no = OFF_N + i * 4;
            buf[no..no + 4].copy_from_slice(&self.n[i].to_le_bytes());
            let lo = OFF_LCNT + i * 4;
            buf[lo..lo + 4].copy_from_slice(&self.lcnt[i].to_le_bytes());
        }
        Ok(())
    }

    pub fn next_db_addr(&self, block_size: u64) -> Option<u64> {
        blk_to_addr(self.next_db, block_size)
    }

    pub fn set_next_db_addr(&mut self, addr: Option<u64>, block_size: u64) {
        self.next_db = addr_to_blk(addr, block_size);
    }

    /// The level-0 tail: the last SBLK in this DB's chain.
    pub fn tail_addr(&self, block_size: u64) -> Option<u64> {
        blk_to_addr(self.p0, block_size)
    }

    pub fn set_tail_addr(&mut self, addr: Option<u64>, block_size: u64) {
        self.p0 = addr_to_blk(addr, block_size);
    }

    pub fn head_addr(&self, level: u8, block_size: u64) -> Option<u64> {
        blk_to_addr(self.n[level as usize], block_size)
    }

    pub fn set_head_addr(&mut self, level: u8, addr: Option<u64>, block_size: u64) {
        self.n[level as usize] = addr_to_blk(addr, block_size);
    }

    pub fn lcnt(&self, level: u8) -> u32 {
        self.lcnt[level as usize]
    }

    pub fn incr_lcnt(&mut self, level: u8) {
        self.lcnt[level as usize] += 1;
    }

    pub fn decr_lcnt(&mut self, level: u8) {
        self.lcnt[level as usize] = self.lcnt[level as usize].saturating_sub(1);
    }

    /// The highest level with at least one node, derived from `lcnt` rather
    /// than stored directly.
    pub fn top_level(&self) -> u8 {
        (0..NFWD as u8).rev().find(|&l| self.lcnt[l as usize] > 0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.p0 == 0
    }
}

struct DbHandle {
    addr: u64,
    closed: bool,
}

/// What the caller needs to complete an asynchronous reclaim after
/// `DbRegistry::destroy` has synchronously unlinked the record.
pub struct DestroyHandle {
    pub db_addr: u64,
    pub first_sblk_addr: Option<u64>,
}

/// The in-memory id → DB map, mirroring the on-disk chain rooted at the
/// file header's first-database offset.
#[derive(Default)]
pub struct DbRegistry {
    by_id: HashMap<DbId, DbHandle>,
    last_addr: Option<u64>,
}

impl DbRegistry {
    pub fn load(fsm: &Fsm) -> Result<DbRegistry> {
        let mut by_id = HashMap::new();
        let mut last_addr = None;
        let mut cur = if fsm.first_db_offset() == 0 {
            None
        } else {
            Some(fsm.first_db_offset())
        };
        while let Some(addr) = cur {
            let rec = DbRecord::read(fsm.mmap(), addr)?;
            cur = rec.next_db_addr(fsm.block_size());
            by_id.insert(rec.dbid, DbHandle { addr, closed: false });
            last_addr = Some(addr);
        }
        Ok(DbRegistry { by_id, last_addr })
    }

    pub fn addr_of(&self, id: DbId) -> Result<u64> {
        let handle = self.by_id.get(&id).ok_or_else(|| Error::new(ErrorCode::InvalidArgs))?;
        if handle.closed {
            return Err(Error::new(ErrorCode::InvalidState));
        }
        Ok(handle.addr)
    }

    /// Open an existing DB by id (checking `dbflg` compatibility) or create
    /// a fresh one if `id` hasn't been seen.
    pub fn open_or_create(&mut self, fsm: &mut Fsm, id: DbId, dbflg: DbFlags) -> Result<u64> {
        if let Some(handle) = self.by_id.get(&id) {
            if handle.closed {
                return Err(Error::new(ErrorCode::InvalidState));
            }
            let rec = DbRecord::read(fsm.mmap(), handle.addr)?;
            if rec.dbflg != dbflg {
                return Err(Error::new(ErrorCode::IncompatibleDbMode));
            }
            return Ok(handle.addr);
        }
        self.create(fsm, id, dbflg)
    }

    fn create(&mut self, fsm: &mut Fsm, id: DbId, dbflg: DbFlags) -> Result<u64> {
        let rec = DbRecord::create(fsm, id, dbflg)?;
        let addr = rec.addr;
        if let Some(last_addr) = self.last_addr {
            let mut last = DbRecord::read(fsm.mmap(), last_addr)?;
            last.set_next_db_addr(Some(addr), fsm.block_size());
            last.write(fsm.mmap())?;
        } else {
            fsm.set_first_db_offset(addr)?;
        }
        self.last_addr = Some(addr);
        self.by_id.insert(id, DbHandle { addr, closed: false });
        Ok(addr)
    }

    /// Synchronously unlink the DB from the chain and mark it closed;
    /// returns what the caller needs to reclaim its node chain on a
    /// background worker.
    pub fn destroy(&mut self, fsm: &mut Fsm, id: DbId) -> Result<DestroyHandle> {
        let addr = self.addr_of(id)?;
        let rec = DbRecord::read(fsm.mmap(), addr)?;
        let first_sblk_addr = rec.head_addr(0, fsm.block_size());

        let mut prev_addr = None;
        let mut cur = if fsm.first_db_offset() == 0 {
            None
        } else {
            Some(fsm.first_db_offset())
        };
        while let Some(c) = cur {
            if c == addr {
                break;
            }
            prev_addr = Some(c);
            let r = DbRecord::read(fsm.mmap(), c)?;
            cur = r.next_db_addr(fsm.block_size());
        }

        let next_addr = rec.next_db_addr(fsm.block_size());
        match prev_addr {
            Some(p) => {
                let mut prev = DbRecord::read(fsm.mmap(), p)?;
                prev.set_next_db_addr(next_addr, fsm.block_size());
                prev.write(fsm.mmap())?;
            }
            None => {
                fsm.set_first_db_offset(next_addr.unwrap_or(0))?;
            }
        }
        if self.last_addr == Some(addr) {
            self.last_addr = prev_addr;
        }
        self.by_id.get_mut(&id).unwrap().closed = true;
        debug!("db destroyed (unlinked) addr={} dbid={}", addr, id);
        Ok(DestroyHandle { db_addr: addr, first_sblk_addr })
    }

    /// Finish a destroy once the background reclaim of its node chain has
    /// completed: free the DB record block itself and drop it from the map.
    pub fn finish_reclaim(&mut self, fsm: &mut Fsm, id: DbId, db_addr: u64) -> Result<()> {
        fsm.deallocate(db_addr, round_up(DB_RECORD_SIZE, fsm.block_size()))?;
        self.by_id.remove(&id);
        Ok(())
    }
}

/// Walk a DB's level-0 chain from `first_sblk_addr`, deallocating every
/// SBLK and its KVBLK.
pub fn reclaim_chain(fsm: &mut Fsm, first_sblk_addr: Option<u64>) -> Result<()> {
    let block_size = fsm.block_size();
    let mut cur = first_sblk_addr;
    while let Some(addr) = cur {
        let sblk = Sblk::read(fsm.mmap(), addr)?;
        let kvblk_addr = sblk.kvblk_addr(block_size);
        let szpow = {
            let guard = fsm.mmap().acquire();
            guard.slice(kvblk_addr, 1)?[0]
        };
        cur = sblk.next_addr(0, block_size);
        fsm.deallocate(kvblk_addr, 1u64 << szpow)?;
        fsm.deallocate(addr, SBLK_SIZE)?;
    }
    Ok(())
}
