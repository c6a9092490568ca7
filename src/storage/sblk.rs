//! SBLK: a fixed 256-byte skip-list node carrying a sorted permutation of
//! pointers into exactly one KVBLK, plus forward/back pointers.
//!
//! Pointer fields (`p0`, `kvblk`, `n[..]`) are stored as 4-byte **block
//! numbers** rather than byte offsets; block number 0 doubles as the "no
//! pointer" sentinel, since block 0 is always the file header and can never
//! hold an SBLK.

use crate::error::{Error, ErrorCode, Result};
use crate::os::mmap::MmapPool;

pub const SBLK_SIZE: u64 = 256;
pub const MAX_LEVEL: u8 = 29;
pub const PI_CAP: usize = 32;
pub const NFWD: usize = 30;
pub const LK_CAP: usize = 64;

const FLAG_FULL_LKEY: u8 = 0x01;

const OFF_FLAGS: usize = 0;
const OFF_LEVEL: usize = 1;
const OFF_LKL: usize = 2;
const OFF_PNUM: usize = 3;
const OFF_P0: usize = 4;
const OFF_KVBLK: usize = 8;
const OFF_PI: usize = 12;
const OFF_N: usize = OFF_PI + PI_CAP; // 44
const OFF_LK: usize = 192;

/// A skip-list index node.
#[derive(Debug, Clone)]
pub struct Sblk {
    pub addr: u64,
    pub flags: u8,
    pub level: u8,
    pub lkl: u8,
    pub pnum: u8,
    p0: u32,
    kvblk: u32,
    pub pi: [u8; PI_CAP],
    n: [u32; NFWD],
    lk: [u8; LK_CAP],
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

impl Sblk {
    pub fn empty(addr: u64, level: u8, kvblk_addr: u64, block_size: u64) -> Sblk {
        Sblk {
            addr,
            flags: 0,
            level,
            lkl: 0,
            pnum: 0,
            p0: 0,
            kvblk: addr_to_blk(Some(kvblk_addr), block_size),
            pi: [0; PI_CAP],
            n: [0; NFWD],
            lk: [0; LK_CAP],
        }
    }

    pub fn read(mmap: &MmapPool, addr: u64) -> Result<Sblk> {
        let guard = mmap.acquire();
        let buf = guard.slice(addr, SBLK_SIZE as usize)?;
        let level = buf[OFF_LEVEL];
        let pnum = buf[OFF_PNUM];
        if level > MAX_LEVEL || pnum as usize > PI_CAP {
            return Err(Error::new(ErrorCode::Corrupted));
        }
        let mut pi = [0u8; PI_CAP];
        pi.copy_from_slice(&buf[OFF_PI..OFF_PI + PI_CAP]);
        let mut n = [0u32; NFWD];
        for i in 0..NFWD {
            let o = OFF_N + i * 4;
            n[i] = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        }
        let mut lk = [0u8; LK_CAP];
        lk.copy_from_slice(&buf[OFF_LK..OFF_LK + LK_CAP]);
        Ok(Sblk {
            addr,
            flags: buf[OFF_FLAGS],
            level,
            lkl: buf[OFF_LKL],
            pnum,
            p0: u32::from_le_bytes(buf[OFF_P0..OFF_P0 + 4].try_into().unwrap()),
            kvblk: u32::from_le_bytes(buf[OFF_KVBLK..OFF_KVBLK + 4].try_into().unwrap()),
            pi,
            n,
            lk,
        })
    }

    pub fn write(&self, mmap: &MmapPool) -> Result<()> {
        let guard = mmap.acquire();
        let buf = guard.slice_mut(self.addr, SBLK_SIZE as usize)?;
        buf.fill(0);
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_LEVEL] = self.level;
        buf[OFF_LKL] = self.lkl;
        buf[OFF_PNUM] = self.pnum;
        buf[OFF_P0..OFF_P0 + 4].copy_from_slice(&self.p0.to_le_bytes());
        buf[OFF_KVBLK..OFF_KVBLK + 4].copy_from_slice(&self.kvblk.to_le_bytes());
        buf[OFF_PI..OFF_PI + PI_CAP].copy_from_slice(&self.pi);
        for i in 0..NFWD {
            let o = OFF_N + i * 4;
            buf[o..o + 4].copy_from_slice(&self.n[i].to_le_bytes());
        }
        buf[OFF_LK..OFF_LK + LK_CAP].copy_from_slice(&self.lk);
        Ok(())
    }

    pub fn kvblk_addr(&self, block_size: u64) -> u64 {
        blk_to_addr(self.kvblk, block_size).expect("sblk always owns a kvblk")
    }

    pub fn set_kvblk_addr(&mut self, addr: u64, block_size: u64) {
        self.kvblk = addr_to_blk(Some(addr), block_size);
    }

    pub fn p0_addr(&self, block_size: u64) -> Option<u64> {
        blk_to_addr(self.p0, block_size)
    }

    pub fn set_p0_addr(&mut self, addr: Option<u64>, block_size: u64) {
        self.p0 = addr_to_blk(addr, block_size);
    }

    pub fn next_addr(&self, level: u8, block_size: u64) -> Option<u64> {
        blk_to_addr(self.n[level as usize], block_size)
    }

    pub fn set_next_addr(&mut self, level: u8, addr: Option<u64>, block_size: u64) {
        self.n[level as usize] = addr_to_blk(addr, block_size);
    }

    pub fn is_full_lkey(&self) -> bool {
        self.flags & FLAG_FULL_LKEY != 0
    }

    pub fn lowest_key_prefix(&self) -> &[u8] {
        &self.lk[..self.lkl as usize]
    }

    /// Refresh the cached lowest-key prefix from the node's actual lowest
    /// key (`pi[0]`'s key). If it fits in 64 bytes, `lk` is authoritative
    /// (`FULL_LKEY` set); otherwise it's only a fast-reject prefix.
    pub fn set_lowest_key(&mut self, key: &[u8]) {
        self.lk = [0u8; LK_CAP];
        if key.len() <= LK_CAP {
            self.lk[..key.len()].copy_from_slice(key);
            self.lkl = key.len() as u8;
            self.flags |= FLAG_FULL_LKEY;
        } else {
            self.lk.copy_from_slice(&key[..LK_CAP]);
            self.lkl = LK_CAP as u8;
            self.flags &= !FLAG_FULL_LKEY;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pnum == 0
    }

    pub fn is_full(&self) -> bool {
        self.pnum as usize == PI_CAP
    }

    /// Insert persisted slot `slot_idx` into `pi` at `pos`, shifting the
    /// tail right.
    pub fn insert_pi(&mut self, pos: usize, slot_idx: u8) {
        debug_assert!(pos <= self.pnum as usize);
        for i in (pos..self.pnum as usize).rev() {
            self.pi[i + 1] = self.pi[i];
        }
        self.pi[pos] = slot_idx;
        self.pnum += 1;
    }

    /// Remove the entry at `pos`, shifting the tail left.
    pub fn remove_pi(&mut self, pos: usize) {
        debug_assert!(pos < self.pnum as usize);
        for i in pos..self.pnum as usize - 1 {
            self.pi[i] = self.pi[i + 1];
        }
        self.pnum -= 1;
    }
}
