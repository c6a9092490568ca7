//! Forward/reverse cursors over one database's skip list, plus dup-mode iteration (SPEC_FULL.md §F).
//!
//! A cursor owns just a state enum — `BeforeFirst`, `AfterLast`, or a
//! `(node addr, slot)` position — and re-derives everything else by reading
//! through the `Fsm`/`DbRecord` passed to it on each call, matching how the
//! rest of this layer treats on-disk structures as cheap to reload rather
//! than holding long-lived borrows.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::db::DbRecord;
use crate::storage::fsm::Fsm;
use crate::storage::kvblk::{dup, Kvblk};
use crate::storage::sblk::Sblk;
use crate::storage::skiplist;
use crate::types::{DupWidth, KeyMode, OpFlags};

/// The operation passed to `cursor_open`/`cursor_to`/`cursor_to_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    BeforeFirst,
    AfterLast,
    Next,
    Prev,
    Eq,
    Ge,
}

#[derive(Debug, Clone, Copy)]
enum State {
    BeforeFirst,
    AfterLast,
    At(u64, usize),
    Closed,
}

/// A cursor over one database's ordered key space.
pub struct Cursor {
    state: State,
}

impl Cursor {
    /// `cursor_open(db, op, key?)`.
    pub fn open(fsm: &Fsm, db: &DbRecord, mode: KeyMode, op: CursorOp, key: Option<&[u8]>) -> Result<Cursor> {
        let mut cur = Cursor { state: State::BeforeFirst };
        cur.to(fsm, db, mode, op, key)?;
        Ok(cur)
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    fn ensure_open(&self) -> Result<()> {
        if matches!(self.state, State::Closed) {
            return Err(Error::new(ErrorCode::InvalidState));
        }
        Ok(())
    }

    /// `cursor_to(cur, op)` for ops that take no key (`BEFORE_FIRST`,
    /// `AFTER_LAST`, `NEXT`, `PREV`); `cursor_to_key(cur, op, key)` for `EQ`/`GE`.
    pub fn to(&mut self, fsm: &Fsm, db: &DbRecord, mode: KeyMode, op: CursorOp, key: Option<&[u8]>) -> Result<()> {
        self.ensure_open()?;
        self.state = match op {
            CursorOp::BeforeFirst => State::BeforeFirst,
            CursorOp::AfterLast => State::AfterLast,
            CursorOp::Next => self.advance_next(fsm, db)?,
            CursorOp::Prev => self.advance_prev(fsm, db)?,
            CursorOp::Eq => {
                let key = key.ok_or_else(|| Error::new(ErrorCode::InvalidArgs))?;
                self.locate_eq(fsm, db, mode, key)?
            }
            CursorOp::Ge => {
                let key = key.ok_or_else(|| Error::new(ErrorCode::InvalidArgs))?;
                self.locate_ge(fsm, db, mode, key)?
            }
        };
        Ok(())
    }

    fn advance_next(&self, fsm: &Fsm, db: &DbRecord) -> Result<State> {
        let next = match self.state {
            State::BeforeFirst => skiplist::first(fsm, db)?,
            State::AfterLast => None,
            State::At(addr, slot) => skiplist::next(fsm, addr, slot)?,
            State::Closed => unreachable!("checked by ensure_open"),
        };
        Ok(match next {
            Some((addr, slot)) => State::At(addr, slot),
            None => State::AfterLast,
        })
    }

    fn advance_prev(&self, fsm: &Fsm, db: &DbRecord) -> Result<State> {
        let prev = match self.state {
            State::AfterLast => skiplist::last(fsm, db)?,
            State::BeforeFirst => None,
            State::At(addr, slot) => skiplist::prev(fsm, addr, slot)?,
            State::Closed => unreachable!("checked by ensure_open"),
        };
        Ok(match prev {
            Some((addr, slot)) => State::At(addr, slot),
            None => State::BeforeFirst,
        })
    }

    fn locate_eq(&self, fsm: &Fsm, db: &DbRecord, mode: KeyMode, key: &[u8]) -> Result<State> {
        match skiplist::seek_ge(fsm, db, mode, key)? {
            Some((addr, slot)) => {
                let (found_key, _) = skiplist::read_at(fsm, addr, slot)?;
                if crate::types::compare_keys(mode, &found_key, key)? == std::cmp::Ordering::Equal {
                    Ok(State::At(addr, slot))
                } else {
                    Err(Error::new(ErrorCode::NotFound))
                }
            }
            None => Err(Error::new(ErrorCode::NotFound)),
        }
    }

    fn locate_ge(&self, fsm: &Fsm, db: &DbRecord, mode: KeyMode, key: &[u8]) -> Result<State> {
        match skiplist::seek_ge(fsm, db, mode, key)? {
            Some((addr, slot)) => Ok(State::At(addr, slot)),
            None => Ok(State::AfterLast),
        }
    }

    /// `cursor_get`: the key/value at the current position.
    pub fn get(&self, fsm: &Fsm) -> Result<(Vec<u8>, Vec<u8>)> {
        self.ensure_open()?;
        match self.state {
            State::At(addr, slot) => skiplist::read_at(fsm, addr, slot),
            _ => Err(Error::new(ErrorCode::InvalidState)),
        }
    }

    /// `cursor_set`: overwrite the value at the current position in place.
    pub fn set(&mut self, fsm: &mut Fsm, val: &[u8], opflags: OpFlags) -> Result<()> {
        self.ensure_open()?;
        let State::At(addr, slot) = self.state else {
            return Err(Error::new(ErrorCode::InvalidState));
        };
        if opflags.contains(OpFlags::NO_OVERWRITE) {
            return Err(Error::new(ErrorCode::KeyExists));
        }
        let mut sblk = Sblk::read(fsm.mmap(), addr)?;
        if slot >= sblk.pnum as usize {
            return Err(Error::new(ErrorCode::OutOfBounds));
        }
        let mut kvblk = Kvblk::at(fsm.mmap(), sblk.kvblk_addr(fsm.block_size()))?;
        let persisted = sblk.pi[slot];
        let new_idx = kvblk.updatekv(fsm, persisted, val)?;
        if new_idx != persisted {
            sblk.pi[slot] = new_idx;
            sblk.write(fsm.mmap())?;
        }
        Ok(())
    }

    fn current_value(&self, fsm: &Fsm) -> Result<(u64, usize, Vec<u8>)> {
        self.ensure_open()?;
        let State::At(addr, slot) = self.state else {
            return Err(Error::new(ErrorCode::InvalidState));
        };
        let (_, val) = skiplist::read_at(fsm, addr, slot)?;
        Ok((addr, slot, val))
    }

    fn write_current_value(&self, fsm: &mut Fsm, addr: u64, slot: usize, new_val: &[u8]) -> Result<()> {
        let mut sblk = Sblk::read(fsm.mmap(), addr)?;
        let mut kvblk = Kvblk::at(fsm.mmap(), sblk.kvblk_addr(fsm.block_size()))?;
        let persisted = sblk.pi[slot];
        let new_idx = kvblk.updatekv(fsm, persisted, new_val)?;
        if new_idx != persisted {
            sblk.pi[slot] = new_idx;
            sblk.write(fsm.mmap())?;
        }
        Ok(())
    }

    /// `cursor_dup_add`: add `id` to the dup-value set at the current key.
    pub fn dup_add(&self, fsm: &mut Fsm, width: DupWidth, id: u64) -> Result<()> {
        let (addr, slot, val) = self.current_value(fsm)?;
        let updated = dup::add(&val, width, id)?;
        self.write_current_value(fsm, addr, slot, &updated)
    }

    /// `cursor_dup_rm`: remove `id` from the dup-value set at the current key.
    pub fn dup_rm(&self, fsm: &mut Fsm, width: DupWidth, id: u64) -> Result<()> {
        let (addr, slot, val) = self.current_value(fsm)?;
        let updated = dup::remove(&val, width, id)?;
        self.write_current_value(fsm, addr, slot, &updated)
    }

    /// `cursor_dup_num`.
    pub fn dup_num(&self, fsm: &Fsm, _width: DupWidth) -> Result<u32> {
        let (_, _, val) = self.current_value(fsm)?;
        dup::count(&val)
    }

    /// `cursor_dup_contains`.
    pub fn dup_contains(&self, fsm: &Fsm, width: DupWidth, id: u64) -> Result<bool> {
        let (_, _, val) = self.current_value(fsm)?;
        dup::contains(&val, width, id)
    }

    /// `cursor_dup_iter`: an iterator over the dup-value set's ids in
    /// ascending order.
    pub fn dup_iter(&self, fsm: &Fsm, width: DupWidth) -> Result<DupIter> {
        let (_, _, val) = self.current_value(fsm)?;
        let ids = dup::ids(&val, width)?;
        Ok(DupIter { ids, pos: 0 })
    }
}

/// Ascending iterator over one key's dup-value id set.
pub struct DupIter {
    ids: Vec<u64>,
    pos: usize,
}

impl Iterator for DupIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let id = *self.ids.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::unix::UnixFile;
    use crate::random::EngineRng;
    use crate::storage::fsm::FsmOpenOptions;
    use crate::types::DbFlags;
    use std::sync::Arc;

    fn fresh() -> (tempfile::TempDir, Fsm, DbRecord) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        let file: Arc<dyn crate::os::file::RawFile> =
            Arc::new(UnixFile::open(&path, true, false).unwrap());
        let mut fsm = Fsm::open(
            file,
            FsmOpenOptions {
                create: true,
                ..Default::default()
            },
        )
        .unwrap();
        let db = DbRecord::create(&mut fsm, 1, DbFlags::empty()).unwrap();
        (dir, fsm, db)
    }

    fn seed_keys(fsm: &mut Fsm, db: &mut DbRecord, n: u32) {
        let mut rng = EngineRng::new();
        rng.seed(b"cursor test seed");
        for i in 0..n {
            let bytes = i.to_be_bytes();
            skiplist::insert(fsm, &mut rng, db, KeyMode::U32, &bytes, b"v", OpFlags::empty()).unwrap();
        }
    }

    #[test]
    fn before_first_then_next_walks_forward() {
        let (_dir, mut fsm, mut db) = fresh();
        seed_keys(&mut fsm, &mut db, 5);
        let mut cur = Cursor::open(&fsm, &db, KeyMode::U32, CursorOp::BeforeFirst, None).unwrap();
        let mut seen = Vec::new();
        loop {
            cur.to(&fsm, &db, KeyMode::U32, CursorOp::Next, None).unwrap();
            match cur.get(&fsm) {
                Ok((k, _)) => seen.push(u32::from_be_bytes(k.try_into().unwrap())),
                Err(e) => {
                    assert_eq!(e.code(), ErrorCode::InvalidState);
                    break;
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn after_last_then_prev_walks_backward() {
        let (_dir, mut fsm, mut db) = fresh();
        seed_keys(&mut fsm, &mut db, 5);
        let mut cur = Cursor::open(&fsm, &db, KeyMode::U32, CursorOp::AfterLast, None).unwrap();
        let mut seen = Vec::new();
        loop {
            cur.to(&fsm, &db, KeyMode::U32, CursorOp::Prev, None).unwrap();
            match cur.get(&fsm) {
                Ok((k, _)) => seen.push(u32::from_be_bytes(k.try_into().unwrap())),
                Err(_) => break,
            }
        }
        assert_eq!(seen, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn eq_on_missing_key_is_not_found() {
        let (_dir, mut fsm, mut db) = fresh();
        seed_keys(&mut fsm, &mut db, 3);
        let err = Cursor::open(&fsm, &db, KeyMode::U32, CursorOp::Eq, Some(&99u32.to_be_bytes())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn ge_lands_on_next_key_when_exact_is_absent() {
        let (_dir, mut fsm, mut db) = fresh();
        let mut rng = EngineRng::new();
        rng.seed(b"ge test");
        skiplist::insert(&mut fsm, &mut rng, &mut db, KeyMode::U32, &10u32.to_be_bytes(), b"v", OpFlags::empty()).unwrap();
        skiplist::insert(&mut fsm, &mut rng, &mut db, KeyMode::U32, &20u32.to_be_bytes(), b"v", OpFlags::empty()).unwrap();
        let cur = Cursor::open(&fsm, &db, KeyMode::U32, CursorOp::Ge, Some(&15u32.to_be_bytes())).unwrap();
        let (k, _) = cur.get(&fsm).unwrap();
        assert_eq!(u32::from_be_bytes(k.try_into().unwrap()), 20);
    }

    #[test]
    fn cursor_set_overwrites_value_at_position() {
        let (_dir, mut fsm, mut db) = fresh();
        seed_keys(&mut fsm, &mut db, 3);
        let mut cur = Cursor::open(&fsm, &db, KeyMode::U32, CursorOp::Eq, Some(&1u32.to_be_bytes())).unwrap();
        cur.set(&mut fsm, b"updated", OpFlags::empty()).unwrap();
        assert_eq!(cur.get(&fsm).unwrap().1, b"updated");
    }

    #[test]
    fn dup_add_rm_and_iter() {
        let (_dir, mut fsm, mut db) = fresh();
        let mut rng = EngineRng::new();
        rng.seed(b"dup test");
        skiplist::insert(&mut fsm, &mut rng, &mut db, KeyMode::Bytes, b"k", &dup::empty_value(), OpFlags::empty()).unwrap();
        let cur = Cursor::open(&fsm, &db, KeyMode::Bytes, CursorOp::Eq, Some(b"k")).unwrap();
        cur.dup_add(&mut fsm, DupWidth::U32, 7).unwrap();
        cur.dup_add(&mut fsm, DupWidth::U32, 3).unwrap();
        cur.dup_add(&mut fsm, DupWidth::U32, 7).unwrap();
        assert_eq!(cur.dup_num(&fsm, DupWidth::U32).unwrap(), 2);
        assert!(cur.dup_contains(&fsm, DupWidth::U32, 3).unwrap());
        let ids: Vec<u64> = cur.dup_iter(&fsm, DupWidth::U32).unwrap().collect();
        assert_eq!(ids, vec![3, 7]);
        cur.dup_rm(&mut fsm, DupWidth::U32, 3).unwrap();
        assert!(!cur.dup_contains(&fsm, DupWidth::U32, 3).unwrap());
    }
}
