//! `Engine`: the single entry point that owns the open file, the free-space
//! manager, and the database registry.
//!
//! Lock discipline: the engine-wide `RwLock<EngineInner>` is held in read
//! mode for every call except `close` and `db_destroy`, which need exclusive
//! access to drain background workers and trim the file. Read mode alone
//! doesn't grant mutable access to the `Fsm`/`DbRegistry`, so each gets its
//! own inner `RwLock`, acquired while only holding the outer lock for read —
//! this is what lets writes to different databases proceed independently
//! instead of serialising on one engine-wide write lock. The optional
//! per-database lock is layered on top of the outer engine lock, always
//! acquired in that order: engine, then database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use log::{info, warn};

use crate::error::{Error, ErrorCode, MessageRegistry, Result};
use crate::os::file::RawFile;
use crate::os::unix::UnixFile;
use crate::random::EngineRng;
use crate::storage::cursor::{Cursor, CursorOp, DupIter};
use crate::storage::db::{self, DbRecord, DbRegistry};
use crate::storage::fsm::{Fsm, FsmOpenOptions, FsmStats};
use crate::storage::skiplist;
use crate::types::{DbFlags, DbId, DupWidth, EngineOpenFlags, KeyMode, OpFlags, SyncFlags};

struct EngineInner {
    fsm: RwLock<Fsm>,
    registry: RwLock<DbRegistry>,
}

/// The per-database half of the lock pair. Carries no data of its
/// own — the `DbRecord` itself is always reloaded from the mapping, the way
/// every other layer in this engine treats on-disk structures — it exists
/// only to serialize concurrent mutations to one database's skip list.
struct DbSlot {
    lock: RwLock<()>,
}

/// Tracks in-flight background reclaim workers spawned by `db_destroy`, so
/// `close` can wait for them to finish before the file goes away.
struct ReclaimTracker {
    count: Mutex<u32>,
    cv: Condvar,
}

impl ReclaimTracker {
    fn new() -> Self {
        ReclaimTracker {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn begin(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cv.wait(count).unwrap();
        }
    }
}

/// An open handle to one database file. Cheap to clone: every field is
/// `Arc`-backed, so a clone is just a new set of shared-ownership handles
/// onto the same live engine, the way the background reclaim worker needs
/// one to outlive the call that spawned it.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
    dbs: Arc<Mutex<HashMap<DbId, Arc<DbSlot>>>>,
    rng: Arc<Mutex<EngineRng>>,
    messages: Arc<MessageRegistry>,
    flags: EngineOpenFlags,
    reclaim: Arc<ReclaimTracker>,
}

/// Options accepted by `Engine::open`, beyond the bit flags.
pub struct EngineOpenOptions {
    pub block_power: Option<u8>,
    pub random_seed: Option<Vec<u8>>,
    pub strict: bool,
}

impl Default for EngineOpenOptions {
    fn default() -> Self {
        EngineOpenOptions {
            block_power: None,
            random_seed: None,
            strict: false,
        }
    }
}

/// A live cursor returned by `Engine::cursor_open`, bound to one database
/// and key mode for its lifetime.
pub struct EngineCursor {
    db: DbId,
    mode: KeyMode,
    dup_width: Option<DupWidth>,
    cursor: Cursor,
}

impl Engine {
    /// `Engine::init`/`open`: open (creating if requested by
    /// `EngineOpenFlags::TRUNC` or a missing file) the backing file and
    /// bring up the FSM and database registry.
    pub fn open(path: &Path, flags: EngineOpenFlags, opts: EngineOpenOptions) -> Result<Engine> {
        let readonly = flags.contains(EngineOpenFlags::RDONLY);
        let create = flags.contains(EngineOpenFlags::TRUNC) || !path.exists();
        let file: Arc<dyn RawFile> = Arc::new(UnixFile::open(path, create && !readonly, readonly)?);
        file.lock(!readonly)?;

        let fsm = Fsm::open(
            file,
            FsmOpenOptions {
                create,
                block_power: opts.block_power,
                readonly,
                strict: opts.strict,
                extra_header_len: 0,
            },
        )?;
        let registry = DbRegistry::load(&fsm)?;

        info!("engine opened: {} (readonly={})", path.display(), readonly);

        Ok(Engine {
            inner: Arc::new(RwLock::new(EngineInner {
                fsm: RwLock::new(fsm),
                registry: RwLock::new(registry),
            })),
            dbs: Arc::new(Mutex::new(HashMap::new())),
            rng: Arc::new(Mutex::new(EngineRng::seeded(opts.random_seed.as_deref()))),
            messages: Arc::new(MessageRegistry::new()),
            flags,
            reclaim: Arc::new(ReclaimTracker::new()),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.flags.contains(EngineOpenFlags::RDONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        Ok(())
    }

    fn slot(&self, id: DbId) -> Result<Arc<DbSlot>> {
        self.dbs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorCode::InvalidState))
    }

    fn per_db_locks_enabled(&self) -> bool {
        !self.flags.contains(EngineOpenFlags::NOLOCKS)
    }

    /// `Engine::db`: open an existing database by id, or create
    /// one with `dbflg` if `id` hasn't been seen. A mismatched `dbflg` on
    /// an existing database fails with `IncompatibleDbMode`.
    pub fn db(&self, id: DbId, dbflg: DbFlags) -> Result<()> {
        {
            let inner = self.inner.read().unwrap();
            let mut fsm = inner.fsm.write().unwrap();
            let mut registry = inner.registry.write().unwrap();
            registry.open_or_create(&mut fsm, id, dbflg)?;
        }
        self.dbs
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(DbSlot { lock: RwLock::new(()) }));
        Ok(())
    }

    /// `Engine::db_destroy`: synchronously unlink the
    /// database, then reclaim its skip-list nodes on a background thread so
    /// the caller isn't blocked walking a potentially large chain.
    pub fn db_destroy(&self, id: DbId) -> Result<()> {
        self.check_writable()?;
        let destroy_handle = {
            let mut inner = self.inner.write().unwrap();
            let fsm = inner.fsm.get_mut().unwrap();
            let registry = inner.registry.get_mut().unwrap();
            registry.destroy(fsm, id)?
        };
        self.dbs.lock().unwrap().remove(&id);

        let inner = Arc::clone(&self.inner);
        let reclaim = Arc::clone(&self.reclaim);
        reclaim.begin();
        std::thread::spawn(move || {
            let result = {
                let mut guard = inner.write().unwrap();
                let fsm = guard.fsm.get_mut().unwrap();
                db::reclaim_chain(fsm, destroy_handle.first_sblk_addr).and_then(|_| {
                    guard
                        .registry
                        .get_mut()
                        .unwrap()
                        .finish_reclaim(fsm, id, destroy_handle.db_addr)
                })
            };
            if let Err(e) = result {
                warn!("background reclaim failed for db {}: {}", id, e);
            }
            reclaim.finish();
        });
        Ok(())
    }

    /// `Engine::put`.
    pub fn put(&self, id: DbId, key: &[u8], val: &[u8], opflags: OpFlags) -> Result<()> {
        self.check_writable()?;
        let slot = self.slot(id)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.write().unwrap());
        let addr = inner.registry.read().unwrap().addr_of(id)?;
        let mut fsm = inner.fsm.write().unwrap();
        let mut db_rec = DbRecord::read(fsm.mmap(), addr)?;
        let mode = db_rec.dbflg.key_mode();
        let mut rng = self.rng.lock().unwrap();
        skiplist::insert(&mut fsm, &mut rng, &mut db_rec, mode, key, val, opflags)?;
        if opflags.contains(OpFlags::SYNC) {
            fsm.sync(SyncFlags::FSYNC)?;
        }
        Ok(())
    }

    /// `Engine::get`. Read-only: the engine lock, the database's internal
    /// locks, and (unless disabled) the per-database lock are all taken in
    /// read mode, so concurrent reads never block each other.
    pub fn get(&self, id: DbId, key: &[u8]) -> Result<Vec<u8>> {
        let slot = self.slot(id)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.read().unwrap());
        let addr = inner.registry.read().unwrap().addr_of(id)?;
        let fsm = inner.fsm.read().unwrap();
        let db_rec = DbRecord::read(fsm.mmap(), addr)?;
        skiplist::get(&fsm, &db_rec, db_rec.dbflg.key_mode(), key)
    }

    /// `Engine::del`.
    pub fn del(&self, id: DbId, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let slot = self.slot(id)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.write().unwrap());
        let addr = inner.registry.read().unwrap().addr_of(id)?;
        let mut fsm = inner.fsm.write().unwrap();
        let mut db_rec = DbRecord::read(fsm.mmap(), addr)?;
        let mode = db_rec.dbflg.key_mode();
        skiplist::delete(&mut fsm, &mut db_rec, mode, key)
    }

    /// `Engine::cursor_open`.
    pub fn cursor_open(&self, id: DbId, op: CursorOp, key: Option<&[u8]>) -> Result<EngineCursor> {
        let slot = self.slot(id)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.read().unwrap());
        let addr = inner.registry.read().unwrap().addr_of(id)?;
        let fsm = inner.fsm.read().unwrap();
        let db_rec = DbRecord::read(fsm.mmap(), addr)?;
        let mode = db_rec.dbflg.key_mode();
        let dup_width = db_rec.dbflg.dup_width();
        let cursor = Cursor::open(&fsm, &db_rec, mode, op, key)?;
        Ok(EngineCursor {
            db: id,
            mode,
            dup_width,
            cursor,
        })
    }

    pub fn cursor_close(&self, cursor: &mut EngineCursor) {
        cursor.cursor.close();
    }

    /// `Engine::cursor_to` (no key: `BEFORE_FIRST`/`AFTER_LAST`/`NEXT`/`PREV`).
    pub fn cursor_to(&self, cursor: &mut EngineCursor, op: CursorOp) -> Result<()> {
        let slot = self.slot(cursor.db)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.read().unwrap());
        let addr = inner.registry.read().unwrap().addr_of(cursor.db)?;
        let fsm = inner.fsm.read().unwrap();
        let db_rec = DbRecord::read(fsm.mmap(), addr)?;
        cursor.cursor.to(&fsm, &db_rec, cursor.mode, op, None)
    }

    /// `Engine::cursor_to_key` (`EQ`/`GE`, with a key).
    pub fn cursor_to_key(&self, cursor: &mut EngineCursor, op: CursorOp, key: &[u8]) -> Result<()> {
        let slot = self.slot(cursor.db)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.read().unwrap());
        let addr = inner.registry.read().unwrap().addr_of(cursor.db)?;
        let fsm = inner.fsm.read().unwrap();
        let db_rec = DbRecord::read(fsm.mmap(), addr)?;
        cursor.cursor.to(&fsm, &db_rec, cursor.mode, op, Some(key))
    }

    /// `Engine::cursor_get`.
    pub fn cursor_get(&self, cursor: &EngineCursor) -> Result<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read().unwrap();
        let fsm = inner.fsm.read().unwrap();
        cursor.cursor.get(&fsm)
    }

    /// `Engine::cursor_set`: overwrite the value at the cursor's current
    /// position.
    pub fn cursor_set(&self, cursor: &mut EngineCursor, val: &[u8], opflags: OpFlags) -> Result<()> {
        self.check_writable()?;
        let slot = self.slot(cursor.db)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.write().unwrap());
        let mut fsm = inner.fsm.write().unwrap();
        cursor.cursor.set(&mut fsm, val, opflags)
    }

    fn dup_width(&self, cursor: &EngineCursor) -> Result<DupWidth> {
        cursor.dup_width.ok_or_else(|| Error::new(ErrorCode::IncompatibleDbMode))
    }

    /// `Engine::cursor_dup_add`.
    pub fn cursor_dup_add(&self, cursor: &mut EngineCursor, id: u64) -> Result<()> {
        self.check_writable()?;
        let width = self.dup_width(cursor)?;
        let slot = self.slot(cursor.db)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.write().unwrap());
        let mut fsm = inner.fsm.write().unwrap();
        cursor.cursor.dup_add(&mut fsm, width, id)
    }

    /// `Engine::cursor_dup_rm`.
    pub fn cursor_dup_rm(&self, cursor: &mut EngineCursor, id: u64) -> Result<()> {
        self.check_writable()?;
        let width = self.dup_width(cursor)?;
        let slot = self.slot(cursor.db)?;
        let inner = self.inner.read().unwrap();
        let _db_guard = self.per_db_locks_enabled().then(|| slot.lock.write().unwrap());
        let mut fsm = inner.fsm.write().unwrap();
        cursor.cursor.dup_rm(&mut fsm, width, id)
    }

    /// `Engine::cursor_dup_num`.
    pub fn cursor_dup_num(&self, cursor: &EngineCursor) -> Result<u32> {
        let width = self.dup_width(cursor)?;
        let inner = self.inner.read().unwrap();
        let fsm = inner.fsm.read().unwrap();
        cursor.cursor.dup_num(&fsm, width)
    }

    /// `Engine::cursor_dup_contains`.
    pub fn cursor_dup_contains(&self, cursor: &EngineCursor, id: u64) -> Result<bool> {
        let width = self.dup_width(cursor)?;
        let inner = self.inner.read().unwrap();
        let fsm = inner.fsm.read().unwrap();
        cursor.cursor.dup_contains(&fsm, width, id)
    }

    /// `Engine::cursor_dup_iter` (SPEC_FULL.md §F): the dup-value set at the
    /// cursor's current key, collected up front since the iterator can't
    /// outlive the read-lock guard it would otherwise need to borrow.
    pub fn cursor_dup_iter(&self, cursor: &EngineCursor) -> Result<DupIter> {
        let width = self.dup_width(cursor)?;
        let inner = self.inner.read().unwrap();
        let fsm = inner.fsm.read().unwrap();
        cursor.cursor.dup_iter(&fsm, width)
    }

    /// `Engine::sync`.
    pub fn sync(&self, flags: SyncFlags) -> Result<()> {
        let inner = self.inner.read().unwrap();
        let mut fsm = inner.fsm.write().unwrap();
        fsm.sync(flags)
    }

    /// `Engine::close`: wait for any background reclaim workers
    /// to drain, trim the file to its last allocated block, flush, and
    /// release the advisory lock.
    pub fn close(&self) -> Result<()> {
        self.reclaim.wait_idle();
        let mut inner = self.inner.write().unwrap();
        let fsm = inner.fsm.get_mut().unwrap();
        fsm.trim_tail()?;
        fsm.sync(SyncFlags::FSYNC)?;
        fsm.unlock()?;
        info!("engine closed");
        Ok(())
    }

    /// `Engine::stats` (SPEC_FULL.md §F): a read-only snapshot of the FSM's
    /// allocation statistics, useful for diagnostics/metrics without
    /// exposing the FSM itself.
    pub fn stats(&self) -> Result<FsmStats> {
        let inner = self.inner.read().unwrap();
        let fsm = inner.fsm.read().unwrap();
        fsm.stats()
    }

    /// `Engine::set_message_hook` (SPEC_FULL.md §A): override the default
    /// message text for `code`, the way `sqlite3_config_log`'s registration
    /// hook does but scoped to this engine instance instead of a process
    /// global.
    pub fn set_message_hook(&self, code: ErrorCode, message: impl Into<String>) {
        self.messages.register(code, message);
    }

    /// The (possibly overridden) message for `code`, as it would be
    /// reported to a caller surfacing this engine's errors.
    pub fn message_for(&self, code: ErrorCode) -> String {
        self.messages.message_for(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> Engine {
        let path = dir.path().join("data.db");
        Engine::open(&path, EngineOpenFlags::empty(), EngineOpenOptions::default()).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.db(1, DbFlags::empty()).unwrap();
        engine.put(1, b"k", b"v", OpFlags::empty()).unwrap();
        assert_eq!(engine.get(1, b"k").unwrap(), b"v");
    }

    #[test]
    fn get_from_unopened_db_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        let err = engine.get(7, b"k").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn del_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.db(1, DbFlags::empty()).unwrap();
        engine.put(1, b"k", b"v", OpFlags::empty()).unwrap();
        engine.del(1, b"k").unwrap();
        assert_eq!(engine.get(1, b"k").unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn readonly_engine_rejects_put() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(&dir);
            engine.db(1, DbFlags::empty()).unwrap();
            engine.close().unwrap();
        }
        let path = dir.path().join("data.db");
        let engine = Engine::open(&path, EngineOpenFlags::RDONLY, EngineOpenOptions::default()).unwrap();
        engine.db(1, DbFlags::empty()).unwrap();
        let err = engine.put(1, b"k", b"v", OpFlags::empty()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReadOnly);
    }

    #[test]
    fn db_destroy_then_reopen_loses_data() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.db(1, DbFlags::empty()).unwrap();
        engine.put(1, b"k", b"v", OpFlags::empty()).unwrap();
        engine.db_destroy(1).unwrap();
        engine.reclaim.wait_idle();
        engine.db(1, DbFlags::empty()).unwrap();
        assert_eq!(engine.get(1, b"k").unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn cursor_walks_inserted_keys_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.db(1, DbFlags::UINT32_KEYS).unwrap();
        for i in [3u32, 1, 2] {
            engine.put(1, &i.to_be_bytes(), b"v", OpFlags::empty()).unwrap();
        }
        let mut cur = engine.cursor_open(1, CursorOp::BeforeFirst, None).unwrap();
        let mut seen = Vec::new();
        loop {
            engine.cursor_to(&mut cur, CursorOp::Next).unwrap();
            match engine.cursor_get(&cur) {
                Ok((k, _)) => seen.push(u32::from_be_bytes(k.try_into().unwrap())),
                Err(_) => break,
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn dup_mode_add_contains_and_iter() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
        engine
            .put(1, b"k", &crate::storage::kvblk::dup::empty_value(), OpFlags::empty())
            .unwrap();
        let mut cur = engine.cursor_open(1, CursorOp::Eq, Some(b"k")).unwrap();
        engine.cursor_dup_add(&mut cur, 5).unwrap();
        engine.cursor_dup_add(&mut cur, 2).unwrap();
        assert_eq!(engine.cursor_dup_num(&cur).unwrap(), 2);
        assert!(engine.cursor_dup_contains(&cur, 2).unwrap());
        let ids: Vec<u64> = engine.cursor_dup_iter(&cur).unwrap().collect();
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn message_hook_overrides_default_text() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.set_message_hook(ErrorCode::NotFound, "nope, not here");
        assert_eq!(engine.message_for(ErrorCode::NotFound), "nope, not here");
    }

    #[test]
    fn incompatible_db_mode_on_reopen_with_different_flags() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(&dir);
        engine.db(1, DbFlags::UINT32_KEYS).unwrap();
        let err = engine.db(1, DbFlags::UINT64_KEYS).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IncompatibleDbMode);
    }
}
