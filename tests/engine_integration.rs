//! End-to-end scenarios driven through the public `Engine` API, plus a
//! couple that reach into `stowkv::storage` directly where the behaviour
//! being checked (an exact skip-list split, bitmap growth) isn't otherwise
//! observable from outside.

use stowkv::storage::db::DbRecord;
use stowkv::storage::fsm::{Fsm, FsmOpenOptions};
use stowkv::storage::sblk::Sblk;
use stowkv::storage::skiplist;
use stowkv::{DbFlags, Engine, EngineOpenFlags, EngineOpenOptions, ErrorCode, KeyMode, OpFlags};

use std::sync::Arc;

fn open_engine(dir: &tempfile::TempDir) -> Engine {
    let path = dir.path().join("data.db");
    Engine::open(&path, EngineOpenFlags::empty(), EngineOpenOptions::default()).unwrap()
}

fn open_fsm(dir: &tempfile::TempDir) -> Fsm {
    let path = dir.path().join("raw.db");
    let file: Arc<dyn stowkv::os::file::RawFile> =
        Arc::new(stowkv::os::unix::UnixFile::open(&path, true, false).unwrap());
    Fsm::open(
        file,
        FsmOpenOptions {
            create: true,
            ..Default::default()
        },
    )
    .unwrap()
}

/// The 33rd insert into a single node splits it into a
/// 17/16 pair rather than an even 16/17 or a third split.
#[test]
fn inserting_33_keys_splits_into_seventeen_and_sixteen() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = open_fsm(&dir);
    let mut db = DbRecord::create(&mut fsm, 1, DbFlags::empty()).unwrap();
    let mut rng = stowkv::random::EngineRng::new();
    rng.seed(b"split integration test seed");

    for i in 0..33u32 {
        let key = format!("k{i:03}");
        skiplist::insert(&mut fsm, &mut rng, &mut db, KeyMode::Bytes, key.as_bytes(), b"v", OpFlags::empty())
            .unwrap();
    }

    assert_eq!(db.lcnt(0), 2, "33 inserts into one node must split exactly once");

    let head_addr = db.head_addr(0, fsm.block_size()).unwrap();
    let head = Sblk::read(fsm.mmap(), head_addr).unwrap();
    let tail_addr = head.next_addr(0, fsm.block_size()).unwrap();
    let tail = Sblk::read(fsm.mmap(), tail_addr).unwrap();

    let mut halves = [head.pnum, tail.pnum];
    halves.sort();
    assert_eq!(halves, [16, 17], "split must produce a 16/17 pnum pair");
}

/// Growing a value past its KVBLK's available space
/// forces a relocation, and the pair survives it.
#[test]
fn value_growth_triggers_kvblk_relocation_and_survives() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.db(1, DbFlags::empty()).unwrap();

    engine.put(1, b"k", b"small", OpFlags::empty()).unwrap();
    let big = vec![0x42u8; 4096];
    engine.put(1, b"k", &big, OpFlags::empty()).unwrap();

    assert_eq!(engine.get(1, b"k").unwrap(), big);
}

/// A single allocation that outgrows the bitmap's bit
/// capacity forces `grow_bitmap`, and the old bitmap region becomes reusable
/// free space rather than leaking.
#[test]
fn allocation_past_bitmap_capacity_grows_bitmap_and_reclaims_old_region() {
    let dir = tempfile::tempdir().unwrap();
    let mut fsm = open_fsm(&dir);
    let stats_before = fsm.stats().unwrap();
    let capacity_blocks = stats_before.bmlen * 8;

    // One allocation that needs more blocks than the current bitmap can
    // address at all forces `grow_bitmap` inside `extend_for`.
    let oversized = (capacity_blocks + 10) * fsm.block_size();
    let (off, len) = fsm.allocate(oversized, stowkv::FsmAllocFlags::NO_OVERALLOCATE).unwrap();

    let stats_after_alloc = fsm.stats().unwrap();
    assert!(
        stats_after_alloc.bmlen > stats_before.bmlen,
        "bitmap must have grown to cover this many blocks"
    );

    fsm.deallocate(off, len).unwrap();
    // The freed space (including whatever the old, now-superseded bitmap
    // region contributed) must be reusable: a fresh allocation of the same
    // size should not need to grow the file any further.
    let file_size_before_reuse = fsm.stats().unwrap().file_size;
    fsm.allocate(oversized, stowkv::FsmAllocFlags::NO_OVERALLOCATE).unwrap();
    assert_eq!(fsm.stats().unwrap().file_size, file_size_before_reuse);
}

/// Deleting everything, closing, and reopening trims
/// the file back down instead of leaving it permanently inflated.
#[test]
fn delete_all_then_close_and_reopen_trims_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let baseline = {
        let engine = Engine::open(&path, EngineOpenFlags::empty(), EngineOpenOptions::default()).unwrap();
        engine.db(1, DbFlags::empty()).unwrap();
        let baseline = engine.stats().unwrap().file_size;
        engine.close().unwrap();
        baseline
    };

    let engine = Engine::open(&path, EngineOpenFlags::empty(), EngineOpenOptions::default()).unwrap();
    engine.db(1, DbFlags::empty()).unwrap();
    for i in 0..200u32 {
        let val = vec![i as u8; 512];
        engine.put(1, &i.to_be_bytes(), &val, OpFlags::empty()).unwrap();
    }
    let inflated = engine.stats().unwrap().file_size;
    assert!(inflated > baseline, "200 half-KiB values must grow the file");

    for i in 0..200u32 {
        engine.del(1, &i.to_be_bytes()).unwrap();
    }
    engine.close().unwrap();

    let reopened = Engine::open(&path, EngineOpenFlags::empty(), EngineOpenOptions::default()).unwrap();
    let trimmed = reopened.stats().unwrap().file_size;
    assert!(trimmed < inflated, "closing after deleting everything must trim the file");
}

/// Duplicate-value ordering survives out-of-order adds
/// and interleaved removal.
#[test]
fn dup_values_stay_sorted_through_interleaved_add_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
    engine
        .put(1, b"k", &stowkv::storage::kvblk::dup::empty_value(), OpFlags::empty())
        .unwrap();

    let mut cur = engine.cursor_open(1, stowkv::CursorOp::Eq, Some(b"k")).unwrap();
    for id in [40u64, 10, 30, 20, 50] {
        engine.cursor_dup_add(&mut cur, id).unwrap();
    }
    assert_eq!(engine.cursor_dup_num(&cur).unwrap(), 5);
    let ids: Vec<u64> = engine.cursor_dup_iter(&cur).unwrap().collect();
    assert_eq!(ids, vec![10, 20, 30, 40, 50]);

    engine.cursor_dup_rm(&mut cur, 30).unwrap();
    assert!(!engine.cursor_dup_contains(&cur, 30).unwrap());
    let ids: Vec<u64> = engine.cursor_dup_iter(&cur).unwrap().collect();
    assert_eq!(ids, vec![10, 20, 40, 50]);
}

/// `UINT64_KEYS` databases order by numeric value, and
/// reject keys of the wrong width outright.
#[test]
fn uint64_keys_order_numerically_and_reject_wrong_width() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);
    engine.db(1, DbFlags::UINT64_KEYS).unwrap();

    for n in [5_000_000_000u64, 1, 256, 18_446_744_073_709_551_000] {
        engine.put(1, &n.to_be_bytes(), b"v", OpFlags::empty()).unwrap();
    }

    let mut cur = engine.cursor_open(1, stowkv::CursorOp::BeforeFirst, None).unwrap();
    let mut seen = Vec::new();
    loop {
        engine.cursor_to(&mut cur, stowkv::CursorOp::Next).unwrap();
        match engine.cursor_get(&cur) {
            Ok((k, _)) => seen.push(u64::from_be_bytes(k.try_into().unwrap())),
            Err(_) => break,
        }
    }
    let mut expected = vec![5_000_000_000u64, 1, 256, 18_446_744_073_709_551_000];
    expected.sort();
    assert_eq!(seen, expected);

    let err = engine.put(1, b"too-short", b"v", OpFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNumValueSize);
}
