//! stowkv - an embedded single-file mmap key-value storage engine.
//!
//! Layout: `storage::fsm` (free-space manager), `storage::kvblk` (packed
//! key/value blocks), `storage::sblk`/`storage::skiplist` (the skip-list
//! index), `storage::db` (database registry), `storage::cursor` (cursors),
//! and `engine` (the public `Engine` entry point and its lock discipline).

pub mod engine;
pub mod error;
pub mod os;
pub mod random;
pub mod storage;
pub mod types;
pub mod varint;

pub use engine::{Engine, EngineCursor, EngineOpenOptions};
pub use error::{Error, ErrorCode, MessageRegistry, Result};
pub use storage::cursor::{CursorOp, DupIter};
pub use types::{DbFlags, DbId, DupWidth, EngineOpenFlags, FsmAllocFlags, KeyMode, OpFlags, SyncFlags};
