//! Core type aliases, flags, and small shared types used across the engine.

use bitflags::bitflags;

/// Byte offset within the file.
pub type Offset = u64;

/// Block number: `offset / block_size`.
pub type BlockNo = u64;

/// Database identifier.
pub type DbId = u32;

bitflags! {
    /// Flags accepted by `Engine::open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineOpenFlags: u32 {
        /// Open for reads only; any mutating call returns `ReadOnly`.
        const RDONLY = 0x0001;
        /// Truncate an existing file before opening (acts like a fresh file).
        const TRUNC = 0x0002;
        /// Disable the per-database reader/writer lock; API calls are then
        /// serialized only by the engine-wide lock.
        const NOLOCKS = 0x0004;
    }

    /// Flags accepted by `put`/`del`/cursor_set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Fail with `KeyExists` instead of overwriting.
        const NO_OVERWRITE = 0x0001;
        /// fsync the file before returning.
        const SYNC = 0x0002;
        /// In dup-mode, remove the given id instead of adding it.
        const DUP_REMOVE = 0x0004;
    }

    /// Per-database mode flags, fixed at creation and checked on every
    /// subsequent `Engine::db` call (mismatch -> `IncompatibleDbMode`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        const UINT32_KEYS = 0x0001;
        const UINT64_KEYS = 0x0002;
        const DUP_UINT32_VALS = 0x0004;
        const DUP_UINT64_VALS = 0x0008;
    }

    /// Flags accepted by `Fsm::allocate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsmAllocFlags: u32 {
        /// Returned offset must be a multiple of the OS page size.
        const PAGE_ALIGNED = 0x0001;
        /// Never attach residual space beyond the request (disables the
        /// statistical over-allocation heuristic).
        const NO_OVERALLOCATE = 0x0002;
        /// Fail with `NoFreeSpace` instead of growing the bitmap/file.
        const NO_EXTEND = 0x0004;
        /// Don't update the running allocation-size statistics.
        const NO_STATS = 0x0008;
        /// The caller guarantees the whole returned range will be used; do
        /// not apply the over-allocation heuristic even if a larger run
        /// was the only fit found.
        const SOLID_ALLOCATED_SPACE = 0x0010;
    }

    /// Flags accepted by `Engine::sync`/`Fsm::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const FSYNC = 0x0001;
        const FDATASYNC = 0x0002;
    }

    /// Flags accepted by `Fsm::clear`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsmClearFlags: u32 {
        /// Trim the file to the last allocated block after clearing.
        const TRIM = 0x0001;
    }
}

impl DbFlags {
    /// The declared key-comparison mode implied by this flag set.
    pub fn key_mode(self) -> KeyMode {
        if self.contains(DbFlags::UINT64_KEYS) {
            KeyMode::U64
        } else if self.contains(DbFlags::UINT32_KEYS) {
            KeyMode::U32
        } else {
            KeyMode::Bytes
        }
    }

    /// The declared dup-value width, if this database stores duplicate
    /// value sets instead of opaque byte strings.
    pub fn dup_width(self) -> Option<DupWidth> {
        if self.contains(DbFlags::DUP_UINT64_VALS) {
            Some(DupWidth::U64)
        } else if self.contains(DbFlags::DUP_UINT32_VALS) {
            Some(DupWidth::U32)
        } else {
            None
        }
    }
}

/// Key-comparison mode for a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Byte-lexicographic, shorter-suffix-wins ordering.
    Bytes,
    /// Big-endian `u32`; keys must be exactly 4 bytes.
    U32,
    /// Big-endian `u64`; keys must be exactly 8 bytes.
    U64,
}

/// Fixed-width integer used by a dup-mode value set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupWidth {
    U32,
    U64,
}

impl DupWidth {
    pub const fn bytes(self) -> usize {
        match self {
            DupWidth::U32 => 4,
            DupWidth::U64 => 8,
        }
    }
}

/// Compare two keys under `mode`: byte-lexicographic with
/// shorter-suffix-wins (i.e. plain slice `Ord`, which already treats a
/// prefix as smaller than anything it's a prefix of), or big-endian
/// fixed-width integers for the numeric modes.
pub fn compare_keys(mode: KeyMode, a: &[u8], b: &[u8]) -> crate::error::Result<std::cmp::Ordering> {
    use crate::error::{Error, ErrorCode};
    match mode {
        KeyMode::Bytes => Ok(a.cmp(b)),
        KeyMode::U32 => {
            if a.len() != 4 || b.len() != 4 {
                return Err(Error::new(ErrorCode::KeyNumValueSize));
            }
            let av = u32::from_be_bytes(a.try_into().unwrap());
            let bv = u32::from_be_bytes(b.try_into().unwrap());
            Ok(av.cmp(&bv))
        }
        KeyMode::U64 => {
            if a.len() != 8 || b.len() != 8 {
                return Err(Error::new(ErrorCode::KeyNumValueSize));
            }
            let av = u64::from_be_bytes(a.try_into().unwrap());
            let bv = u64::from_be_bytes(b.try_into().unwrap());
            Ok(av.cmp(&bv))
        }
    }
}

/// Per-pair size limit: 256 MiB - 1.
pub const MAX_KV_SIZE: usize = 256 * 1024 * 1024 - 1;

/// Approximate per-file size limit: ~255 GiB.
pub const MAX_FILE_SIZE: u64 = 255 * 1024 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn bytes_mode_shorter_prefix_sorts_first() {
        assert_eq!(compare_keys(KeyMode::Bytes, b"ab", b"abc").unwrap(), Ordering::Less);
    }

    #[test]
    fn u64_mode_compares_numerically_big_endian() {
        let one = 1u64.to_be_bytes();
        let big = 65536u64.to_be_bytes();
        assert_eq!(compare_keys(KeyMode::U64, &one, &big).unwrap(), Ordering::Less);
    }

    #[test]
    fn numeric_mode_rejects_wrong_width() {
        assert!(compare_keys(KeyMode::U32, b"abc", b"abcd").is_err());
    }

    #[test]
    fn dup_width_from_flags() {
        assert_eq!(DbFlags::DUP_UINT32_VALS.dup_width(), Some(DupWidth::U32));
        assert_eq!(DbFlags::empty().dup_width(), None);
    }
}
