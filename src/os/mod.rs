//! File I/O and mapped-region pool.
//!
//! A `RawFile` trait (positional read/write, fsync/fdatasync, advisory
//! whole-file lock, size) plus a `MmapPool` that hands the FSM a
//! scoped-acquire view of the file's current mapping.

pub mod file;
pub mod mmap;

#[cfg(unix)]
pub mod unix;
