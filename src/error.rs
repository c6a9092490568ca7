//! Error types and Result alias for the engine core.

use std::fmt;
use std::sync::Mutex;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant for every failure the core can report.
///
/// Grouped below: generic codes first, then FSM-specific block-allocation
/// codes, then KV-specific skip-list/KVBLK codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgs,
    InvalidState,
    Alloc,
    ThreadingErrno,
    IoErrno,
    ReadOnly,
    OutOfBounds,
    Overflow,
    NotImplemented,

    // FSM-specific
    NoFreeSpace,
    InvalidBlockSize,
    RangeNotAligned,
    FsmSegmentation,
    InvalidFileMeta,
    PlatformPage,
    NotMapped,

    // KV-specific
    NotFound,
    KeyExists,
    MaxKvSize,
    Corrupted,
    DupValueSize,
    KeyNumValueSize,
    IncompatibleDbMode,
}

impl ErrorCode {
    /// Static description, used as the `Display` fallback when no
    /// richer message was attached to the error.
    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "invalid arguments",
            ErrorCode::InvalidState => "operation invalid in the current state",
            ErrorCode::Alloc => "memory allocation failed",
            ErrorCode::ThreadingErrno => "threading primitive failed",
            ErrorCode::IoErrno => "I/O error",
            ErrorCode::ReadOnly => "database is read-only",
            ErrorCode::OutOfBounds => "value out of bounds",
            ErrorCode::Overflow => "arithmetic overflow",
            ErrorCode::NotImplemented => "not implemented",
            ErrorCode::NoFreeSpace => "no free space in file",
            ErrorCode::InvalidBlockSize => "invalid block size",
            ErrorCode::RangeNotAligned => "byte range is not block-aligned",
            ErrorCode::FsmSegmentation => "free-space manager consistency check failed",
            ErrorCode::InvalidFileMeta => "invalid file header metadata",
            ErrorCode::PlatformPage => "block size exceeds the platform page size",
            ErrorCode::NotMapped => "address range is not memory-mapped",
            ErrorCode::NotFound => "key not found",
            ErrorCode::KeyExists => "key already exists",
            ErrorCode::MaxKvSize => "key or value exceeds the maximum size",
            ErrorCode::Corrupted => "on-disk structure is corrupted",
            ErrorCode::DupValueSize => "value size does not match the declared dup-mode width",
            ErrorCode::KeyNumValueSize => "key size does not match the declared numeric width",
            ErrorCode::IncompatibleDbMode => {
                "database flags do not match the mode it was created with"
            }
        }
    }
}

/// An engine failure: a code plus an optional human-readable detail.
#[derive(Debug)]
pub struct Error {
    code: ErrorCode,
    message: Option<Box<str>>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into().into_boxed_str()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// "Light" errors are expected on hot paths (a miss, a duplicate
    /// insert) and never poison the structure they were raised against.
    pub fn is_light(&self) -> bool {
        matches!(self.code, ErrorCode::NotFound | ErrorCode::KeyExists)
    }

    /// Corruption-class errors poison the containing structure: further
    /// writes against it must be refused rather than attempted.
    pub fn is_corruption(&self) -> bool {
        matches!(self.code, ErrorCode::Corrupted | ErrorCode::FsmSegmentation)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.code.message(), m),
            None => write!(f, "{}", self.code.message()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoErrno, e.to_string())
    }
}

/// Per-engine error-code -> message override registry.
///
/// Owned by `Engine` rather than kept as process-wide global state, so
/// multiple engines in one process can register independent messages.
#[derive(Default)]
pub struct MessageRegistry {
    overrides: Mutex<std::collections::HashMap<ErrorCode, Box<str>>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, code: ErrorCode, message: impl Into<String>) {
        self.overrides
            .lock()
            .unwrap()
            .insert(code, message.into().into_boxed_str());
    }

    pub fn message_for(&self, code: ErrorCode) -> String {
        self.overrides
            .lock()
            .unwrap()
            .get(&code)
            .map(|s| s.to_string())
            .unwrap_or_else(|| code.message().to_string())
    }
}
