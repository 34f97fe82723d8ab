use crate::lock_manager::LockError;
use std::fmt;
use std::io;

/// Errors surfaced by the storage engine.
///
/// `NotFound`, `DuplicateKey` and `Deadlock` are expected results that callers
/// handle; `Corruption` and `PinExhaustion` are invariant violations and the
/// process is expected to stop after reporting them.
#[derive(Debug)]
pub enum EngineError {
    Io(io::Error),
    /// A page header, log record or pointer chain failed validation.
    Corruption(String),
    /// Disk or page-space allocation failed.
    OutOfSpace,
    /// An index insert found an equal key in the leaf.
    DuplicateKey,
    /// A lookup missed. Normal result.
    NotFound,
    /// Every buffer frame is pinned and nothing can be evicted.
    PinExhaustion,
    /// The lock manager chose this transaction as a deadlock victim.
    Deadlock,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "i/o error: {e}"),
            EngineError::Corruption(msg) => write!(f, "corruption: {msg}"),
            EngineError::OutOfSpace => write!(f, "out of space"),
            EngineError::DuplicateKey => write!(f, "duplicate key"),
            EngineError::NotFound => write!(f, "not found"),
            EngineError::PinExhaustion => write!(f, "all buffer frames are pinned"),
            EngineError::Deadlock => write!(f, "deadlock victim"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Deadlock => EngineError::Deadlock,
        }
    }
}

impl EngineError {
    /// True for results a caller is expected to recover from.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound | EngineError::DuplicateKey | EngineError::Deadlock
        )
    }
}
