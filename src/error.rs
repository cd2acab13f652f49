//! Error taxonomy shared by the indexing core

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the pagination/indexing core.
///
/// Corruption of persisted artifacts is deliberately absent here: a bad
/// index header degrades to "no index" and a bad count field is recomputed
/// from file length, so neither ever reaches a caller as an error.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The page index file exists but its header is not ours. Callers treat
    /// this as "no index" and rebuild.
    #[error("bad page index header in {path:?}: {reason}")]
    BadIndexHeader { path: PathBuf, reason: String },

    /// The foreground file lock was not acquired within its timeout. The
    /// single operation fails; it is not retried internally.
    #[error("document lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// A stored snapshot was computed against different layout parameters.
    #[error("stored layout parameters differ from the current ones")]
    ParamMismatch,

    /// A byte position past the indexed region was requested while the
    /// index is still being built. Guessing would land on the wrong page.
    #[error("byte position {pos} is beyond the indexed region ({indexed} bytes known)")]
    PastIndexedEnd { pos: u64, indexed: u64 },

    /// Page offsets are stored as u32; larger documents are refused at open.
    #[error("document is {size} bytes; only documents up to 4 GiB can be indexed")]
    DocumentTooLarge { size: u64 },
}

pub type Result<T> = std::result::Result<T, ReaderError>;
