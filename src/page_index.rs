//! Binary page-offset index: fixed header plus a growable offset array
//!
//! The file is streamed-appended by the background builder and randomly
//! read by the document handle. The header count is advisory only: every
//! load reconciles it against the file length, so a crash that tears the
//! count (or an append that never patched it) self-heals on the next open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::atomic_store;
use crate::error::{ReaderError, Result};

pub const MAGIC: [u8; 4] = *b"BPG1";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: u64 = 12;

/// Counts above this are never trusted; the file length decides.
const MAX_PLAUSIBLE_COUNT: u32 = 1_000_000;

/// Byte offset of the count field inside the header.
const COUNT_FIELD_POS: u64 = 8;

pub struct PageIndexFile {
    path: PathBuf,
}

impl PageIndexFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        atomic_store::restore_if_needed(&self.path);
        self.path.exists()
    }

    /// Write a fresh index containing `offsets`.
    pub fn create(&self, offsets: &[u32]) -> Result<()> {
        atomic_store::scoped_write(&self.path, |f| {
            let mut header = [0u8; HEADER_LEN as usize];
            header[..4].copy_from_slice(&MAGIC);
            header[4] = VERSION;
            header[8..12].copy_from_slice(&(offsets.len() as u32).to_le_bytes());
            f.write_all(&header)?;
            for &offset in offsets {
                f.write_all(&offset.to_le_bytes())?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Load the offset array, reconciling the advisory count field.
    ///
    /// A zero, implausible, or length-disagreeing count is recomputed from
    /// the file length; a non-4-aligned trailing remainder (torn append) is
    /// dropped. Only a bad magic or truncated header is an error, and it is
    /// the "no index, rebuild" kind.
    pub fn load(&self) -> Result<Vec<u32>> {
        atomic_store::restore_if_needed(&self.path);
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN {
            return Err(ReaderError::BadIndexHeader {
                path: self.path.clone(),
                reason: format!("file is {file_len} bytes, shorter than the header"),
            });
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[..4] != MAGIC {
            return Err(ReaderError::BadIndexHeader {
                path: self.path.clone(),
                reason: "magic mismatch".to_string(),
            });
        }
        if header[4] != VERSION {
            return Err(ReaderError::BadIndexHeader {
                path: self.path.clone(),
                reason: format!("unsupported version {}", header[4]),
            });
        }

        let stored = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let derivable = ((file_len - HEADER_LEN) / 4) as u32;
        let count = if stored == 0 || stored > MAX_PLAUSIBLE_COUNT || stored != derivable {
            warn!(
                "Page index {:?}: header count {stored} disagrees with file length ({derivable} entries); using file length",
                self.path
            );
            derivable
        } else {
            stored
        };

        let mut offsets = Vec::with_capacity(count as usize);
        let mut buf = [0u8; 4];
        for _ in 0..count {
            file.read_exact(&mut buf)?;
            offsets.push(u32::from_le_bytes(buf));
        }
        debug!("Loaded {} page offsets from {:?}", offsets.len(), self.path);
        Ok(offsets)
    }

    /// Number of whole entries currently in the file, derived from its
    /// length alone (the header count is advisory).
    pub fn entry_count(&self) -> Result<usize> {
        let len = std::fs::metadata(&self.path)?.len();
        Ok((len.saturating_sub(HEADER_LEN) / 4) as usize)
    }

    /// Append offsets without touching the header count; patching the count
    /// is a separate, cheaper operation.
    pub fn append(&self, offsets: &[u32]) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let mut buf = Vec::with_capacity(offsets.len() * 4);
        for &offset in offsets {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrite only the 4-byte count field in place. An interruption here
    /// corrupts at most the count, never the offset array, and the count is
    /// always recoverable from the file length.
    pub fn patch_count(&self, count: u32) -> Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(COUNT_FIELD_POS))?;
        file.write_all(&count.to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Structural check used by diagnostics: header fields plus strictly
    /// increasing offsets starting at zero. Returns the page count.
    pub fn validate(&self) -> Result<usize> {
        let offsets = self.load()?;
        if offsets.first() != Some(&0) {
            return Err(ReaderError::BadIndexHeader {
                path: self.path.clone(),
                reason: "first offset is not zero".to_string(),
            });
        }
        for pair in offsets.windows(2) {
            if pair[1] <= pair[0] {
                return Err(ReaderError::BadIndexHeader {
                    path: self.path.clone(),
                    reason: format!("offsets not strictly increasing at {}", pair[0]),
                });
            }
        }
        Ok(offsets.len())
    }

    pub fn remove(&self) -> bool {
        atomic_store::remove_verified(&self.path)
    }
}
