//! Indexing resume snapshot and the completion marker
//!
//! The progress file exists only while indexing is incomplete; the marker
//! file on durable storage is the sole truth for "index complete". There is
//! deliberately no in-memory completion flag layered over it, only a cache
//! that is invalidated whenever the marker is written or cleared.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{error, warn};
use parking_lot::Mutex;

use crate::atomic_store;
use crate::layout::LayoutParams;

/// Resume state of an incomplete index build.
#[derive(Clone, Debug)]
pub struct IndexingProgress {
    /// Raw byte offset the scan will continue from.
    pub scan_offset: u64,
    /// Document size snapshotted when indexing started.
    pub file_size: u64,
    pub params: LayoutParams,
    pub started: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl IndexingProgress {
    pub fn new(file_size: u64, params: LayoutParams) -> Self {
        let now = Utc::now();
        Self {
            scan_offset: 0,
            file_size,
            params,
            started: now,
            updated: now,
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut content = String::new();
        content.push_str(&format!("scan_offset={}\n", self.scan_offset));
        content.push_str(&format!("file_size={}\n", self.file_size));
        self.params.write_kv(&mut content);
        content.push_str(&format!("started={}\n", self.started.to_rfc3339()));
        content.push_str(&format!("updated={}\n", self.updated.to_rfc3339()));
        atomic_store::scoped_write(path, |f| f.write_all(content.as_bytes()))
    }

    /// Read a snapshot back; a missing or unparsable file is "no progress".
    pub fn load(path: &Path) -> Option<Self> {
        atomic_store::restore_if_needed(path);
        let content = fs::read_to_string(path).ok()?;
        let map: HashMap<String, String> = content
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let parse_time = |key: &str| {
            map.get(key)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };

        Some(Self {
            scan_offset: map.get("scan_offset")?.parse().ok()?,
            file_size: map.get("file_size")?.parse().ok()?,
            params: LayoutParams::from_kv(&map)?,
            started: parse_time("started"),
            updated: parse_time("updated"),
        })
    }

    pub fn exists(path: &Path) -> bool {
        atomic_store::restore_if_needed(path);
        path.exists()
    }

    /// Remove the snapshot and any staging leftover, verifying both are
    /// gone. Completion depends on this: a surviving progress file would
    /// make the document look half-indexed forever.
    pub fn delete_verified(path: &Path) -> bool {
        atomic_store::remove_verified(path)
    }
}

/// The `<doc>.complete` marker. Existence on disk is the only truth;
/// the in-memory value is a cache with explicit invalidation.
pub struct CompletionMarker {
    path: PathBuf,
    cached: Mutex<Option<bool>>,
}

impl CompletionMarker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        let mut cached = self.cached.lock();
        if let Some(known) = *cached {
            return known;
        }
        atomic_store::restore_if_needed(&self.path);
        let present = self.path.exists();
        *cached = Some(present);
        present
    }

    pub fn write(&self, pages: usize) -> std::io::Result<()> {
        let result = atomic_store::scoped_write(&self.path, |f| {
            writeln!(f, "pages={pages}")?;
            writeln!(f, "completed={}", Utc::now().to_rfc3339())
        });
        match &result {
            Ok(()) => *self.cached.lock() = Some(true),
            Err(e) => {
                error!("Failed to write completion marker {:?}: {e}", self.path);
                *self.cached.lock() = None;
            }
        }
        result
    }

    pub fn clear(&self) -> bool {
        let gone = atomic_store::remove_verified(&self.path);
        if !gone {
            warn!("Completion marker {:?} could not be cleared", self.path);
        }
        *self.cached.lock() = None;
        gone
    }

    /// Page count recorded in the marker, for diagnostics.
    pub fn recorded_pages(&self) -> Option<usize> {
        let content = fs::read_to_string(&self.path).ok()?;
        content
            .lines()
            .find_map(|l| l.strip_prefix("pages="))
            .and_then(|v| v.parse().ok())
    }
}
