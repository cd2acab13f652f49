//! Background index builder
//!
//! One builder thread per open document extends the page index in bounded
//! batches while the foreground keeps paging. The file lock is taken with
//! zero timeout: on contention the builder persists progress and yields,
//! so the reader is never blocked on indexing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::bookmark::{Bookmark, BookmarkStore};
use crate::document::DocCore;
use crate::layout;
use crate::progress::IndexingProgress;

#[derive(Clone, Copy, Debug)]
pub struct BuildConfig {
    /// Pages laid out per file-lock acquisition.
    pub pages_per_cycle: usize,
    /// Minimum interval between progress persists.
    pub persist_interval: Duration,
    /// Consecutive non-advancing cycles before completion is forced.
    pub stall_cycle_limit: u32,
    /// Sleep after a failed lock acquisition.
    pub contention_backoff: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            pages_per_cycle: 4,
            persist_interval: Duration::from_millis(500),
            stall_cycle_limit: 10,
            contention_backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    NotStarted,
    InProgress,
    /// Stopped on request with progress persisted; resumable.
    Paused,
    Complete,
    /// Abandoned because the document is closing.
    Stopped,
}

struct BuilderShared {
    stop: AtomicBool,
    state: Mutex<BuildState>,
}

/// Owner handle for one builder thread.
pub(crate) struct BuilderHandle {
    thread: Option<JoinHandle<()>>,
    shared: Arc<BuilderShared>,
}

impl BuilderHandle {
    pub(crate) fn state(&self) -> BuildState {
        *self.shared.state.lock()
    }

    /// Ask the thread to stop and wait for it. The stop flag is polled at
    /// page boundaries, so the wait is bounded by one batch of layout.
    pub(crate) fn stop_and_join(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Index builder thread panicked");
            }
        }
    }
}

impl Drop for BuilderHandle {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) fn spawn(core: Arc<DocCore>, config: BuildConfig) -> std::io::Result<BuilderHandle> {
    let shared = Arc::new(BuilderShared {
        stop: AtomicBool::new(false),
        state: Mutex::new(BuildState::InProgress),
    });
    let thread_shared = Arc::clone(&shared);
    let thread = std::thread::Builder::new()
        .name("index-builder".to_string())
        .spawn(move || run(&core, config, &thread_shared))?;
    Ok(BuilderHandle {
        thread: Some(thread),
        shared,
    })
}

fn run(core: &DocCore, config: BuildConfig, shared: &BuilderShared) {
    info!(
        "Index build starting for {:?} at offset {}",
        core.doc_path,
        core.last_offset()
    );

    let progress_path = core.sidecar.progress();
    let mut progress = IndexingProgress::load(&progress_path)
        .unwrap_or_else(|| IndexingProgress::new(core.file_size, core.params));
    let mut last_persist: Option<Instant> = None;
    // Entries already in the index file; in-memory entries past this point
    // (including foreground on-demand inserts made while no builder was
    // running) still need a flush. Sized from the file, not from memory.
    let mut flushed = match core.index_file.entry_count() {
        Ok(count) => count,
        Err(e) => {
            error!("Cannot size page index file: {e}");
            core.known_offsets()
        }
    };
    let mut stalls = 0u32;

    loop {
        if core.is_closing() {
            *shared.state.lock() = BuildState::Stopped;
            info!("Index build abandoned: document is closing");
            return;
        }
        if shared.stop.load(Ordering::SeqCst) {
            progress.scan_offset = core.last_offset() as u64;
            progress.updated = chrono::Utc::now();
            if let Err(e) = progress.save(&progress_path) {
                error!("Failed to persist indexing progress on stop: {e}");
            }
            *shared.state.lock() = BuildState::Paused;
            core.notify_progress();
            info!("Index build paused at offset {}", progress.scan_offset);
            return;
        }

        let scan_start = core.last_offset() as u64;
        let mut scan = scan_start;
        let mut batch: Vec<u32> = Vec::new();
        let mut eof = false;

        {
            let Some(mut file) = core.file.try_lock() else {
                // Foreground holds the document; persist and yield
                persist_rate_limited(&mut progress, scan, &progress_path, &mut last_persist, config);
                std::thread::sleep(config.contention_backoff);
                continue;
            };

            for _ in 0..config.pages_per_cycle {
                if core.is_closing() || shared.stop.load(Ordering::SeqCst) {
                    break;
                }
                match layout::fill_page(&mut *file, scan, &core.params, core.metrics.as_ref()) {
                    Ok(fill) => {
                        if fill.raw_consumed == 0 {
                            eof = fill.eof;
                            break;
                        }
                        scan += fill.raw_consumed;
                        if fill.eof || scan >= core.file_size {
                            eof = true;
                            break;
                        }
                        batch.push(scan as u32);
                    }
                    Err(e) => {
                        error!("Layout failed at offset {scan}: {e}");
                        break;
                    }
                }
            }
        } // file lock released before any index write

        if core.is_closing() {
            *shared.state.lock() = BuildState::Stopped;
            return;
        }

        if !batch.is_empty() {
            core.append_new_offsets(&batch);
        }
        flush_pending(core, &mut flushed);
        core.set_scan_offset(scan);
        core.notify_progress();

        progress.scan_offset = scan;
        persist_rate_limited(&mut progress, scan, &progress_path, &mut last_persist, config);

        if eof {
            finish(core, shared, &mut flushed, false);
            return;
        }
        if scan == scan_start {
            stalls += 1;
            if stalls >= config.stall_cycle_limit {
                warn!(
                    "Index build made no progress for {stalls} cycles at offset {scan} \
                     ({} pages known); forcing completion - this may hide a layout fault",
                    core.known_offsets()
                );
                finish(core, shared, &mut flushed, true);
                return;
            }
        } else {
            stalls = 0;
        }
    }
}

/// Append every in-memory offset the index file does not have yet. An I/O
/// failure leaves `flushed` untouched so the next cycle retries the same
/// span; it is never terminal.
fn flush_pending(core: &DocCore, flushed: &mut usize) -> bool {
    let pending = core.offsets_from(*flushed);
    if pending.is_empty() {
        return true;
    }
    match core.index_file.append(&pending) {
        Ok(()) => {
            *flushed += pending.len();
            debug!("Appended {} offsets to page index", pending.len());
            true
        }
        Err(e) => {
            error!("Failed to append {} offsets: {e}", pending.len());
            false
        }
    }
}

fn persist_rate_limited(
    progress: &mut IndexingProgress,
    scan: u64,
    path: &std::path::Path,
    last_persist: &mut Option<Instant>,
    config: BuildConfig,
) {
    let due = last_persist.is_none_or(|t| t.elapsed() >= config.persist_interval);
    if !due {
        return;
    }
    progress.scan_offset = scan;
    progress.updated = chrono::Utc::now();
    match progress.save(path) {
        Ok(()) => *last_persist = Some(Instant::now()),
        Err(e) => error!("Failed to persist indexing progress: {e}"),
    }
}

/// Completion: patch the header count, write the marker, persist the
/// bookmark with the authoritative page count, then delete the progress
/// snapshot (verified). Marker before deletion, so a crash in between
/// leaves a complete-and-resumable state, never a half-indexed one.
fn finish(core: &DocCore, shared: &BuilderShared, flushed: &mut usize, forced: bool) {
    flush_pending(core, flushed);
    let pages = core.known_offsets();

    if let Err(e) = core.index_file.patch_count(pages as u32) {
        error!("Failed to patch page index count to {pages}: {e}");
    }
    if core.completion.write(pages).is_err() {
        // Already logged; without the marker the next open resumes the
        // build, which is the safe direction.
        *shared.state.lock() = BuildState::Paused;
        core.notify_progress();
        return;
    }

    let store = BookmarkStore::new(core.sidecar.bookmark());
    let mut bookmark = store
        .load()
        .unwrap_or_else(|| Bookmark::new(core.params, core.file_size));
    bookmark.total_pages = pages;
    if let Err(e) = store.save(&bookmark) {
        error!("Failed to persist bookmark with final page count: {e}");
    }

    if !IndexingProgress::delete_verified(&core.sidecar.progress()) {
        error!("Indexing progress file survived completion; the next open will remove it");
    }

    *shared.state.lock() = BuildState::Complete;
    core.notify_progress();
    if forced {
        warn!("Index build force-completed with {pages} pages for {:?}", core.doc_path);
    } else {
        info!("Index build complete: {pages} pages for {:?}", core.doc_path);
    }
}
