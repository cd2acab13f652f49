//! Document handle: the façade the reader drives
//!
//! Owns the open file and the in-memory page-offset list, restores the
//! bookmark, detects stale layout parameters, and navigates pages while a
//! background builder extends the index. The foreground acquires the file
//! lock with a multi-second timeout; the builder with zero timeout.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bookmark::{Bookmark, BookmarkStore};
use crate::builder::{self, BuildConfig, BuildState, BuilderHandle};
use crate::encoding::{self, Encoding};
use crate::error::{ReaderError, Result};
use crate::layout::{self, FontMetrics, LayoutParams};
use crate::page_index::PageIndexFile;
use crate::progress::{CompletionMarker, IndexingProgress};
use crate::sidecar::Sidecar;
use crate::tags::{TagStore, sanitize_preview};

/// Foreground file-lock timeout. Hitting it fails the single operation;
/// there is no internal retry.
const FOREGROUND_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Bounded wait for the builder to surface the next offset before the
/// foreground computes the page itself.
const CATCHUP_WAIT: Duration = Duration::from_millis(200);

/// Bytes sampled for encoding detection.
const DETECT_SAMPLE_LEN: usize = 4096;

/// Display geometry for opening a document; the encoding is detected from
/// the file itself.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub area_width: u32,
    pub area_height: u32,
    pub font_size: u32,
    pub vertical: bool,
}

impl Geometry {
    fn into_params(self, encoding: Encoding) -> LayoutParams {
        LayoutParams {
            area_width: self.area_width,
            area_height: self.area_height,
            font_size: self.font_size,
            vertical: self.vertical,
            encoding,
        }
    }
}

/// State shared between the handle and its background builder. The builder
/// holds an `Arc` to this and must observe the closing token before every
/// disk operation.
pub(crate) struct DocCore {
    pub(crate) doc_path: PathBuf,
    pub(crate) sidecar: Sidecar,
    pub(crate) params: LayoutParams,
    pub(crate) metrics: Arc<dyn FontMetrics>,
    pub(crate) file_size: u64,
    pub(crate) file: Mutex<File>,
    pub(crate) index_file: PageIndexFile,
    pub(crate) completion: CompletionMarker,
    offsets: RwLock<Vec<u32>>,
    closing: AtomicBool,
    scan_offset: AtomicU64,
    progress_gate: Mutex<()>,
    progress_cond: Condvar,
}

impl DocCore {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn known_offsets(&self) -> usize {
        self.offsets.read().len()
    }

    pub(crate) fn offset_at(&self, page: usize) -> Option<u32> {
        self.offsets.read().get(page).copied()
    }

    pub(crate) fn last_offset(&self) -> u32 {
        self.offsets.read().last().copied().unwrap_or(0)
    }

    pub(crate) fn offsets_from(&self, start: usize) -> Vec<u32> {
        let offsets = self.offsets.read();
        offsets[start.min(offsets.len())..].to_vec()
    }

    pub(crate) fn snapshot_offsets(&self) -> Vec<u32> {
        self.offsets.read().clone()
    }

    /// Append offsets that extend the list. Entries at or below the current
    /// tail are dropped, which makes the builder and an on-demand
    /// foreground insert of the same page converge on one entry.
    pub(crate) fn append_new_offsets(&self, new: &[u32]) -> usize {
        let mut offsets = self.offsets.write();
        let mut added = 0;
        for &offset in new {
            if offsets.last().is_none_or(|&tail| offset > tail) {
                offsets.push(offset);
                added += 1;
            }
        }
        added
    }

    pub(crate) fn set_scan_offset(&self, offset: u64) {
        self.scan_offset.store(offset, Ordering::SeqCst);
    }

    pub(crate) fn notify_progress(&self) {
        let _gate = self.progress_gate.lock();
        self.progress_cond.notify_all();
    }

    /// Wait (bounded) until the offset list grows past `known` or the
    /// build finishes.
    fn wait_for_more_offsets(&self, known: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.progress_gate.lock();
        loop {
            if self.offsets.read().len() > known || self.completion.exists() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.progress_cond.wait_until(&mut gate, deadline);
        }
    }
}

/// The reader's view of one open document.
pub struct DocumentHandle {
    core: Arc<DocCore>,
    build_config: BuildConfig,
    build: Option<BuilderHandle>,
    cursor: usize,
    page_cache: Option<(usize, String)>,
    bookmark_store: BookmarkStore,
    tag_store: TagStore,
    pub show_label: bool,
    pub keep_original_script: bool,
    pub draw_underline: bool,
    read_hours: u32,
    read_minutes: u32,
}

impl DocumentHandle {
    pub fn open(
        doc_path: &Path,
        state_dir: &Path,
        geometry: Geometry,
        metrics: Arc<dyn FontMetrics>,
    ) -> Result<Self> {
        Self::open_with_config(doc_path, state_dir, geometry, metrics, BuildConfig::default())
    }

    pub fn open_with_config(
        doc_path: &Path,
        state_dir: &Path,
        geometry: Geometry,
        metrics: Arc<dyn FontMetrics>,
        build_config: BuildConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;

        let mut file = File::open(doc_path)?;
        let file_size = file.metadata()?.len();
        if file_size > u64::from(u32::MAX) {
            return Err(ReaderError::DocumentTooLarge { size: file_size });
        }

        let mut sample = vec![0u8; DETECT_SAMPLE_LEN.min(file_size as usize)];
        file.read_exact(&mut sample)?;
        let detected = encoding::detect(&sample);
        let params = geometry.into_params(detected);
        info!(
            "Opening {doc_path:?}: {file_size} bytes, encoding {}",
            detected.as_str()
        );

        let sidecar = Sidecar::new(state_dir, doc_path);
        let completion = CompletionMarker::new(sidecar.complete());
        let index_file = PageIndexFile::new(sidecar.page_index());
        let bookmark_store = BookmarkStore::new(sidecar.bookmark());
        let tag_store = TagStore::new(sidecar.tags());

        // Parameter-mismatch detection: a bookmark or progress snapshot
        // computed against different geometry/size invalidates everything
        // derived from layout.
        let bookmark = bookmark_store.load();
        let mut keep_bookmark = None;
        let mut force_rebuild = false;
        if let Some(bm) = bookmark {
            if bm.file_size != file_size || bm.params != params {
                info!(
                    "Bookmark snapshot is stale ({} bytes, font {}); discarding and rebuilding",
                    bm.file_size, bm.params.font_size
                );
                force_rebuild = true;
            } else {
                keep_bookmark = Some(bm);
            }
        }
        if let Some(progress) = IndexingProgress::load(&sidecar.progress()) {
            if completion.exists() {
                // Contradictory leftovers; the marker wins
                warn!("Progress snapshot found next to a completion marker; removing it");
                IndexingProgress::delete_verified(&sidecar.progress());
            } else if progress.params != params || progress.file_size != file_size {
                info!("Indexing progress snapshot is stale; discarding and rebuilding");
                force_rebuild = true;
            }
        }

        let offsets: Vec<u32>;
        if force_rebuild {
            bookmark_store.remove();
            completion.clear();
            IndexingProgress::delete_verified(&sidecar.progress());
            index_file.remove();
            index_file.create(&[0])?;
            offsets = vec![0];
        } else if index_file.exists() {
            match index_file.load() {
                Ok(loaded)
                    if loaded.first() == Some(&0)
                        && loaded.windows(2).all(|w| w[0] < w[1]) =>
                {
                    offsets = loaded;
                }
                Ok(_) => {
                    warn!("Page index for {doc_path:?} is disordered; rebuilding");
                    completion.clear();
                    index_file.create(&[0])?;
                    offsets = vec![0];
                }
                Err(ReaderError::BadIndexHeader { path, reason }) => {
                    warn!("Page index {path:?} unusable ({reason}); rebuilding");
                    completion.clear();
                    index_file.create(&[0])?;
                    offsets = vec![0];
                }
                Err(e) => return Err(e),
            }
        } else {
            index_file.create(&[0])?;
            offsets = vec![0];
        }

        let scan_offset = offsets.last().copied().unwrap_or(0);
        let core = Arc::new(DocCore {
            doc_path: doc_path.to_path_buf(),
            sidecar,
            params,
            metrics,
            file_size,
            file: Mutex::new(file),
            index_file,
            completion,
            offsets: RwLock::new(offsets),
            closing: AtomicBool::new(false),
            scan_offset: AtomicU64::new(u64::from(scan_offset)),
            progress_gate: Mutex::new(()),
            progress_cond: Condvar::new(),
        });

        let build = if core.completion.exists() {
            debug!("Index already complete; no builder needed");
            None
        } else {
            Some(builder::spawn(Arc::clone(&core), build_config)?)
        };

        let mut handle = Self {
            core,
            build_config,
            build,
            cursor: 0,
            page_cache: None,
            bookmark_store,
            tag_store,
            show_label: true,
            keep_original_script: false,
            draw_underline: false,
            read_hours: 0,
            read_minutes: 0,
        };

        if let Some(bm) = keep_bookmark {
            let known = handle.core.known_offsets();
            handle.cursor = bm.page.min(known.saturating_sub(1));
            handle.show_label = bm.show_label;
            handle.keep_original_script = bm.keep_original_script;
            handle.draw_underline = bm.draw_underline;
            handle.read_hours = bm.read_hours;
            handle.read_minutes = bm.read_minutes;
            debug!("Restored bookmark: page {}", handle.cursor);
        }

        Ok(handle)
    }

    #[must_use]
    pub fn params(&self) -> &LayoutParams {
        &self.core.params
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.core.file_size
    }

    #[must_use]
    pub fn current_page_index(&self) -> usize {
        self.cursor
    }

    /// Pages known so far; grows while the index is building.
    #[must_use]
    pub fn known_page_count(&self) -> usize {
        self.core.known_offsets()
    }

    /// True once the on-disk completion marker exists. There is no
    /// in-memory flag that can override this.
    #[must_use]
    pub fn is_index_complete(&self) -> bool {
        self.core.completion.exists()
    }

    pub fn indexing_progress_percent(&self) -> u8 {
        if self.is_index_complete() {
            return 100;
        }
        if self.core.file_size == 0 {
            return 100;
        }
        let scanned = self.core.scan_offset.load(Ordering::SeqCst);
        ((scanned * 100) / self.core.file_size).min(99) as u8
    }

    #[must_use]
    pub fn current_byte_position(&self) -> u64 {
        self.core
            .offset_at(self.cursor)
            .map(u64::from)
            .unwrap_or(0)
    }

    pub fn percent_through(&self) -> u8 {
        if self.core.file_size == 0 {
            return 100;
        }
        ((self.current_byte_position() * 100) / self.core.file_size).min(100) as u8
    }

    /// Rendered text of the current page.
    pub fn current_page(&mut self) -> Result<&str> {
        let known = self.core.known_offsets();
        if self.cursor >= known {
            self.cursor = known.saturating_sub(1);
        }
        if self.page_cache.as_ref().is_none_or(|(p, _)| *p != self.cursor) {
            let start = self.current_byte_position();
            let text = self.render_page_at(start)?;
            self.page_cache = Some((self.cursor, text));
        }
        match &self.page_cache {
            Some((_, text)) => Ok(text),
            None => Ok(""),
        }
    }

    fn render_page_at(&self, start: u64) -> Result<String> {
        let mut file = self
            .core
            .file
            .try_lock_for(FOREGROUND_LOCK_TIMEOUT)
            .ok_or(ReaderError::LockTimeout(FOREGROUND_LOCK_TIMEOUT))?;
        let fill = layout::fill_page(
            &mut *file,
            start,
            &self.core.params,
            self.core.metrics.as_ref(),
        )?;
        Ok(fill.text)
    }

    /// Advance one page. Returns false at the end of the document.
    ///
    /// While the index is incomplete the call first waits (bounded) for
    /// the builder, then computes exactly one page itself; the foreground
    /// is never stalled indefinitely by a lagging build.
    pub fn next_page(&mut self) -> Result<bool> {
        let known = self.core.known_offsets();
        if self.cursor + 1 < known {
            self.move_to(self.cursor + 1);
            return Ok(true);
        }
        if self.is_index_complete() {
            return Ok(false);
        }

        if self.core.wait_for_more_offsets(known, CATCHUP_WAIT)
            && self.cursor + 1 < self.core.known_offsets()
        {
            self.move_to(self.cursor + 1);
            return Ok(true);
        }
        if self.is_index_complete() {
            return Ok(false);
        }

        debug!("Builder lagging; computing next page on demand");
        if self.compute_next_offset()? {
            self.move_to(self.cursor + 1);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn prev_page(&mut self) -> Result<bool> {
        if self.cursor == 0 {
            return Ok(false);
        }
        self.move_to(self.cursor - 1);
        Ok(true)
    }

    /// Jump to a page, clamped to the currently known range.
    pub fn jump_to_page(&mut self, page: usize) {
        let known = self.core.known_offsets();
        self.move_to(page.min(known.saturating_sub(1)));
    }

    /// Page containing byte `pos`.
    ///
    /// With the index incomplete, a position past the last known offset is
    /// an explicit error rather than a guess; once complete it clamps to
    /// the last page.
    pub fn find_page_for_byte_position(&self, pos: u64) -> Result<usize> {
        let last = u64::from(self.core.last_offset());
        if pos > last && !self.is_index_complete() {
            return Err(ReaderError::PastIndexedEnd { pos, indexed: last });
        }
        let offsets = self.core.snapshot_offsets();
        let idx = offsets.partition_point(|&o| u64::from(o) <= pos);
        Ok(idx.saturating_sub(1))
    }

    pub fn jump_to_percent(&mut self, percent: u8) -> Result<usize> {
        let pos = (self.core.file_size * u64::from(percent.min(100))) / 100;
        let page = self.find_page_for_byte_position(pos)?;
        self.move_to(page);
        Ok(page)
    }

    /// Lay out exactly one page past the known tail and insert its end into
    /// the in-memory offset list. The index file is left to the builder.
    fn compute_next_offset(&mut self) -> Result<bool> {
        let start = u64::from(self.core.last_offset());
        let mut file = self
            .core
            .file
            .try_lock_for(FOREGROUND_LOCK_TIMEOUT)
            .ok_or(ReaderError::LockTimeout(FOREGROUND_LOCK_TIMEOUT))?;
        let fill = layout::fill_page(
            &mut *file,
            start,
            &self.core.params,
            self.core.metrics.as_ref(),
        )?;
        drop(file);

        if fill.raw_consumed == 0 {
            return Ok(false);
        }
        let next = start + fill.raw_consumed;
        if fill.eof || next >= self.core.file_size {
            return Ok(false);
        }
        self.core.append_new_offsets(&[next as u32]);
        Ok(true)
    }

    fn move_to(&mut self, page: usize) {
        if page != self.cursor {
            self.cursor = page;
            self.page_cache = None;
        }
        self.save_bookmark();
    }

    /// Persist the full reading snapshot. Failures are logged, never fatal:
    /// losing one bookmark write must not interrupt reading.
    pub fn save_bookmark(&self) {
        let bookmark = self.bookmark_snapshot();
        if let Err(e) = self.bookmark_store.save(&bookmark) {
            error!("{e:#}");
        }
    }

    fn bookmark_snapshot(&self) -> Bookmark {
        let mut bookmark = Bookmark::new(self.core.params, self.core.file_size);
        bookmark.page = self.cursor;
        bookmark.byte_position = self.current_byte_position();
        bookmark.show_label = self.show_label;
        bookmark.keep_original_script = self.keep_original_script;
        bookmark.draw_underline = self.draw_underline;
        bookmark.read_hours = self.read_hours;
        bookmark.read_minutes = self.read_minutes;
        bookmark.total_pages = if self.is_index_complete() {
            self.core.known_offsets()
        } else {
            0
        };
        bookmark
    }

    /// One minute of active reading; persists the updated counters.
    pub fn tick_reading_minute(&mut self) {
        self.read_minutes += 1;
        if self.read_minutes >= 60 {
            self.read_hours += self.read_minutes / 60;
            self.read_minutes %= 60;
        }
        self.save_bookmark();
    }

    #[must_use]
    pub fn reading_time(&self) -> (u32, u32) {
        (self.read_hours, self.read_minutes)
    }

    #[must_use]
    pub fn tags(&self) -> &TagStore {
        &self.tag_store
    }

    /// Advance the furthest-read auto tag to the current position. A
    /// position behind the stored one is a no-op by design.
    pub fn update_auto_tag(&mut self) {
        let position = self.current_byte_position();
        let percent = self.percent_through();
        let preview = match self.current_page() {
            Ok(text) => sanitize_preview(text),
            Err(e) => {
                debug!("No page text available for auto tag preview: {e}");
                String::new()
            }
        };
        if let Err(e) = self.tag_store.update_auto(position, &preview, percent) {
            error!("{e:#}");
        }
    }

    /// Tag the current position manually.
    pub fn insert_manual_tag(&mut self) {
        let position = self.current_byte_position();
        let percent = self.percent_through();
        let preview = match self.current_page() {
            Ok(text) => sanitize_preview(text),
            Err(e) => {
                debug!("No page text available for tag preview: {e}");
                String::new()
            }
        };
        if let Err(e) = self.tag_store.insert_manual(position, &preview, percent) {
            error!("{e:#}");
        }
    }

    /// Stop the background build after its current batch, persisting its
    /// progress. The index stays resumable.
    pub fn pause_indexing(&mut self) {
        if let Some(build) = self.build.as_mut() {
            build.stop_and_join();
        }
    }

    /// Restart a paused (or never-started) build. A completed index is
    /// left untouched.
    pub fn resume_indexing(&mut self) -> Result<()> {
        if self.is_index_complete() {
            return Ok(());
        }
        if let Some(build) = &self.build {
            if build.state() == BuildState::InProgress {
                return Ok(());
            }
        }
        self.build = Some(builder::spawn(Arc::clone(&self.core), self.build_config)?);
        Ok(())
    }

    /// Discard the index and start over. Always honored; only *implicit*
    /// rebuild requests are subject to the completed-index guard.
    pub fn force_reindex(&mut self) -> Result<()> {
        self.restart_build(true)
    }

    fn restart_build(&mut self, explicit: bool) -> Result<()> {
        // Guard: a mismatch re-check racing a just-finished build must not
        // wipe it.
        if !explicit && self.core.completion.exists() && self.core.known_offsets() > 1 {
            warn!("Ignoring implicit rebuild request: a completed index is in place");
            return Ok(());
        }

        if let Some(mut build) = self.build.take() {
            build.stop_and_join();
        }

        self.core.completion.clear();
        IndexingProgress::delete_verified(&self.core.sidecar.progress());
        self.core.index_file.remove();
        self.core.index_file.create(&[0])?;
        {
            let mut offsets = self.core.offsets.write();
            offsets.clear();
            offsets.push(0);
        }
        self.core.set_scan_offset(0);
        self.cursor = 0;
        self.page_cache = None;

        self.build = Some(builder::spawn(Arc::clone(&self.core), self.build_config)?);
        info!("Forced reindex started for {:?}", self.core.doc_path);
        Ok(())
    }

    pub fn build_state(&self) -> BuildState {
        match &self.build {
            Some(build) => build.state(),
            None if self.is_index_complete() => BuildState::Complete,
            None => BuildState::NotStarted,
        }
    }

    /// Close the document: the builder observes the closing token and
    /// abandons before the shared state goes away; the final bookmark is
    /// persisted afterwards.
    pub fn close(&mut self) {
        self.core.closing.store(true, Ordering::SeqCst);
        if let Some(mut build) = self.build.take() {
            build.stop_and_join();
        }
        self.save_bookmark();
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.close();
    }
}
