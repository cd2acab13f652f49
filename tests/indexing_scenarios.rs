//! End-to-end scenarios: incremental builds, stale-parameter reopens,
//! mid-line page splits and crash-resume behavior.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use inkdex::page_index::PageIndexFile;
use inkdex::progress::IndexingProgress;
use inkdex::sidecar::Sidecar;
use inkdex::{
    BuildConfig, BuildState, CellMetrics, DocumentHandle, Encoding, FontMetrics, Geometry,
    ReaderError,
};
use tempfile::TempDir;

/// 60 halfwidth glyphs per line, 20 lines per page.
fn small_geometry() -> Geometry {
    Geometry {
        area_width: 60,
        area_height: 40,
        font_size: 2,
        vertical: false,
    }
}

fn batch_of_4() -> BuildConfig {
    BuildConfig {
        pages_per_cycle: 4,
        persist_interval: Duration::from_millis(50),
        stall_cycle_limit: 10,
        contention_backoff: Duration::from_millis(1),
    }
}

fn write_doc(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

/// 200 lines of 49 chars + newline: exactly 10,000 bytes, 10 pages under
/// the small geometry.
fn ten_kb_doc() -> Vec<u8> {
    let line = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJKLM\n";
    assert_eq!(line.len(), 50);
    line.repeat(200).into_bytes()
}

fn open(doc: &Path, state: &Path, geometry: Geometry) -> DocumentHandle {
    DocumentHandle::open_with_config(doc, state, geometry, Arc::new(CellMetrics), batch_of_4())
        .unwrap()
}

/// Cell metrics with a per-page delay, so tests can observe the build
/// while it is reliably still incomplete.
struct ThrottledMetrics;

impl FontMetrics for ThrottledMetrics {
    fn line_height(&self, font_size: u32) -> u32 {
        std::thread::sleep(Duration::from_millis(2));
        CellMetrics.line_height(font_size)
    }

    fn glyph_width(&self, ch: char, font_size: u32) -> u32 {
        CellMetrics.glyph_width(ch, font_size)
    }
}

fn open_throttled(doc: &Path, state: &Path, geometry: Geometry) -> DocumentHandle {
    DocumentHandle::open_with_config(
        doc,
        state,
        geometry,
        Arc::new(ThrottledMetrics),
        batch_of_4(),
    )
    .unwrap()
}

fn wait_complete(handle: &DocumentHandle) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !handle.is_index_complete() {
        assert!(Instant::now() < deadline, "index build did not complete");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn incremental_build_of_ten_kb_document() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    let handle = open(&doc, &state, small_geometry());
    wait_complete(&handle);

    let sidecar = Sidecar::new(&state, &doc);
    let offsets = PageIndexFile::new(sidecar.page_index()).load().unwrap();
    assert_eq!(offsets[0], 0);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    assert!(*offsets.last().unwrap() < 10_000);
    assert_eq!(offsets, vec![0, 1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 9000]);

    assert!(sidecar.complete().exists());
    assert!(!IndexingProgress::exists(&sidecar.progress()));
    assert_eq!(handle.known_page_count(), 10);
    assert_eq!(handle.indexing_progress_percent(), 100);
}

#[test]
fn bookmark_restores_with_matching_geometry() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    {
        let mut handle = open(&doc, &state, small_geometry());
        wait_complete(&handle);
        handle.jump_to_page(2);
        handle.tick_reading_minute();
        handle.close();
    }

    let handle = open(&doc, &state, small_geometry());
    assert_eq!(handle.current_page_index(), 2);
    assert_eq!(handle.reading_time(), (0, 1));
    assert!(handle.is_index_complete());
    assert_eq!(handle.build_state(), BuildState::Complete);
}

#[test]
fn halved_width_discards_bookmark_and_rebuilds() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    {
        let mut handle = open(&doc, &state, small_geometry());
        wait_complete(&handle);
        handle.jump_to_page(5);
        handle.close();
    }

    // Same document, area width halved
    let mut geometry = small_geometry();
    geometry.area_width = 30;
    let mut handle = open(&doc, &state, geometry);

    // Page 0 is served immediately, without waiting for the rebuild
    assert_eq!(handle.current_page_index(), 0);
    let first = handle.current_page().unwrap().to_string();
    assert!(first.starts_with("abcdefghijklmnopqrstuvwxyz0123"));

    // 49-char lines now wrap into two display lines: twice the pages
    wait_complete(&handle);
    assert_eq!(handle.known_page_count(), 20);
}

#[test]
fn long_line_splits_across_pages_byte_exactly() {
    let dir = TempDir::new().unwrap();
    // A single 500-byte line against a page fitting 300 glyph widths
    let line = "m".repeat(500);
    let doc = write_doc(&dir, "line.txt", line.as_bytes());
    let state = dir.path().join("state");

    let geometry = Geometry {
        area_width: 60,
        area_height: 10, // 5 lines of 60 -> 300 glyphs per page
        font_size: 2,
        vertical: false,
    };
    let mut handle = open(&doc, &state, geometry);
    wait_complete(&handle);
    assert_eq!(handle.known_page_count(), 2);

    handle.jump_to_page(0);
    let first = handle.current_page().unwrap().replace('\n', "");
    assert_eq!(first.len(), 300);
    assert!(handle.next_page().unwrap());
    let second = handle.current_page().unwrap().replace('\n', "");
    assert_eq!(format!("{first}{second}"), line);
}

#[test]
fn dbcs_document_round_trips_through_pages() {
    let dir = TempDir::new().unwrap();
    // GBK text with an unmappable byte thrown in; 0xB0 0xA1 pairs are
    // invalid as UTF-8, so detection must pick the legacy encoding
    let mut raw = Vec::new();
    for _ in 0..40 {
        for _ in 0..20 {
            raw.extend_from_slice(&[0xB0, 0xA1]); // 啊
        }
        raw.push(b'\n');
    }
    raw.push(0x80); // maps to a placeholder
    raw.push(b'\n');
    let doc = write_doc(&dir, "legacy.txt", &raw);
    let state = dir.path().join("state");

    let mut handle = open(&doc, &state, small_geometry());
    assert_eq!(handle.params().encoding, Encoding::LegacyDbcs);
    wait_complete(&handle);

    let mut collected = String::new();
    handle.jump_to_page(0);
    loop {
        collected.push_str(handle.current_page().unwrap());
        if !handle.next_page().unwrap() {
            break;
        }
    }

    let expected = inkdex::encoding::convert_tolerant(&raw, Encoding::LegacyDbcs);
    let strip = |s: &str| s.chars().filter(|c| *c != '\n').collect::<String>();
    assert_eq!(strip(&collected), strip(&expected));
}

#[test]
fn byte_position_lookup_fails_past_incomplete_index() {
    let dir = TempDir::new().unwrap();
    // Throttled layout keeps the build reliably incomplete at first
    let line = "some words that fill a line of text with content here 12345\n";
    let doc = write_doc(&dir, "big.txt", line.repeat(2_000).as_bytes());
    let state = dir.path().join("state");

    let handle = open_throttled(&doc, &state, small_geometry());
    let size = handle.file_size();
    match handle.find_page_for_byte_position(size - 10) {
        Err(ReaderError::PastIndexedEnd { .. }) => {}
        other => panic!("expected PastIndexedEnd, got {other:?}"),
    }

    wait_complete(&handle);
    // Complete index clamps instead
    let last = handle.find_page_for_byte_position(size + 1000).unwrap();
    assert_eq!(last, handle.known_page_count() - 1);
}

#[test]
fn navigation_never_stalls_while_indexing() {
    let dir = TempDir::new().unwrap();
    let line = "some words that fill a line of text with content here 12345\n";
    let doc = write_doc(&dir, "big.txt", line.repeat(2_000).as_bytes());
    let state = dir.path().join("state");

    let mut handle = open_throttled(&doc, &state, small_geometry());
    // Paging forward right after open must succeed even if the builder
    // has not surfaced the offsets yet
    for expected in 1..=5 {
        assert!(handle.next_page().unwrap());
        assert_eq!(handle.current_page_index(), expected);
        assert!(!handle.current_page().unwrap().is_empty());
    }
    assert!(handle.prev_page().unwrap());
    assert_eq!(handle.current_page_index(), 4);
}

#[test]
fn interrupted_build_resumes_without_rescan() {
    let dir = TempDir::new().unwrap();
    let line = "some words that fill a line of text with content here 12345\n";
    let content = line.repeat(2_000);
    let doc = write_doc(&dir, "big.txt", content.as_bytes());
    let state = dir.path().join("state");

    {
        let mut handle = open_throttled(&doc, &state, small_geometry());
        std::thread::sleep(Duration::from_millis(50));
        handle.close();
    }

    let sidecar = Sidecar::new(&state, &doc);
    assert!(!sidecar.complete().exists());
    let partial = PageIndexFile::new(sidecar.page_index()).load().unwrap();
    assert!(!partial.is_empty());

    // Second session picks up where the first left off
    let handle = open(&doc, &state, small_geometry());
    wait_complete(&handle);
    let resumed = PageIndexFile::new(sidecar.page_index()).load().unwrap();
    drop(handle);

    // Reference build in a fresh state dir must agree exactly
    let fresh_state = dir.path().join("fresh");
    let fresh = open(&doc, &fresh_state, small_geometry());
    wait_complete(&fresh);
    let reference = PageIndexFile::new(Sidecar::new(&fresh_state, &doc).page_index())
        .load()
        .unwrap();

    assert_eq!(resumed, reference);
    assert!(resumed.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn pause_persists_progress_and_resume_finishes() {
    let dir = TempDir::new().unwrap();
    let line = "some words that fill a line of text with content here 12345\n";
    let doc = write_doc(&dir, "big.txt", line.repeat(2_000).as_bytes());
    let state = dir.path().join("state");

    let mut handle = open_throttled(&doc, &state, small_geometry());
    handle.pause_indexing();

    assert_eq!(handle.build_state(), BuildState::Paused);
    assert!(!handle.is_index_complete());
    let sidecar = Sidecar::new(&state, &doc);
    assert!(IndexingProgress::exists(&sidecar.progress()));

    // Reading still works while paused
    assert!(handle.next_page().unwrap());

    handle.resume_indexing().unwrap();
    wait_complete(&handle);
    assert!(!IndexingProgress::exists(&sidecar.progress()));

    // The file caught up with every in-memory entry, including any the
    // foreground inserted while the builder was paused
    let offsets = PageIndexFile::new(sidecar.page_index()).load().unwrap();
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(offsets.len(), handle.known_page_count());
}

#[test]
fn vertical_mode_paginates_by_columns() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    // 20 columns of 60 glyph-widths: same capacity as the horizontal
    // geometry with the axes swapped
    let geometry = Geometry {
        area_width: 40,
        area_height: 60,
        font_size: 2,
        vertical: true,
    };
    let handle = open(&doc, &state, geometry);
    wait_complete(&handle);
    assert_eq!(handle.known_page_count(), 10);
}

#[test]
fn completed_index_is_never_extended() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    let sidecar = Sidecar::new(&state, &doc);
    {
        let mut handle = open(&doc, &state, small_geometry());
        wait_complete(&handle);
        handle.close();
    }
    let frozen = fs::read(sidecar.page_index()).unwrap();

    // Paging all over the document in a new session appends nothing
    {
        let mut handle = open(&doc, &state, small_geometry());
        handle.jump_to_page(9);
        assert!(!handle.next_page().unwrap());
        handle.jump_to_page(0);
        while handle.next_page().unwrap() {}
        handle.close();
    }
    assert_eq!(fs::read(sidecar.page_index()).unwrap(), frozen);
}

#[test]
fn force_reindex_rebuilds_from_scratch() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    let mut handle = open(&doc, &state, small_geometry());
    wait_complete(&handle);
    handle.jump_to_page(7);

    handle.force_reindex().unwrap();
    assert_eq!(handle.current_page_index(), 0);
    wait_complete(&handle);
    assert_eq!(handle.known_page_count(), 10);

    let sidecar = Sidecar::new(&state, &doc);
    assert!(sidecar.complete().exists());
    assert!(!IndexingProgress::exists(&sidecar.progress()));
    assert_eq!(
        PageIndexFile::new(sidecar.page_index()).validate().unwrap(),
        10
    );
}

#[test]
fn jump_to_percent_lands_proportionally() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    let mut handle = open(&doc, &state, small_geometry());
    wait_complete(&handle);

    assert_eq!(handle.jump_to_percent(0).unwrap(), 0);
    assert_eq!(handle.jump_to_percent(50).unwrap(), 5);
    assert_eq!(handle.jump_to_percent(100).unwrap(), 9);
}

#[test]
fn auto_tag_survives_backwards_navigation() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    let mut handle = open(&doc, &state, small_geometry());
    wait_complete(&handle);

    handle.jump_to_page(6);
    handle.update_auto_tag();
    let furthest = handle.current_byte_position();

    handle.jump_to_page(1);
    handle.update_auto_tag();

    let tags = handle.tags().load();
    let auto: Vec<_> = tags.iter().filter(|t| t.is_auto).collect();
    assert_eq!(auto.len(), 1);
    assert_eq!(auto[0].position, furthest);
}

#[test]
fn corrupt_count_field_self_heals_on_reopen() {
    let dir = TempDir::new().unwrap();
    let doc = write_doc(&dir, "book.txt", &ten_kb_doc());
    let state = dir.path().join("state");

    let sidecar = Sidecar::new(&state, &doc);
    {
        let handle = open(&doc, &state, small_geometry());
        wait_complete(&handle);
    }

    // Corrupt the advisory count field in place
    let mut raw = fs::read(sidecar.page_index()).unwrap();
    raw[8..12].copy_from_slice(&0u32.to_le_bytes());
    fs::write(sidecar.page_index(), &raw).unwrap();

    let mut handle = open(&doc, &state, small_geometry());
    assert_eq!(handle.known_page_count(), 10);
    assert!(handle.is_index_complete());
    handle.jump_to_page(9);
    assert!(!handle.current_page().unwrap().is_empty());
}
