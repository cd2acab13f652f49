//! Bounded annotation store: one auto slot plus up to nine manual slots
//!
//! The auto entry is the furthest-reading-progress protector: its position
//! never decreases, and an update carrying a smaller position is a silent
//! no-op that still reports success.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::atomic_store;

pub const MAX_MANUAL_TAGS: usize = 9;
const MAX_PREVIEW_GLYPHS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagEntry {
    pub position: u64,
    pub preview: String,
    /// Percentage through the document, 0..=100.
    pub percent: u8,
    pub is_auto: bool,
}

impl TagEntry {
    fn to_line(&self) -> String {
        let prefix = if self.is_auto { 'A' } else { 'M' };
        format!(
            "{prefix}:{}:\"{}\":{}",
            self.position, self.preview, self.percent
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let (prefix, rest) = line.split_once(':')?;
        let is_auto = match prefix {
            "A" => true,
            "M" => false,
            _ => return None,
        };
        let (position, rest) = rest.split_once(':')?;
        let rest = rest.strip_prefix('"')?;
        let (preview, rest) = rest.split_once('"')?;
        let percent = rest.strip_prefix(':')?;
        Some(Self {
            position: position.parse().ok()?,
            preview: preview.to_string(),
            percent: percent.parse().ok()?,
            is_auto,
        })
    }
}

/// First ten visible codepoints of `text`: whitespace and line breaks
/// stripped, quotes dropped because they delimit the stored preview.
pub fn sanitize_preview(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '"')
        .take(MAX_PREVIEW_GLYPHS)
        .collect()
}

pub struct TagStore {
    path: PathBuf,
}

impl TagStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// All tags sorted by position; unparsable lines are dropped with a
    /// warning rather than failing the whole list.
    pub fn load(&self) -> Vec<TagEntry> {
        atomic_store::restore_if_needed(&self.path);
        let Ok(content) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let mut tags: Vec<TagEntry> = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match TagEntry::parse_line(line) {
                Some(tag) => tags.push(tag),
                None => warn!("Dropping unparsable tag line in {:?}: {line}", self.path),
            }
        }
        Self::normalize(&mut tags);
        tags
    }

    fn save(&self, tags: &[TagEntry]) -> Result<()> {
        let mut content = String::new();
        for tag in tags {
            content.push_str(&tag.to_line());
            content.push('\n');
        }
        atomic_store::scoped_write(&self.path, |f| f.write_all(content.as_bytes()))
            .with_context(|| format!("Failed to save tags to {:?}", self.path))
    }

    /// Sort by position and enforce the bounds: one auto entry at most
    /// (furthest wins), then at most nine manual entries with the
    /// earliest-in-document evicted first.
    fn normalize(tags: &mut Vec<TagEntry>) {
        if tags.iter().filter(|t| t.is_auto).count() > 1 {
            let furthest = tags
                .iter()
                .filter(|t| t.is_auto)
                .max_by_key(|t| t.position)
                .cloned();
            tags.retain(|t| !t.is_auto);
            if let Some(auto) = furthest {
                tags.push(auto);
            }
        }
        tags.sort_by_key(|t| (t.position, t.is_auto));
        while tags.iter().filter(|t| !t.is_auto).count() > MAX_MANUAL_TAGS {
            if let Some(first_manual) = tags.iter().position(|t| !t.is_auto) {
                tags.remove(first_manual);
            }
        }
    }

    /// Advance the auto slot. Positions only ever move forward; a smaller
    /// position is accepted silently without touching the store.
    pub fn update_auto(&self, position: u64, preview: &str, percent: u8) -> Result<()> {
        let mut tags = self.load();
        if let Some(auto) = tags.iter().find(|t| t.is_auto) {
            if position <= auto.position {
                debug!(
                    "Auto tag already at {} (>= {position}); keeping it",
                    auto.position
                );
                return Ok(());
            }
        }
        tags.retain(|t| !t.is_auto);
        tags.push(TagEntry {
            position,
            preview: sanitize_preview(preview),
            percent: percent.min(100),
            is_auto: true,
        });
        Self::normalize(&mut tags);
        self.save(&tags)
    }

    pub fn insert_manual(&self, position: u64, preview: &str, percent: u8) -> Result<()> {
        let mut tags = self.load();
        // Re-tagging the same position replaces the entry
        tags.retain(|t| t.is_auto || t.position != position);
        tags.push(TagEntry {
            position,
            preview: sanitize_preview(preview),
            percent: percent.min(100),
            is_auto: false,
        });
        Self::normalize(&mut tags);
        self.save(&tags)
    }

    /// Delete the tag at `index` in position order. Returns whether a tag
    /// was removed.
    pub fn delete_at(&self, index: usize) -> Result<bool> {
        let mut tags = self.load();
        if index >= tags.len() {
            return Ok(false);
        }
        tags.remove(index);
        self.save(&tags)?;
        Ok(true)
    }

    pub fn delete_by_position(&self, position: u64) -> Result<bool> {
        let mut tags = self.load();
        let before = tags.len();
        tags.retain(|t| t.position != position);
        if tags.len() == before {
            return Ok(false);
        }
        self.save(&tags)?;
        Ok(true)
    }

    pub fn remove_all(&self) -> bool {
        atomic_store::remove_verified(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TagStore {
        TagStore::new(dir.path().join("doc.tags"))
    }

    #[test]
    fn auto_tag_only_moves_forward() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for pos in [100u64, 500, 300, 50, 499] {
            store.update_auto(pos, "preview", 10).unwrap();
        }

        let tags = store.load();
        let auto: Vec<_> = tags.iter().filter(|t| t.is_auto).collect();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].position, 500);
    }

    #[test]
    fn manual_bound_evicts_earliest() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for pos in 1..=10u64 {
            store.insert_manual(pos * 100, &format!("tag {pos}"), 0).unwrap();
        }

        let tags = store.load();
        let manual: Vec<_> = tags.iter().filter(|t| !t.is_auto).collect();
        assert_eq!(manual.len(), MAX_MANUAL_TAGS);
        // Position 100 (the earliest) was evicted
        assert_eq!(manual[0].position, 200);
        assert_eq!(manual.last().unwrap().position, 1000);
    }

    #[test]
    fn tags_are_sorted_by_position() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.insert_manual(900, "end", 90).unwrap();
        store.insert_manual(100, "start", 10).unwrap();
        store.update_auto(500, "middle", 50).unwrap();

        let positions: Vec<u64> = store.load().iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![100, 500, 900]);
    }

    #[test]
    fn preview_is_sanitized() {
        assert_eq!(sanitize_preview("  line\nbreaks\r here "), "linebreaksh");
        assert_eq!(sanitize_preview("短预览"), "短预览");
        assert_eq!(sanitize_preview("say \"hi\""), "sayhi");
        assert_eq!(
            sanitize_preview("a very long preview that keeps going").chars().count(),
            10
        );
    }

    #[test]
    fn line_format_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.update_auto(1234, "某一页的预览", 42).unwrap();
        store.insert_manual(77, "note", 3).unwrap();

        let content = fs::read_to_string(dir.path().join("doc.tags")).unwrap();
        assert!(content.contains("A:1234:\"某一页的预览\":42"));
        assert!(content.contains("M:77:\"note\":3"));

        let tags = store.load();
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn unparsable_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.tags");
        fs::write(&path, "garbage\nM:50:\"ok\":5\nX:1:\"bad\":1\n").unwrap();

        let store = TagStore::new(path);
        let tags = store.load();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].position, 50);
    }

    #[test]
    fn retagging_same_position_replaces() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.insert_manual(100, "first", 1).unwrap();
        store.insert_manual(100, "second", 1).unwrap();

        let tags = store.load();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].preview, "second");
    }

    #[test]
    fn delete_by_index_and_position() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.insert_manual(100, "a", 1).unwrap();
        store.insert_manual(200, "b", 2).unwrap();
        store.insert_manual(300, "c", 3).unwrap();

        assert!(store.delete_by_position(200).unwrap());
        assert!(!store.delete_by_position(200).unwrap());
        assert!(store.delete_at(0).unwrap());

        let tags = store.load();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].position, 300);
    }
}
