//! Crash-safe reading-position store

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;

use crate::atomic_store;
use crate::layout::LayoutParams;

/// Full reading-position snapshot. Rewritten after every page turn and
/// after every minute of active reading; always readable even while the
/// page index is incomplete.
#[derive(Clone, Debug, PartialEq)]
pub struct Bookmark {
    pub page: usize,
    pub byte_position: u64,
    /// Document size the snapshot was taken against; a different size on
    /// open invalidates the position.
    pub file_size: u64,
    pub params: LayoutParams,
    pub show_label: bool,
    pub keep_original_script: bool,
    pub draw_underline: bool,
    pub read_hours: u32,
    pub read_minutes: u32,
    /// Authoritative page count, persisted once indexing completes; zero
    /// while unknown.
    pub total_pages: usize,
    pub last_read: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(params: LayoutParams, file_size: u64) -> Self {
        Self {
            page: 0,
            byte_position: 0,
            file_size,
            params,
            show_label: true,
            keep_original_script: false,
            draw_underline: false,
            read_hours: 0,
            read_minutes: 0,
            total_pages: 0,
            last_read: Utc::now(),
        }
    }

    /// One minute of active reading, with hour carry.
    pub fn add_reading_minute(&mut self) {
        self.read_minutes += 1;
        if self.read_minutes >= 60 {
            self.read_hours += self.read_minutes / 60;
            self.read_minutes %= 60;
        }
    }
}

pub struct BookmarkStore {
    path: PathBuf,
}

impl BookmarkStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Restore the bookmark if one is readable; a missing or unparsable
    /// file is simply "no bookmark".
    pub fn load(&self) -> Option<Bookmark> {
        atomic_store::restore_if_needed(&self.path);
        let content = fs::read_to_string(&self.path).ok()?;
        let map: HashMap<String, String> = content
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let flag = |key: &str, default: bool| {
            map.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let number = |key: &str| map.get(key).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);

        Some(Bookmark {
            page: map.get("page")?.parse().ok()?,
            byte_position: map.get("byte_position")?.parse().ok()?,
            file_size: map.get("file_size")?.parse().ok()?,
            params: LayoutParams::from_kv(&map)?,
            show_label: flag("show_label", true),
            keep_original_script: flag("keep_original_script", false),
            draw_underline: flag("draw_underline", false),
            read_hours: number("read_hours"),
            read_minutes: number("read_minutes"),
            total_pages: map
                .get("total_pages")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_read: map
                .get("last_read")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }

    pub fn save(&self, bookmark: &Bookmark) -> Result<()> {
        let mut content = String::new();
        content.push_str(&format!("page={}\n", bookmark.page));
        content.push_str(&format!("byte_position={}\n", bookmark.byte_position));
        content.push_str(&format!("file_size={}\n", bookmark.file_size));
        bookmark.params.write_kv(&mut content);
        content.push_str(&format!("show_label={}\n", bookmark.show_label));
        content.push_str(&format!(
            "keep_original_script={}\n",
            bookmark.keep_original_script
        ));
        content.push_str(&format!("draw_underline={}\n", bookmark.draw_underline));
        content.push_str(&format!("read_hours={}\n", bookmark.read_hours));
        content.push_str(&format!("read_minutes={}\n", bookmark.read_minutes));
        content.push_str(&format!("total_pages={}\n", bookmark.total_pages));
        content.push_str(&format!("last_read={}\n", bookmark.last_read.to_rfc3339()));

        atomic_store::scoped_write(&self.path, |f| f.write_all(content.as_bytes()))
            .with_context(|| format!("Failed to save bookmark to {:?}", self.path))?;
        debug!("Saved bookmark: page {}", bookmark.page);
        Ok(())
    }

    pub fn remove(&self) -> bool {
        atomic_store::remove_verified(&self.path)
    }
}
