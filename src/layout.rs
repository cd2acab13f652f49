//! Glyph-budgeted line breaking and page fill
//!
//! The page fill is the resumption-critical path: alongside the rendered
//! text it reports the exact number of raw source bytes consumed, so the
//! next page can start mid-line at a byte-exact offset.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use unicode_width::UnicodeWidthChar;

use crate::encoding::{self, Encoding};

/// Geometry and encoding a page layout was computed against. Any stored
/// artifact carrying a different snapshot is stale and must be rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutParams {
    /// Display area width in pixels.
    pub area_width: u32,
    /// Display area height in pixels.
    pub area_height: u32,
    /// Font base size in pixels.
    pub font_size: u32,
    /// Vertical writing mode: glyphs run down columns instead of across rows.
    pub vertical: bool,
    pub encoding: Encoding,
}

impl LayoutParams {
    /// Glyph budget along the reading direction of one line.
    pub fn line_capacity(&self) -> u32 {
        if self.vertical {
            self.area_height
        } else {
            self.area_width
        }
    }

    /// Number of display lines (columns in vertical mode) per page.
    pub fn lines_per_page(&self, metrics: &dyn FontMetrics) -> u32 {
        let line_height = metrics.line_height(self.font_size).max(1);
        let across = if self.vertical {
            self.area_width
        } else {
            self.area_height
        };
        (across / line_height).max(1)
    }

    pub(crate) fn write_kv(&self, out: &mut String) {
        out.push_str(&format!("area_width={}\n", self.area_width));
        out.push_str(&format!("area_height={}\n", self.area_height));
        out.push_str(&format!("font_size={}\n", self.font_size));
        out.push_str(&format!("vertical={}\n", self.vertical));
        out.push_str(&format!("encoding={}\n", self.encoding.as_str()));
    }

    pub(crate) fn from_kv(map: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            area_width: map.get("area_width")?.parse().ok()?,
            area_height: map.get("area_height")?.parse().ok()?,
            font_size: map.get("font_size")?.parse().ok()?,
            vertical: map.get("vertical")?.parse().ok()?,
            encoding: Encoding::parse(map.get("encoding")?)?,
        })
    }
}

/// Font metrics supplied by the display collaborator. Both functions must
/// be pure in (codepoint, font size).
pub trait FontMetrics: Send + Sync {
    /// Height of one rendered line; column width in vertical mode.
    fn line_height(&self, font_size: u32) -> u32;
    /// Advance of one glyph along the reading direction.
    fn glyph_width(&self, ch: char, font_size: u32) -> u32;
}

/// Cell-grid metrics: fullwidth glyphs take a whole em, halfwidth half.
#[derive(Clone, Copy, Debug, Default)]
pub struct CellMetrics;

impl FontMetrics for CellMetrics {
    fn line_height(&self, font_size: u32) -> u32 {
        font_size.max(1)
    }

    fn glyph_width(&self, ch: char, font_size: u32) -> u32 {
        let cells = ch.width().unwrap_or(1).max(1) as u32;
        cells * (font_size.max(2) / 2)
    }
}

/// Greedy fill of one display line of `text` starting at byte `start`.
/// Returns the byte index where the line breaks. In vertical mode the
/// leading whitespace of the column is consumed before measuring. Returns
/// `start` unchanged when it cannot advance at all; the caller must treat
/// that as "cannot break" and stop the page.
pub fn break_line(
    text: &str,
    start: usize,
    budget: u32,
    vertical: bool,
    font_size: u32,
    metrics: &dyn FontMetrics,
) -> usize {
    let mut pos = start;
    if vertical {
        for c in text[start..].chars() {
            if !c.is_whitespace() {
                break;
            }
            pos += c.len_utf8();
        }
    }

    let mut used = 0u32;
    for (i, c) in text[pos..].char_indices() {
        let w = metrics.glyph_width(c, font_size);
        if used.saturating_add(w) > budget {
            return pos + i;
        }
        used += w;
    }
    text.len()
}

/// Result of laying out one page.
#[derive(Debug)]
pub struct PageFill {
    /// Rendered page text; display lines joined with `\n`.
    pub text: String,
    /// Exact raw source bytes consumed from the start offset.
    pub raw_consumed: u64,
    /// End of input was reached while producing this page.
    pub eof: bool,
}

/// Lay out one page of `input` starting at raw byte `start`.
///
/// Reads one raw line at a time, converts it tolerantly and breaks it into
/// display lines until the page is full. When only part of a line fits,
/// only the raw bytes behind the laid-out canonical prefix are counted as
/// consumed, so the next page resumes mid-line. When not even one glyph
/// fits, the fill stops without advancing.
pub fn fill_page<R: Read + Seek>(
    input: &mut R,
    start: u64,
    params: &LayoutParams,
    metrics: &dyn FontMetrics,
) -> std::io::Result<PageFill> {
    input.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(input);

    let budget = params.line_capacity();
    let mut lines_left = params.lines_per_page(metrics);
    let mut display_lines: Vec<String> = Vec::new();
    let mut raw_consumed: u64 = 0;
    let mut eof = false;
    let mut raw_line: Vec<u8> = Vec::new();

    while lines_left > 0 {
        raw_line.clear();
        let n = reader.read_until(b'\n', &mut raw_line)?;
        if n == 0 {
            eof = true;
            break;
        }

        // The newline travels with the line so canonical offsets map back
        // into this raw chunk.
        let canonical = encoding::convert_tolerant(&raw_line, params.encoding);
        let mut content_end = canonical.len();
        if canonical.ends_with('\n') {
            content_end -= 1;
            if canonical[..content_end].ends_with('\r') {
                content_end -= 1;
            }
        }
        let content = &canonical[..content_end];

        if content.is_empty() {
            display_lines.push(String::new());
            lines_left -= 1;
            raw_consumed += raw_line.len() as u64;
            continue;
        }

        let mut cursor = 0usize;
        let mut line_done = true;
        while cursor < content.len() {
            if lines_left == 0 {
                line_done = false;
                break;
            }
            let next = break_line(
                content,
                cursor,
                budget,
                params.vertical,
                params.font_size,
                metrics,
            );
            if next == cursor {
                line_done = false;
                break;
            }
            display_lines.push(content[cursor..next].to_string());
            cursor = next;
            lines_left -= 1;
        }

        if line_done {
            raw_consumed += raw_line.len() as u64;
        } else {
            raw_consumed +=
                encoding::map_converted_to_raw(&raw_line, params.encoding, cursor) as u64;
            break;
        }
    }

    Ok(PageFill {
        text: display_lines.join("\n"),
        raw_consumed,
        eof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// 60 halfwidth glyphs per line, 20 lines per page.
    fn page_params() -> LayoutParams {
        LayoutParams {
            area_width: 60,
            area_height: 40,
            font_size: 2,
            vertical: false,
            encoding: Encoding::Utf8,
        }
    }

    #[test]
    fn breaks_at_width_budget() {
        let text = "abcdef";
        let brk = break_line(text, 0, 3, false, 2, &CellMetrics);
        assert_eq!(brk, 3);
        let rest = break_line(text, brk, 3, false, 2, &CellMetrics);
        assert_eq!(rest, 6);
    }

    #[test]
    fn fullwidth_glyphs_cost_double() {
        let text = "一二三";
        // Budget of 4 px at font 2: two fullwidth glyphs
        let brk = break_line(text, 0, 4, false, 2, &CellMetrics);
        assert_eq!(&text[..brk], "一二");
    }

    #[test]
    fn cannot_break_returns_start() {
        let brk = break_line("一", 0, 1, false, 2, &CellMetrics);
        assert_eq!(brk, 0);
    }

    #[test]
    fn vertical_mode_skips_leading_whitespace() {
        let text = "   abc";
        let brk = break_line(text, 0, 2, true, 2, &CellMetrics);
        // Whitespace consumed without cost, then two glyphs
        assert_eq!(&text[..brk], "   ab");

        let horizontal = break_line(text, 0, 2, false, 2, &CellMetrics);
        assert_eq!(&text[..horizontal], "  ");
    }

    #[test]
    fn fill_consumes_whole_short_lines() {
        let doc = b"first line\nsecond line\n";
        let mut input = Cursor::new(doc.to_vec());
        let fill = fill_page(&mut input, 0, &page_params(), &CellMetrics).unwrap();
        assert_eq!(fill.text, "first line\nsecond line");
        assert_eq!(fill.raw_consumed, doc.len() as u64);
        assert!(fill.eof);
    }

    #[test]
    fn fill_reports_partial_line_consumption() {
        // One 500-byte line against a page fitting 300 glyph-widths
        let long = "x".repeat(500);
        let mut params = page_params();
        params.area_height = 10; // 5 lines of 60 -> 300 glyphs
        let mut input = Cursor::new(long.clone().into_bytes());

        let first = fill_page(&mut input, 0, &params, &CellMetrics).unwrap();
        assert_eq!(first.raw_consumed, 300);
        assert!(first.raw_consumed < long.len() as u64);

        let second = fill_page(&mut input, first.raw_consumed, &params, &CellMetrics).unwrap();
        assert_eq!(second.raw_consumed, 200);
        assert!(second.eof);

        let joined = format!(
            "{}{}",
            first.text.replace('\n', ""),
            second.text.replace('\n', "")
        );
        assert_eq!(joined, long);
    }

    #[test]
    fn fill_resumes_mid_multibyte_line() {
        // Fullwidth text forces the split inside a run of 3-byte chars
        let line = "满纸荒唐言一把辛酸泪都云作者痴谁解其中味".repeat(10);
        let mut params = page_params();
        params.area_height = 4; // 2 lines of 60 px -> 60 fullwidth glyphs
        let mut input = Cursor::new(line.clone().into_bytes());

        let mut collected = String::new();
        let mut offset = 0u64;
        loop {
            let fill = fill_page(&mut input, offset, &params, &CellMetrics).unwrap();
            if fill.raw_consumed == 0 {
                assert!(fill.eof);
                break;
            }
            collected.push_str(&fill.text.replace('\n', ""));
            offset += fill.raw_consumed;
        }
        assert_eq!(collected, line);
    }

    #[test]
    fn blank_lines_occupy_page_height() {
        let doc = "\n".repeat(100);
        let mut input = Cursor::new(doc.into_bytes());
        let fill = fill_page(&mut input, 0, &page_params(), &CellMetrics).unwrap();
        // 20-line page consumes exactly 20 blank lines
        assert_eq!(fill.raw_consumed, 20);
        assert!(!fill.eof);
    }

    #[test]
    fn empty_input_is_eof_without_progress() {
        let mut input = Cursor::new(Vec::new());
        let fill = fill_page(&mut input, 0, &page_params(), &CellMetrics).unwrap();
        assert!(fill.eof);
        assert_eq!(fill.raw_consumed, 0);
        assert!(fill.text.is_empty());
    }

    #[test]
    fn params_kv_round_trip() {
        let params = LayoutParams {
            area_width: 480,
            area_height: 800,
            font_size: 24,
            vertical: true,
            encoding: Encoding::LegacyDbcs,
        };
        let mut kv = String::new();
        params.write_kv(&mut kv);
        let map: HashMap<String, String> = kv
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(LayoutParams::from_kv(&map), Some(params));
    }
}
