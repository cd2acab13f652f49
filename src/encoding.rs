//! Byte encoding detection and tolerant conversion
//!
//! Conversion never fails: unmappable input becomes a placeholder glyph and
//! the decoder always advances, so layout can run over arbitrary bytes.

use encoding_rs::GBK;
use log::debug;

/// Substituted for any byte sequence neither encoding can map.
pub const PLACEHOLDER: char = '\u{FFFD}';

/// Leading sample window used by [`detect`].
const DETECT_WINDOW: usize = 4096;

/// Share of DBCS pairs among multi-byte units that flips detection.
const DBCS_RATIO_THRESHOLD: f32 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// Double-byte legacy codepage (GBK tables).
    LegacyDbcs,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::LegacyDbcs => "dbcs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "utf8" => Some(Encoding::Utf8),
            "dbcs" => Some(Encoding::LegacyDbcs),
            _ => None,
        }
    }
}

fn is_dbcs_lead(b: u8) -> bool {
    (0x81..=0xFE).contains(&b)
}

fn is_dbcs_trail(b: u8) -> bool {
    (0x40..=0xFE).contains(&b) && b != 0x7F
}

/// Valid UTF-8 sequence starting at `pos`, if any. Rejects overlong forms
/// and surrogates via the std validator.
fn utf8_sequence(raw: &[u8], pos: usize) -> Option<&str> {
    let len = match raw[pos] {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return None,
    };
    if pos + len > raw.len() {
        return None;
    }
    std::str::from_utf8(&raw[pos..pos + len]).ok()
}

/// Decode the DBCS pair at `pos`, if the bytes form an assigned pair.
fn decode_dbcs_pair(raw: &[u8], pos: usize) -> Option<String> {
    if pos + 2 > raw.len() || !is_dbcs_lead(raw[pos]) || !is_dbcs_trail(raw[pos + 1]) {
        return None;
    }
    let (decoded, had_errors) = GBK.decode_without_bom_handling(&raw[pos..pos + 2]);
    if had_errors {
        None
    } else {
        Some(decoded.into_owned())
    }
}

/// Guess the document encoding from a leading sample.
///
/// A UTF-8 BOM short-circuits. Otherwise a single pass classifies each
/// multi-byte unit: valid UTF-8 sequences first, then DBCS lead/trail
/// pairs. Real DBCS text produces a large share of pairs whose trail byte
/// cannot be a UTF-8 continuation, so a 0.3 pair ratio is enough to flip.
pub fn detect(bytes: &[u8]) -> Encoding {
    let sample = &bytes[..bytes.len().min(DETECT_WINDOW)];
    if sample.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Encoding::Utf8;
    }

    let mut utf8_seqs = 0usize;
    let mut dbcs_pairs = 0usize;
    let mut i = 0;
    while i < sample.len() {
        if sample[i] < 0x80 {
            i += 1;
        } else if let Some(s) = utf8_sequence(sample, i) {
            utf8_seqs += 1;
            i += s.len();
        } else if i + 1 < sample.len() && is_dbcs_lead(sample[i]) && is_dbcs_trail(sample[i + 1]) {
            dbcs_pairs += 1;
            i += 2;
        } else {
            i += 1;
        }
    }

    let total = utf8_seqs + dbcs_pairs;
    if total == 0 {
        return Encoding::Utf8;
    }
    let ratio = dbcs_pairs as f32 / total as f32;
    let detected = if ratio >= DBCS_RATIO_THRESHOLD {
        Encoding::LegacyDbcs
    } else {
        Encoding::Utf8
    };
    debug!(
        "Encoding detection: {utf8_seqs} utf8 sequences, {dbcs_pairs} dbcs pairs -> {}",
        detected.as_str()
    );
    detected
}

/// Decode one unit of `raw` at `pos` under `primary`, appending canonical
/// text to `out`. The declared encoding is tried first; on failure the
/// other encoding gets one shot at the byte pair; after that a placeholder
/// is emitted and exactly one byte is consumed. Always returns ≥ 1.
fn decode_step(raw: &[u8], pos: usize, primary: Encoding, out: &mut String) -> usize {
    let b = raw[pos];
    if b < 0x80 {
        out.push(b as char);
        return 1;
    }
    match primary {
        Encoding::Utf8 => {
            if let Some(s) = utf8_sequence(raw, pos) {
                let len = s.len();
                out.push_str(s);
                return len;
            }
            if let Some(s) = decode_dbcs_pair(raw, pos) {
                out.push_str(&s);
                return 2;
            }
        }
        Encoding::LegacyDbcs => {
            if let Some(s) = decode_dbcs_pair(raw, pos) {
                out.push_str(&s);
                return 2;
            }
            if let Some(s) = utf8_sequence(raw, pos) {
                let len = s.len();
                out.push_str(s);
                return len;
            }
        }
    }
    out.push(PLACEHOLDER);
    1
}

/// Convert raw bytes to canonical UTF-8 text. Infallible by construction.
pub fn convert_tolerant(raw: &[u8], from: Encoding) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pos = 0;
    while pos < raw.len() {
        pos += decode_step(raw, pos, from, &mut out);
    }
    out
}

/// Number of raw bytes that produce the first `converted_len` bytes of the
/// tolerant conversion of `raw`. Re-runs the same decoder, stopping as soon
/// as the cumulative canonical byte count reaches `converted_len`; this is
/// what makes a partially-consumed line resumable at a byte-exact raw
/// offset.
pub fn map_converted_to_raw(raw: &[u8], from: Encoding, converted_len: usize) -> usize {
    let mut pos = 0;
    let mut produced = 0;
    let mut buf = String::new();
    while pos < raw.len() && produced < converted_len {
        buf.clear();
        pos += decode_step(raw, pos, from, &mut buf);
        produced += buf.len();
    }
    pos
}
