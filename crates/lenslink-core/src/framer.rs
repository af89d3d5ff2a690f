//! Text pagination and page framing.
//!
//! Text is word-wrapped against an injected [`TextMeasurer`], grouped into
//! pages of `lines_per_page` lines, and every page is sent as exactly two
//! sub-packets: the first `first_packet_lines` lines, then the rest (which
//! may be empty — the device still expects the second packet).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::codec::{build_text_packet, truncate_utf8, wrap_u16, wrap_u8, DisplayMode, TextHeader};
use crate::config::DisplayConfig;

// MARK: - TextMeasurer

/// Font metrics used to decide where lines break.
pub trait TextMeasurer: Send + Sync {
    /// Rendered width of `text` in display units.
    fn measure(&self, text: &str) -> f32;
}

/// Every character has the same advance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonospaceMeasurer {
    pub advance: f32,
}

impl MonospaceMeasurer {
    pub fn new(advance: f32) -> Self {
        Self { advance }
    }

    /// Approximates the lens font with an advance of half the font size.
    pub fn for_font_size(font_size: f32) -> Self {
        Self::new(font_size * 0.5)
    }
}

impl TextMeasurer for MonospaceMeasurer {
    fn measure(&self, text: &str) -> f32 {
        text.chars().count() as f32 * self.advance
    }
}

/// Per-character advances, e.g. extracted from the device font.
#[derive(Debug, Clone, Default)]
pub struct WidthTableMeasurer {
    widths: HashMap<char, f32>,
    fallback: f32,
}

impl WidthTableMeasurer {
    pub fn new(fallback: f32) -> Self {
        Self {
            widths: HashMap::new(),
            fallback,
        }
    }

    pub fn with_width(mut self, ch: char, width: f32) -> Self {
        self.widths.insert(ch, width);
        self
    }
}

impl TextMeasurer for WidthTableMeasurer {
    fn measure(&self, text: &str) -> f32 {
        text.chars()
            .map(|ch| self.widths.get(&ch).copied().unwrap_or(self.fallback))
            .sum()
    }
}

// MARK: - Page

/// One screen of text. Immutable once produced by [`TextFramer::paginate`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Page {
    lines: Vec<String>,
}

impl Page {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Lines carried by the first sub-packet.
    pub fn first_lines(&self, n: usize) -> &[String] {
        &self.lines[..n.min(self.lines.len())]
    }

    /// Lines carried by the second sub-packet; empty for short pages.
    pub fn remaining_lines(&self, n: usize) -> &[String] {
        &self.lines[n.min(self.lines.len())..]
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

// MARK: - TextFramer

#[derive(Clone)]
pub struct TextFramer {
    display: DisplayConfig,
    payload_limit: usize,
    measurer: Arc<dyn TextMeasurer>,
}

impl TextFramer {
    pub fn new(display: DisplayConfig, payload_limit: usize, measurer: Arc<dyn TextMeasurer>) -> Self {
        Self {
            display,
            payload_limit,
            measurer,
        }
    }

    /// Framer using [`MonospaceMeasurer`] sized from the configured font.
    pub fn monospace(display: DisplayConfig, payload_limit: usize) -> Self {
        let measurer = Arc::new(MonospaceMeasurer::for_font_size(display.font_size));
        Self::new(display, payload_limit, measurer)
    }

    pub fn display(&self) -> &DisplayConfig {
        &self.display
    }

    pub fn payload_limit(&self) -> usize {
        self.payload_limit
    }

    /// Copy of this framer whose payloads never exceed `limit` bytes.
    pub fn capped(&self, limit: usize) -> Self {
        Self {
            payload_limit: self.payload_limit.min(limit),
            ..self.clone()
        }
    }

    /// Wraps `text` and groups the lines into pages. Empty input yields no pages.
    pub fn paginate(&self, text: &str) -> Vec<Page> {
        if text.is_empty() {
            return Vec::new();
        }
        let per_page = self.display.lines_per_page.max(1);
        self.wrap_lines(text)
            .chunks(per_page)
            .map(|chunk| Page::new(chunk.to_vec()))
            .collect()
    }

    /// Word-wraps every paragraph so each line fits the display width.
    pub fn wrap_lines(&self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for paragraph in text.split('\n') {
            let paragraph = paragraph.trim_end_matches('\r');
            if paragraph.trim().is_empty() {
                lines.push(String::new());
                continue;
            }

            let mut current = String::new();
            for word in paragraph.split_whitespace() {
                let candidate = if current.is_empty() {
                    word.to_owned()
                } else {
                    format!("{current} {word}")
                };
                if self.fits(&candidate) {
                    current = candidate;
                    continue;
                }
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                if self.fits(word) {
                    current = word.to_owned();
                } else {
                    let mut pieces = self.split_word(word);
                    current = pieces.pop().unwrap_or_default();
                    lines.extend(pieces);
                }
            }
            if !current.is_empty() {
                lines.push(current);
            }
        }
        lines
    }

    /// Encodes one page as its two sub-packets.
    pub fn build_packets(
        &self,
        page: &Page,
        page_index: usize,
        total_pages: usize,
        seq: u8,
        is_last_page: bool,
    ) -> [Bytes; 2] {
        let mode = if is_last_page {
            DisplayMode::Complete
        } else {
            DisplayMode::Showing
        };
        self.build_packets_with_mode(page, page_index, total_pages, seq, mode)
    }

    /// Same as [`build_packets`](Self::build_packets) with an explicit mode,
    /// used when the user pages manually.
    pub fn build_packets_with_mode(
        &self,
        page: &Page,
        page_index: usize,
        total_pages: usize,
        seq: u8,
        mode: DisplayMode,
    ) -> [Bytes; 2] {
        let split = self.display.first_packet_lines;
        let first = page.first_lines(split).join("\n");
        let rest = page.remaining_lines(split).join("\n");
        let (first_full, rest_full) = (first.len(), rest.len());
        let first = truncate_utf8(&first, self.payload_limit);
        let rest = truncate_utf8(&rest, self.payload_limit);
        if first.len() < first_full || rest.len() < rest_full {
            debug!(
                "[Framer] page {} payload truncated to {} bytes ({} + {} requested)",
                page_index, self.payload_limit, first_full, rest_full
            );
        }

        let base = TextHeader {
            seq,
            total_packets: 2,
            packet_index: 0,
            mode,
            char_offset: 0,
            page_index: wrap_u8(page_index),
            max_page: wrap_u8(total_pages.saturating_sub(1)),
        };
        let second = TextHeader {
            seq: seq.wrapping_add(1),
            packet_index: 1,
            char_offset: wrap_u16(first.len()),
            ..base
        };

        [build_text_packet(&base, first), build_text_packet(&second, rest)]
    }

    fn fits(&self, text: &str) -> bool {
        self.measurer.measure(text) <= self.display.width
    }

    /// Hard-splits a word wider than the display. The last piece is returned
    /// last so the caller can keep filling it.
    fn split_word(&self, word: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut current = String::new();
        for ch in word.chars() {
            current.push(ch);
            if !self.fits(&current) && current.chars().count() > 1 {
                current.pop();
                pieces.push(std::mem::take(&mut current));
                current.push(ch);
            }
        }
        pieces.push(current);
        pieces
    }
}

impl std::fmt::Debug for TextFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextFramer")
            .field("display", &self.display)
            .field("payload_limit", &self.payload_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MAX_TEXT_PAYLOAD, TEXT_HEADER_LEN};

    /// 10 units per character: 48 characters fit in 488 units.
    fn framer() -> TextFramer {
        TextFramer::new(
            DisplayConfig::default(),
            MAX_TEXT_PAYLOAD,
            Arc::new(MonospaceMeasurer::new(10.0)),
        )
    }

    fn payload(packet: &Bytes) -> &str {
        std::str::from_utf8(&packet[TEXT_HEADER_LEN..]).expect("utf-8 payload")
    }

    #[test]
    fn empty_text_has_no_pages() {
        assert!(framer().paginate("").is_empty());
    }

    #[test]
    fn short_text_is_one_line() {
        let pages = framer().paginate("hello world");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].lines(), &["hello world".to_owned()]);
    }

    #[test]
    fn lines_fit_width_and_pages_hold_five_lines() {
        let f = framer();
        let measurer = MonospaceMeasurer::new(10.0);
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(30);
        let pages = f.paginate(&text);
        assert!(pages.len() > 1);
        for page in &pages {
            assert!(page.lines().len() <= 5);
            for line in page.lines() {
                assert!(measurer.measure(line) <= 488.0, "line too wide: {line:?}");
            }
        }
    }

    #[test]
    fn overlong_word_is_hard_wrapped() {
        let f = framer();
        let text = "x".repeat(500);
        let lines = f.wrap_lines(&text);
        assert_eq!(lines.len(), 11); // 10 × 48 + 20
        assert!(lines.iter().all(|l| l.len() <= 48));
        assert_eq!(lines.concat(), text);

        for (i, page) in f.paginate(&text).iter().enumerate() {
            for pkt in f.build_packets(page, i, 3, 0, false) {
                assert!(pkt.len() - TEXT_HEADER_LEN <= MAX_TEXT_PAYLOAD);
            }
        }
    }

    #[test]
    fn blank_paragraphs_become_empty_lines() {
        let lines = framer().wrap_lines("one\n\ntwo\r\n   \nthree");
        assert_eq!(lines, vec!["one", "", "two", "", "three"]);
    }

    #[test]
    fn build_packets_splits_three_plus_two() {
        let f = framer();
        let page = Page::new(vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()]);
        let [first, second] = f.build_packets(&page, 0, 2, 10, false);

        assert_eq!(payload(&first), "a\nb\nc");
        assert_eq!(payload(&second), "d\ne");
        assert_eq!(first[1], 10);
        assert_eq!(second[1], 11);
        assert_eq!(first[3], 0);
        assert_eq!(second[3], 1);
        assert_eq!(first[4], 0x30);
        // Second packet offset equals the first payload length.
        assert_eq!(u16::from_be_bytes([second[5], second[6]]), 5);
        assert_eq!(u16::from_be_bytes([first[5], first[6]]), 0);
        assert_eq!(first[8], 1);
    }

    #[test]
    fn short_page_still_sends_two_packets() {
        let f = framer();
        let page = Page::new(vec!["only".into()]);
        let packets = f.build_packets(&page, 0, 1, 255, true);
        assert_eq!(packets.len(), 2);
        assert_eq!(payload(&packets[0]), "only");
        assert_eq!(payload(&packets[1]), "");
        assert_eq!(packets[0][4], 0x40);
        assert_eq!(packets[1][4], 0x40);
        // Sequence wraps.
        assert_eq!(packets[0][1], 255);
        assert_eq!(packets[1][1], 0);
    }

    #[test]
    fn page_views_match_packet_split() {
        let page = Page::new(vec!["1".into(), "2".into(), "3".into(), "4".into()]);
        assert_eq!(page.first_lines(3), &["1", "2", "3"]);
        assert_eq!(page.remaining_lines(3), &["4"]);
        let short = Page::new(vec!["1".into()]);
        assert!(short.remaining_lines(3).is_empty());
    }

    #[test]
    fn payload_capped_for_wide_scripts() {
        // A narrow width table lets long multi-byte lines through wrapping so the
        // byte ceiling has to do the work.
        let f = TextFramer::new(
            DisplayConfig::default(),
            MAX_TEXT_PAYLOAD,
            Arc::new(WidthTableMeasurer::new(1.0)),
        );
        let line = "漢".repeat(150);
        let page = Page::new(vec![line.clone(), line.clone(), line]);
        let [first, _] = f.build_packets(&page, 0, 1, 0, true);
        assert!(first.len() - TEXT_HEADER_LEN <= MAX_TEXT_PAYLOAD);
        assert!(std::str::from_utf8(&first[TEXT_HEADER_LEN..]).is_ok());
    }

    #[test]
    fn width_table_uses_fallback() {
        let m = WidthTableMeasurer::new(10.0).with_width('i', 4.0);
        assert_eq!(m.measure("ii"), 8.0);
        assert_eq!(m.measure("ab"), 20.0);
    }
}
