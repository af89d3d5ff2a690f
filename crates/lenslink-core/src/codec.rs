//! Wire codec for the dual-arm display protocol.
//!
//! Pure functions only: no I/O and no hidden state, so encoding the same
//! inputs always yields the same bytes.
//!
//! # Packet layouts
//!
//! ```text
//! Handshake  [0xF4, 0x01]
//! Heartbeat  [0x25, 0x00, 0x00, seq, 0x04, seq]
//! Mic        [0x0E, 0x01 | 0x00]
//! Text       [0x4E, seq, total, index, mode, off_hi, off_lo, page, max_page, utf8...]
//! ```
//!
//! Inbound notifications are only classified by their first byte: `0xC9`
//! acknowledges the previous write, `0xCA` rejects it, anything else is
//! opaque data for the caller.

use bytes::{BufMut, Bytes, BytesMut};

// ── Command identifiers ───────────────────────────────────────────────────────

pub const CMD_HANDSHAKE: u8 = 0xF4;
pub const CMD_HEARTBEAT: u8 = 0x25;
pub const CMD_TEXT: u8 = 0x4E;
pub const CMD_MIC: u8 = 0x0E;

pub const ACK_SUCCESS: u8 = 0xC9;
pub const ACK_FAILURE: u8 = 0xCA;

const HEARTBEAT_MARKER: u8 = 0x04;

/// Fixed header length of a text packet, command byte included.
pub const TEXT_HEADER_LEN: usize = 9;

/// Protocol-level ceiling on text payload bytes, independent of the MTU.
pub const MAX_TEXT_PAYLOAD: usize = 191;

// MARK: - DisplayMode

/// Screen status carried in the text packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisplayMode {
    /// More pages follow.
    Showing = 0x30,
    /// Final page of the content.
    Complete = 0x40,
    /// Page selected by the user.
    Manual = 0x50,
    Error = 0x60,
}

impl DisplayMode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

// MARK: - TextHeader

/// Header fields of one text sub-packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextHeader {
    pub seq: u8,
    pub total_packets: u8,
    pub packet_index: u8,
    pub mode: DisplayMode,
    /// Bytes of this page already carried by earlier sub-packets.
    pub char_offset: u16,
    pub page_index: u8,
    pub max_page: u8,
}

/// Masks a counter to one byte. Device-side counters are single bytes, so
/// values deliberately wrap instead of failing.
#[inline]
pub fn wrap_u8(value: usize) -> u8 {
    (value & 0xFF) as u8
}

/// Masks an offset to the 16-bit header field.
#[inline]
pub fn wrap_u16(value: usize) -> u16 {
    (value & 0xFFFF) as u16
}

// MARK: - Encoders

pub fn build_handshake() -> Bytes {
    Bytes::from_static(&[CMD_HANDSHAKE, 0x01])
}

pub fn build_heartbeat(seq: u8) -> Bytes {
    Bytes::copy_from_slice(&[CMD_HEARTBEAT, 0x00, 0x00, seq, HEARTBEAT_MARKER, seq])
}

pub fn build_mic_enable(enabled: bool) -> Bytes {
    Bytes::copy_from_slice(&[CMD_MIC, u8::from(enabled)])
}

/// Encodes a text sub-packet. The payload is cut at a character boundary so
/// it never exceeds [`MAX_TEXT_PAYLOAD`] bytes.
pub fn build_text_packet(header: &TextHeader, payload: &str) -> Bytes {
    let payload = truncate_utf8(payload, MAX_TEXT_PAYLOAD);
    let [offset_high, offset_low] = header.char_offset.to_be_bytes();

    let mut buf = BytesMut::with_capacity(TEXT_HEADER_LEN + payload.len());
    buf.put_u8(CMD_TEXT);
    buf.put_u8(header.seq);
    buf.put_u8(header.total_packets);
    buf.put_u8(header.packet_index);
    buf.put_u8(header.mode.as_byte());
    buf.put_u8(offset_high);
    buf.put_u8(offset_low);
    buf.put_u8(header.page_index);
    buf.put_u8(header.max_page);
    buf.put_slice(payload.as_bytes());
    buf.freeze()
}

/// Longest prefix of `text` that fits in `max_bytes` without splitting a
/// UTF-8 sequence.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// MARK: - Inbound classification

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Ack(AckStatus),
    /// Not an acknowledgment; forwarded to the caller untouched.
    Data,
}

pub fn classify_inbound(data: &[u8]) -> Inbound {
    match data.first() {
        Some(&ACK_SUCCESS) => Inbound::Ack(AckStatus::Success),
        Some(&ACK_FAILURE) => Inbound::Ack(AckStatus::Failure),
        _ => Inbound::Data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TextHeader {
        TextHeader {
            seq: 7,
            total_packets: 2,
            packet_index: 1,
            mode: DisplayMode::Complete,
            char_offset: 0x0123,
            page_index: 2,
            max_page: 3,
        }
    }

    #[test]
    fn handshake_bytes() {
        assert_eq!(&build_handshake()[..], &[0xF4, 0x01]);
    }

    #[test]
    fn heartbeat_repeats_sequence() {
        assert_eq!(&build_heartbeat(42)[..], &[0x25, 0x00, 0x00, 42, 0x04, 42]);
        assert_eq!(&build_heartbeat(255)[..], &[0x25, 0x00, 0x00, 255, 0x04, 255]);
    }

    #[test]
    fn mic_enable_flag() {
        let on = build_mic_enable(true);
        let off = build_mic_enable(false);
        assert_eq!(on[0], 0x0E);
        assert_eq!(off[0], 0x0E);
        assert_eq!(on[1], 0x01);
        assert_eq!(off[1], 0x00);
    }

    #[test]
    fn text_packet_layout() {
        let pkt = build_text_packet(&header(), "hi");
        assert_eq!(
            &pkt[..],
            &[0x4E, 7, 2, 1, 0x40, 0x01, 0x23, 2, 3, b'h', b'i']
        );
    }

    #[test]
    fn text_packet_encoding_is_idempotent() {
        let h = header();
        assert_eq!(build_text_packet(&h, "same"), build_text_packet(&h, "same"));
    }

    #[test]
    fn text_payload_capped_at_char_boundary() {
        // 'é' is two bytes; 100 of them is 200 bytes.
        let text = "é".repeat(100);
        let pkt = build_text_packet(&header(), &text);
        let payload = &pkt[TEXT_HEADER_LEN..];
        assert_eq!(payload.len(), 190);
        assert!(std::str::from_utf8(payload).is_ok());
    }

    #[test]
    fn counters_wrap() {
        assert_eq!(wrap_u8(256), 0);
        assert_eq!(wrap_u8(257), 1);
        assert_eq!(wrap_u16(0x1_0005), 5);
    }

    #[test]
    fn classifies_acknowledgments() {
        assert_eq!(classify_inbound(&[0xC9]), Inbound::Ack(AckStatus::Success));
        assert_eq!(classify_inbound(&[0xCA, 0x01]), Inbound::Ack(AckStatus::Failure));
        assert_eq!(classify_inbound(&[0xF5, 0x17]), Inbound::Data);
        assert_eq!(classify_inbound(&[]), Inbound::Data);
    }
}
