//! Minimal RTP framing for media carried over UDP (RFC 3550).
//!
//! Only what a relay needs: strip the header (including CSRCs, extension and
//! padding) from received datagrams, and prepend a fresh header with a
//! running sequence number and a 90 kHz timestamp to outgoing payloads.

use crate::endpoint::monotonic_micros;

/// Fixed RTP header length
pub const RTP_HEADER_LEN: usize = 12;

/// Largest header we accept: fixed part plus 15 CSRCs
pub const RTP_MAX_HEADER_LEN: usize = RTP_HEADER_LEN + 15 * 4;

/// Payload type for MPEG-2 transport streams
pub const PAYLOAD_TYPE_MP2T: u8 = 33;

/// RTP clock rate for video payloads
pub const RTP_CLOCK_HZ: u64 = 90_000;

const RTP_VERSION: u8 = 2;

/// Payload of an RTP datagram, or `None` if the header is malformed.
#[must_use]
pub fn payload(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < RTP_HEADER_LEN {
        return None;
    }

    let first = datagram[0];
    if first >> 6 != RTP_VERSION {
        return None;
    }
    let has_padding = first & 0x20 != 0;
    let has_extension = first & 0x10 != 0;
    let csrc_count = usize::from(first & 0x0F);

    let mut offset = RTP_HEADER_LEN + csrc_count * 4;
    if datagram.len() < offset {
        return None;
    }

    if has_extension {
        if datagram.len() < offset + 4 {
            return None;
        }
        let words = usize::from(u16::from_be_bytes([
            datagram[offset + 2],
            datagram[offset + 3],
        ]));
        offset += 4 + words * 4;
        if datagram.len() < offset {
            return None;
        }
    }

    let mut end = datagram.len();
    if has_padding {
        let padding = usize::from(datagram[end - 1]);
        if padding == 0 || padding > end - offset {
            return None;
        }
        end -= padding;
    }

    Some(&datagram[offset..end])
}

/// Builds outgoing RTP datagrams for one stream.
#[derive(Debug)]
pub struct RtpPacketizer {
    payload_type: u8,
    sequence: u16,
    ssrc: u32,
    buf: Vec<u8>,
}

impl RtpPacketizer {
    /// New stream with a random SSRC and initial sequence number.
    #[must_use]
    pub fn new(payload_type: u8) -> Self {
        Self::with_ids(payload_type, rand::random(), rand::random())
    }

    /// New stream with explicit identifiers.
    #[must_use]
    pub fn with_ids(payload_type: u8, sequence: u16, ssrc: u32) -> Self {
        Self {
            payload_type: payload_type & 0x7F,
            sequence,
            ssrc,
            buf: Vec::with_capacity(RTP_HEADER_LEN + 1500),
        }
    }

    /// Sequence number the next datagram will carry
    #[must_use]
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Wrap `payload` in an RTP header.
    ///
    /// `time` is a microsecond timestamp; without one the current monotonic
    /// time is used. The returned slice is valid until the next call.
    #[allow(clippy::cast_possible_truncation)]
    pub fn packetize(&mut self, payload: &[u8], time: Option<u64>) -> &[u8] {
        let micros = time.unwrap_or_else(monotonic_micros);
        let timestamp = (u128::from(micros) * u128::from(RTP_CLOCK_HZ) / 1_000_000) as u32;

        self.buf.clear();
        self.buf.push(RTP_VERSION << 6);
        self.buf.push(self.payload_type);
        self.buf.extend_from_slice(&self.sequence.to_be_bytes());
        self.buf.extend_from_slice(&timestamp.to_be_bytes());
        self.buf.extend_from_slice(&self.ssrc.to_be_bytes());
        self.buf.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        &self.buf
    }
}
