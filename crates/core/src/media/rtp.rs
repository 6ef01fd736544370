use bytes::Bytes;

use crate::error::{Error, ProtocolErrorKind, Result};

pub const RTP_FIXED_HEADER_LENGTH: usize = 12;
pub const RTP_VERSION: u8 = 2;

/// Two sequence numbers further apart than this are assumed to straddle a
/// 16-bit wrap.
const SEQ_WRAP_WINDOW: u16 = 16384;

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            CSRC list / header extension (optional)            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `payload_offset` is where the payload starts once CSRCs and any header
/// extension are skipped; `padding_len` is the number of trailing padding
/// bytes (0 when P is clear).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub seq: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_offset: usize,
    pub padding_len: usize,
}

impl RtpHeader {
    /// Parse the header of a complete RTP packet.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < RTP_FIXED_HEADER_LENGTH {
            return Err(Error::short(RTP_FIXED_HEADER_LENGTH, b.len()));
        }
        let version = b[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::invalid(ProtocolErrorKind::RtpVersion(version)));
        }
        let padding = b[0] & 0x20 != 0;
        let extension = b[0] & 0x10 != 0;
        let csrc_count = b[0] & 0x0F;

        let mut offset = RTP_FIXED_HEADER_LENGTH + 4 * csrc_count as usize;
        if extension {
            if b.len() < offset + 4 {
                return Err(Error::short(offset + 4, b.len()));
            }
            let words = u16::from_be_bytes([b[offset + 2], b[offset + 3]]) as usize;
            offset += 4 + 4 * words;
        }
        if b.len() < offset {
            return Err(Error::short(offset, b.len()));
        }
        let padding_len = if padding {
            let n = b[b.len() - 1] as usize;
            if n > b.len() - offset {
                return Err(Error::short(offset + n, b.len()));
            }
            n
        } else {
            0
        };

        Ok(Self {
            version,
            padding,
            extension,
            csrc_count,
            marker: b[1] & 0x80 != 0,
            payload_type: b[1] & 0x7F,
            seq: u16::from_be_bytes([b[2], b[3]]),
            timestamp: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            ssrc: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            payload_offset: offset,
            padding_len,
        })
    }

    /// Serialize as a 12-byte fixed header. Padding, extension and CSRCs are
    /// never emitted.
    pub fn pack(&self) -> [u8; RTP_FIXED_HEADER_LENGTH] {
        let mut header = [0u8; RTP_FIXED_HEADER_LENGTH];
        header[0] = RTP_VERSION << 6;
        header[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        header[2..4].copy_from_slice(&self.seq.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// A parsed RTP packet that keeps the original datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub raw: Bytes,
}

impl RtpPacket {
    pub fn parse(raw: Bytes) -> Result<Self> {
        let header = RtpHeader::parse(&raw)?;
        Ok(Self { header, raw })
    }

    /// Build a packet from a header and payload.
    pub fn new(mut header: RtpHeader, payload: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(RTP_FIXED_HEADER_LENGTH + payload.len());
        raw.extend_from_slice(&header.pack());
        raw.extend_from_slice(payload);
        header.version = RTP_VERSION;
        header.padding = false;
        header.extension = false;
        header.csrc_count = 0;
        header.payload_offset = RTP_FIXED_HEADER_LENGTH;
        header.padding_len = 0;
        Self {
            header,
            raw: Bytes::from(raw),
        }
    }

    /// Payload without header, CSRCs, extension or padding.
    pub fn body(&self) -> &[u8] {
        &self.raw[self.header.payload_offset..self.raw.len() - self.header.padding_len]
    }

    /// [`body`](Self::body) sharing the datagram's buffer.
    pub fn body_bytes(&self) -> Bytes {
        self.raw
            .slice(self.header.payload_offset..self.raw.len() - self.header.padding_len)
    }

    pub fn seq(&self) -> u16 {
        self.header.seq
    }
}

/// Wrap-aware ordering of two sequence numbers: `1` if `a` comes after
/// `b`, `-1` if before, `0` if equal.
pub fn compare_seq(a: u16, b: u16) -> i32 {
    if a == b {
        return 0;
    }
    if a > b {
        if a - b < SEQ_WRAP_WINDOW { 1 } else { -1 }
    } else if b - a < SEQ_WRAP_WINDOW {
        -1
    } else {
        1
    }
}

/// Wrap-aware signed distance `a - b`.
pub fn sub_seq(a: u16, b: u16) -> i32 {
    if a == b {
        return 0;
    }
    let (a32, b32) = (i32::from(a), i32::from(b));
    if a > b {
        if a - b < SEQ_WRAP_WINDOW {
            a32 - b32
        } else {
            a32 - b32 - 65536
        }
    } else if b - a < SEQ_WRAP_WINDOW {
        a32 - b32
    } else {
        a32 + 65536 - b32
    }
}
