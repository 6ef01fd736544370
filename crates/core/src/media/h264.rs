//! H.264 RTP payload format (RFC 6184).
//!
//! - **Single NAL Unit** (§5.6): NAL types 1-23 travel as-is.
//! - **STAP-A** (§5.7.1, type 24): several NAL units, each prefixed with a
//!   16-bit size.
//! - **FU-A** (§5.8, type 28): one NAL unit split across packets:
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   Fragment data: [...]
//!   ```

use bytes::{BufMut, Bytes, BytesMut};

use super::list::PositionType;
use super::packer::PayloadPacker;
use crate::codec::avc;

pub const NALU_TYPE_STAPA: u8 = 24;
pub const NALU_TYPE_FUA: u8 = 28;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Packs AVC frames (Annex B, AVCC or a bare NAL unit) into single NAL
/// or FU-A payloads. Access unit delimiters are dropped.
#[derive(Debug, Default)]
pub struct H264PayloadPacker;

impl PayloadPacker for H264PayloadPacker {
    fn pack(&mut self, payload: &[u8], max_size: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        for nal in avc::split_any(payload) {
            if avc::nalu_type(nal[0]) == avc::NALU_TYPE_AUD {
                continue;
            }
            pack_nal(nal, max_size, &mut out);
        }
        out
    }
}

fn pack_nal(nal: &[u8], max_size: usize, out: &mut Vec<Bytes>) {
    if nal.len() <= max_size {
        out.push(Bytes::copy_from_slice(nal));
        return;
    }

    let nal_type = avc::nalu_type(nal[0]);
    let fu_indicator = (nal[0] & 0x60) | NALU_TYPE_FUA;
    let body = &nal[1..];
    let max_fragment = max_size.saturating_sub(2).max(1);
    let before = out.len();

    let mut offset = 0usize;
    while offset < body.len() {
        let chunk_size = max_fragment.min(body.len() - offset);
        let mut fu_header = nal_type;
        if offset == 0 {
            fu_header |= FU_START;
        }
        if offset + chunk_size == body.len() {
            fu_header |= FU_END;
        }
        let mut b = BytesMut::with_capacity(2 + chunk_size);
        b.put_u8(fu_indicator);
        b.put_u8(fu_header);
        b.put_slice(&body[offset..offset + chunk_size]);
        out.push(b.freeze());
        offset += chunk_size;
    }

    tracing::trace!(
        nal_type,
        nal_size = nal.len(),
        fragments = out.len() - before,
        "FU-A fragmented NAL unit"
    );
}

/// Classify an H.264 RTP payload.
pub fn calc_position(body: &[u8]) -> PositionType {
    let Some(&first) = body.first() else {
        return PositionType::Unknown;
    };
    match avc::nalu_type(first) {
        1..=23 => PositionType::Single,
        NALU_TYPE_STAPA => PositionType::Stapa,
        NALU_TYPE_FUA if body.len() > 2 => fu_position(body[1]),
        _ => PositionType::Unknown,
    }
}

pub(crate) fn fu_position(fu_header: u8) -> PositionType {
    match (fu_header & FU_START != 0, fu_header & FU_END != 0) {
        (true, false) => PositionType::FuStart,
        (false, true) => PositionType::FuEnd,
        (false, false) => PositionType::FuMiddle,
        // S and E together are not allowed.
        (true, true) => PositionType::Unknown,
    }
}

/// NAL header rebuilt from an FU-A indicator and header.
pub fn fu_nal_header(body: &[u8]) -> [u8; 1] {
    [(body[0] & 0xE0) | (body[1] & 0x1F)]
}

/// Length of the FU indicator plus FU header.
pub const FU_HEADER_LEN: usize = 2;

/// NAL units inside a STAP-A payload. A truncated trailing unit ends the
/// walk.
pub fn split_stapa(body: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut rest = body.get(1..).unwrap_or_default();
    while rest.len() >= 2 {
        let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        if len == 0 || rest.len() - 2 < len {
            break;
        }
        nalus.push(&rest[2..2 + len]);
        rest = &rest[2 + len..];
    }
    nalus
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1400;

    #[test]
    fn small_nal_single_payload() {
        let nal = [0x65, 0xAA, 0xBB, 0xCC];
        let out = H264PayloadPacker.pack(&nal, MAX);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &nal);
    }

    #[test]
    fn large_nal_fragmented() {
        let mut nal = vec![0x65];
        nal.extend(vec![0xAA; MAX + 500]);
        let out = H264PayloadPacker.pack(&nal, MAX);
        assert_eq!(out.len(), 2);

        assert_eq!(out[0][0], 0x60 | 28);
        assert_eq!(out[0][1], 0x80 | 5);
        assert_eq!(out[1][1], 0x40 | 5);
        assert_eq!(calc_position(&out[0]), PositionType::FuStart);
        assert_eq!(calc_position(&out[1]), PositionType::FuEnd);
        assert_eq!(fu_nal_header(&out[0]), [0x65]);

        let total: usize = out.iter().map(|p| p.len() - FU_HEADER_LEN).sum();
        assert_eq!(total, nal.len() - 1);
    }

    #[test]
    fn annexb_frame_drops_aud() {
        let mut frame = vec![0, 0, 0, 1, 0x09, 0xF0];
        frame.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42]);
        frame.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let out = H264PayloadPacker.pack(&frame, MAX);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &[0x67, 0x42]);
        assert_eq!(&out[1][..], &[0x68, 0xCE]);
    }

    #[test]
    fn avcc_frame_is_split() {
        let frame = [0, 0, 0, 2, 0x41, 0x9A, 0, 0, 0, 1, 0x06];
        let out = H264PayloadPacker.pack(&frame, MAX);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn empty_frame_no_payloads() {
        assert!(H264PayloadPacker.pack(&[], MAX).is_empty());
    }

    #[test]
    fn positions() {
        assert_eq!(calc_position(&[0x41, 1]), PositionType::Single);
        assert_eq!(calc_position(&[0x18, 0, 1, 0x67]), PositionType::Stapa);
        assert_eq!(calc_position(&[0x7C, 0x05, 1]), PositionType::FuMiddle);
        assert_eq!(calc_position(&[0x7C, 0xC5, 1]), PositionType::Unknown);
        assert_eq!(calc_position(&[0x7D, 0x05, 1]), PositionType::Unknown);
        assert_eq!(calc_position(&[]), PositionType::Unknown);
    }

    #[test]
    fn stapa_split() {
        let body = [0x18, 0, 2, 0x67, 0x42, 0, 1, 0x68, 0, 9];
        let nalus = split_stapa(&body);
        assert_eq!(nalus, vec![&[0x67u8, 0x42][..], &[0x68u8][..]]);
    }
}
