//! H.265 (HEVC) RTP payload format (RFC 7798).
//!
//! Differences from H.264:
//!
//! - **2-byte NAL unit header**; the type sits in bits 1..6 of the first byte.
//! - **FU** (type 49) carries a 2-byte payload header followed by a 1-byte
//!   FU header `[S|E|Type(6)]`.
//! - **AP** (type 48) aggregates several NAL units.

use bytes::{BufMut, Bytes, BytesMut};

use super::list::PositionType;
use super::packer::PayloadPacker;
use crate::codec::{avc, hevc};

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Payload header plus FU header.
pub const FU_HEADER_LEN: usize = 3;

/// Packs HEVC frames into single NAL or FU payloads. Access unit
/// delimiters are dropped.
#[derive(Debug, Default)]
pub struct H265PayloadPacker;

impl PayloadPacker for H265PayloadPacker {
    fn pack(&mut self, payload: &[u8], max_size: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        for nal in avc::split_any(payload) {
            if hevc::nalu_type(nal[0]) == hevc::NALU_TYPE_AUD {
                continue;
            }
            pack_nal(nal, max_size, &mut out);
        }
        out
    }
}

fn pack_nal(nal: &[u8], max_size: usize, out: &mut Vec<Bytes>) {
    if nal.len() <= max_size || nal.len() < 3 {
        out.push(Bytes::copy_from_slice(nal));
        return;
    }

    let nal_type = hevc::nalu_type(nal[0]);
    let payload_header = [(nal[0] & 0x81) | (hevc::NALU_TYPE_FU << 1), nal[1]];
    let body = &nal[2..];
    let max_fragment = max_size.saturating_sub(FU_HEADER_LEN).max(1);

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
        let mut b = BytesMut::with_capacity(FU_HEADER_LEN + chunk_size);
        b.put_slice(&payload_header);
        b.put_u8(fu_header);
        b.put_slice(&body[offset..offset + chunk_size]);
        out.push(b.freeze());
        offset += chunk_size;
    }
}

/// Classify an H.265 RTP payload.
pub fn calc_position(body: &[u8]) -> PositionType {
    if body.len() < 3 {
        return PositionType::Unknown;
    }
    match hevc::nalu_type(body[0]) {
        hevc::NALU_TYPE_TRAIL_N
        | hevc::NALU_TYPE_TRAIL_R
        | hevc::NALU_TYPE_IDR_W_RADL
        | hevc::NALU_TYPE_IDR_N_LP
        | hevc::NALU_TYPE_CRA
        | hevc::NALU_TYPE_VPS
        | hevc::NALU_TYPE_SPS
        | hevc::NALU_TYPE_PPS
        | hevc::NALU_TYPE_SEI_PREFIX
        | hevc::NALU_TYPE_SEI_SUFFIX => PositionType::Single,
        hevc::NALU_TYPE_AP => PositionType::Ap,
        hevc::NALU_TYPE_FU => super::h264::fu_position(body[2]),
        _ => PositionType::Unknown,
    }
}

/// NAL header rebuilt from an FU payload header and FU header.
pub fn fu_nal_header(body: &[u8]) -> [u8; 2] {
    [(body[0] & 0x81) | ((body[2] & 0x3F) << 1), body[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_nal_single_payload() {
        let nal = [0x26, 0x01, 0xAF, 0x00];
        let out = H265PayloadPacker.pack(&nal, 1400);
        assert_eq!(out.len(), 1);
        assert_eq!(calc_position(&out[0]), PositionType::Single);
    }

    #[test]
    fn large_nal_fragmented() {
        // IDR_W_RADL
        let mut nal = vec![0x26, 0x01];
        nal.extend(vec![0x55; 250]);
        let out = H265PayloadPacker.pack(&nal, 100);
        assert_eq!(out.len(), 3);
        assert_eq!(hevc::nalu_type(out[0][0]), hevc::NALU_TYPE_FU);
        assert_eq!(out[0][2], 0x80 | 19);
        assert_eq!(out[1][2], 19);
        assert_eq!(out[2][2], 0x40 | 19);
        assert_eq!(calc_position(&out[0]), PositionType::FuStart);
        assert_eq!(calc_position(&out[1]), PositionType::FuMiddle);
        assert_eq!(calc_position(&out[2]), PositionType::FuEnd);
        assert_eq!(fu_nal_header(&out[1]), [0x26, 0x01]);
    }

    #[test]
    fn aud_is_dropped() {
        let frame = [0, 0, 0, 1, 0x46, 0x01, 0x50, 0, 0, 0, 1, 0x02, 0x01, 0xD0];
        let out = H265PayloadPacker.pack(&frame, 1400);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &[0x02, 0x01, 0xD0]);
    }

    #[test]
    fn positions() {
        assert_eq!(calc_position(&[0x40, 0x01, 0x0C]), PositionType::Single);
        assert_eq!(calc_position(&[0x60, 0x01, 0x00, 0x02]), PositionType::Ap);
        assert_eq!(calc_position(&[0x46, 0x01, 0x50]), PositionType::Unknown);
        assert_eq!(calc_position(&[0x40, 0x01]), PositionType::Unknown);
    }
}
