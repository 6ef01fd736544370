//! H.265 helpers: NAL unit types and the HEVCDecoderConfigurationRecord
//! carried in RTMP sequence headers (legacy codec id 12 and enhanced
//! `hvc1` FourCC).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ProtocolErrorKind, Result};

pub const NALU_TYPE_TRAIL_N: u8 = 0;
pub const NALU_TYPE_TRAIL_R: u8 = 1;
pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA: u8 = 21;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const NALU_TYPE_AUD: u8 = 35;
pub const NALU_TYPE_SEI_PREFIX: u8 = 39;
pub const NALU_TYPE_SEI_SUFFIX: u8 = 40;
pub const NALU_TYPE_AP: u8 = 48;
pub const NALU_TYPE_FU: u8 = 49;

pub const FOURCC_HVC1: &[u8; 4] = b"hvc1";

pub fn nalu_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

pub fn is_irap(nalu_type: u8) -> bool {
    (16..=23).contains(&nalu_type)
}

/// Parameter sets of one HEVC stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcParameterSets {
    pub vps: Bytes,
    pub sps: Bytes,
    pub pps: Bytes,
}

/// Parse an RTMP HEVC sequence-header payload in either the legacy
/// (`0x1C 0x00 cts[3]`) or the enhanced (`0x90 'hvc1'`) layout.
pub fn parse_seq_header(payload: &[u8]) -> Result<HevcParameterSets> {
    if payload.len() < 5 {
        return Err(Error::short(5, payload.len()));
    }
    if payload[0] & 0x80 != 0 {
        if &payload[1..5] != FOURCC_HVC1 {
            return Err(Error::NotYetSupported("enhanced rtmp codec other than hvc1"));
        }
    } else if payload[0] & 0x0F != 12 || payload[1] != 0 {
        return Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
            "not an hevc sequence header",
        )));
    }
    parse_decoder_config(&payload[5..])
}

/// Extract VPS, SPS and PPS from an HEVCDecoderConfigurationRecord.
pub fn parse_decoder_config(b: &[u8]) -> Result<HevcParameterSets> {
    if b.len() < 23 {
        return Err(Error::short(23, b.len()));
    }
    let num_arrays = b[22];
    let mut pos = 23;
    let (mut vps, mut sps, mut pps) = (None, None, None);
    for _ in 0..num_arrays {
        if b.len() < pos + 3 {
            return Err(Error::short(pos + 3, b.len()));
        }
        let typ = b[pos] & 0x3F;
        let num_nalus = u16::from_be_bytes([b[pos + 1], b[pos + 2]]);
        pos += 3;
        for _ in 0..num_nalus {
            if b.len() < pos + 2 {
                return Err(Error::short(pos + 2, b.len()));
            }
            let n = u16::from_be_bytes([b[pos], b[pos + 1]]) as usize;
            pos += 2;
            if b.len() < pos + n {
                return Err(Error::short(pos + n, b.len()));
            }
            let nalu = Bytes::copy_from_slice(&b[pos..pos + n]);
            pos += n;
            let slot = match typ {
                NALU_TYPE_VPS => &mut vps,
                NALU_TYPE_SPS => &mut sps,
                NALU_TYPE_PPS => &mut pps,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(nalu);
            }
        }
    }
    match (vps, sps, pps) {
        (Some(vps), Some(sps), Some(pps)) => Ok(HevcParameterSets { vps, sps, pps }),
        _ => Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
            "hevc decoder config without vps/sps/pps",
        ))),
    }
}

/// Build an HEVCDecoderConfigurationRecord.
///
/// The general profile/tier/level block is copied from the SPS (bytes 3..15,
/// right after the NAL header and the sub-layer byte); the remaining fields
/// assume 4:2:0, 8-bit and 4-byte NAL length prefixes.
pub fn build_decoder_config(p: &HevcParameterSets) -> Result<Bytes> {
    if p.sps.len() < 15 {
        return Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
            "sps too short",
        )));
    }
    let ptl = &p.sps[3..15];
    let mut b = BytesMut::with_capacity(23 + 15 + p.vps.len() + p.sps.len() + p.pps.len());
    b.put_u8(1);
    b.put_slice(&ptl[..11]);
    b.put_u8(ptl[11]);
    b.put_slice(&[0xF0, 0x00]); // min_spatial_segmentation_idc
    b.put_u8(0xFC); // parallelismType
    b.put_u8(0xFD); // chroma_format_idc = 1
    b.put_u8(0xF8); // bit_depth_luma_minus8
    b.put_u8(0xF8); // bit_depth_chroma_minus8
    b.put_u16(0); // avgFrameRate
    b.put_u8(0x0F); // lengthSizeMinusOne = 3
    b.put_u8(3);
    for (typ, nalu) in [
        (NALU_TYPE_VPS, &p.vps),
        (NALU_TYPE_SPS, &p.sps),
        (NALU_TYPE_PPS, &p.pps),
    ] {
        b.put_u8(0x80 | typ);
        b.put_u16(1);
        b.put_u16(nalu.len() as u16);
        b.put_slice(nalu);
    }
    Ok(b.freeze())
}

/// Build the legacy (codec id 12) RTMP video payload of an HEVC sequence
/// header.
pub fn build_seq_header(p: &HevcParameterSets) -> Result<Bytes> {
    let config = build_decoder_config(p)?;
    let mut b = BytesMut::with_capacity(5 + config.len());
    b.put_slice(&[0x1C, 0x00, 0x00, 0x00, 0x00]);
    b.put_slice(&config);
    Ok(b.freeze())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn parameter_sets() -> HevcParameterSets {
        HevcParameterSets {
            vps: Bytes::from_static(&[0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF]),
            sps: Bytes::from_static(&[
                0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03,
                0x00, 0x00, 0x03, 0x00, 0x5D, 0xA0,
            ]),
            pps: Bytes::from_static(&[0x44, 0x01, 0xC1, 0x72, 0xB4]),
        }
    }

    #[test]
    fn nalu_types() {
        assert_eq!(nalu_type(0x40), NALU_TYPE_VPS);
        assert_eq!(nalu_type(0x42), NALU_TYPE_SPS);
        assert_eq!(nalu_type(0x44), NALU_TYPE_PPS);
        assert_eq!(nalu_type(0x26), NALU_TYPE_IDR_W_RADL);
        assert_eq!(nalu_type(0x62), NALU_TYPE_FU);
        assert!(is_irap(NALU_TYPE_CRA));
        assert!(!is_irap(NALU_TYPE_TRAIL_R));
    }

    #[test]
    fn legacy_seq_header_round_trip() {
        let p = parameter_sets();
        let payload = build_seq_header(&p).unwrap();
        assert_eq!(payload[0], 0x1C);
        assert_eq!(parse_seq_header(&payload).unwrap(), p);
    }

    #[test]
    fn enhanced_seq_header_is_understood() {
        let p = parameter_sets();
        let mut payload = vec![0x90];
        payload.extend_from_slice(FOURCC_HVC1);
        payload.extend_from_slice(&build_decoder_config(&p).unwrap());
        assert_eq!(parse_seq_header(&payload).unwrap(), p);
    }

    #[test]
    fn other_fourcc_is_not_supported() {
        let mut payload = vec![0x90];
        payload.extend_from_slice(b"av01");
        payload.extend_from_slice(&[0; 30]);
        assert_eq!(
            parse_seq_header(&payload).unwrap_err().kind(),
            crate::error::ErrorKind::NotYetSupported
        );
    }

    #[test]
    fn record_without_pps_is_invalid() {
        let p = parameter_sets();
        let mut record = build_decoder_config(&p).unwrap().to_vec();
        record[22] = 2;
        let cut = record.len() - (3 + 2 + p.pps.len());
        record.truncate(cut);
        assert!(parse_decoder_config(&record).is_err());
    }
}
