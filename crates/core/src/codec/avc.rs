//! H.264 bitstream helpers: NAL unit splitting and the RTMP/FLV
//! AVCDecoderConfigurationRecord.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ProtocolErrorKind, Result};

pub const NALU_TYPE_SLICE: u8 = 1;
pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

pub fn nalu_type(header: u8) -> u8 {
    header & 0x1F
}

/// Whether `data` starts with a 3- or 4-byte Annex B start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 0, 1]) || data.starts_with(&[0, 0, 1])
}

/// Split an Annex B byte stream into NAL units (start codes removed).
///
/// Handles mixed 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start
/// codes. Bytes before the first start code are ignored.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            starts.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nalus = Vec::with_capacity(starts.len());
    for (idx, &(start, _)) in starts.iter().enumerate() {
        let end = match starts.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nalus.push(&data[start..end]);
        }
    }
    nalus
}

/// Split a length-prefixed (AVCC, 4-byte big-endian lengths) buffer.
///
/// Fails unless the prefixes tile the buffer exactly.
pub fn split_avcc(mut data: &[u8]) -> Result<Vec<&[u8]>> {
    let mut nalus = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(Error::short(4, data.len()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 < len {
            return Err(Error::short(len + 4, data.len()));
        }
        if len > 0 {
            nalus.push(&data[4..4 + len]);
        }
        data = &data[4 + len..];
    }
    Ok(nalus)
}

/// Split whatever framing `data` uses: Annex B, AVCC, or a bare NAL unit.
pub fn split_any(data: &[u8]) -> Vec<&[u8]> {
    if is_annexb(data) {
        return split_annexb(data);
    }
    match split_avcc(data) {
        Ok(nalus) if !nalus.is_empty() => nalus,
        _ if data.is_empty() => Vec::new(),
        _ => vec![data],
    }
}

/// Append one NAL unit with its 4-byte length prefix.
pub fn put_avcc_nalu(buf: &mut BytesMut, nalu: &[u8]) {
    buf.put_u32(nalu.len() as u32);
    buf.put_slice(nalu);
}

/// Join NAL units into one AVCC buffer.
pub fn join_avcc<'a>(nalus: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut buf = BytesMut::new();
    for n in nalus {
        put_avcc_nalu(&mut buf, n);
    }
    buf.freeze()
}

/// Extract SPS and PPS from an RTMP AVC sequence-header payload
/// (`0x17 0x00 cts[3] AVCDecoderConfigurationRecord`).
pub fn parse_seq_header(payload: &[u8]) -> Result<(Bytes, Bytes)> {
    if payload.len() < 5 {
        return Err(Error::short(5, payload.len()));
    }
    parse_decoder_config(&payload[5..])
}

/// Extract the first SPS and PPS from an AVCDecoderConfigurationRecord.
///
/// ```text
/// version(8) profile(8) compat(8) level(8) 111111 lengthSizeMinusOne(2)
/// 111 numSps(5) { len(16) sps }  numPps(8) { len(16) pps }
/// ```
pub fn parse_decoder_config(b: &[u8]) -> Result<(Bytes, Bytes)> {
    if b.len() < 6 {
        return Err(Error::short(6, b.len()));
    }
    let mut pos = 5;
    let num_sps = b[pos] & 0x1F;
    pos += 1;
    let mut sps = None;
    for _ in 0..num_sps {
        let n = read_u16_len(b, pos)?;
        if sps.is_none() {
            sps = Some(Bytes::copy_from_slice(&b[pos + 2..pos + 2 + n]));
        }
        pos += 2 + n;
    }
    if b.len() <= pos {
        return Err(Error::short(pos + 1, b.len()));
    }
    let num_pps = b[pos];
    pos += 1;
    let mut pps = None;
    for _ in 0..num_pps {
        let n = read_u16_len(b, pos)?;
        if pps.is_none() {
            pps = Some(Bytes::copy_from_slice(&b[pos + 2..pos + 2 + n]));
        }
        pos += 2 + n;
    }
    match (sps, pps) {
        (Some(sps), Some(pps)) => Ok((sps, pps)),
        _ => Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
            "avc decoder config without sps/pps",
        ))),
    }
}

fn read_u16_len(b: &[u8], pos: usize) -> Result<usize> {
    if b.len() < pos + 2 {
        return Err(Error::short(pos + 2, b.len()));
    }
    let n = u16::from_be_bytes([b[pos], b[pos + 1]]) as usize;
    if b.len() < pos + 2 + n {
        return Err(Error::short(pos + 2 + n, b.len()));
    }
    Ok(n)
}

/// Build an AVCDecoderConfigurationRecord from one SPS and one PPS.
pub fn build_decoder_config(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    if sps.len() < 4 {
        return Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
            "sps too short",
        )));
    }
    let mut b = BytesMut::with_capacity(11 + sps.len() + pps.len());
    b.put_u8(1);
    b.put_u8(sps[1]);
    b.put_u8(sps[2]);
    b.put_u8(sps[3]);
    b.put_u8(0xFF);
    b.put_u8(0xE1);
    b.put_u16(sps.len() as u16);
    b.put_slice(sps);
    b.put_u8(1);
    b.put_u16(pps.len() as u16);
    b.put_slice(pps);
    Ok(b.freeze())
}

/// Build the RTMP video payload of an AVC sequence header.
pub fn build_seq_header(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    let config = build_decoder_config(sps, pps)?;
    let mut b = BytesMut::with_capacity(5 + config.len());
    b.put_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]);
    b.put_slice(&config);
    Ok(b.freeze())
}

/// `profile-level-id` for SDP: profile_idc, constraint flags and level_idc
/// as six hex digits (RFC 6184 §8.1).
pub fn profile_level_id(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1F, 0xDA, 0x01];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    #[test]
    fn split_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        assert_eq!(split_annexb(&data), vec![&[0x65u8, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn split_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x67u8, 0x42][..], &[0x68u8, 0xCE][..]]);
    }

    #[test]
    fn split_without_start_code_is_empty() {
        assert!(split_annexb(&[0xFF, 0xFE]).is_empty());
        assert!(split_annexb(&[]).is_empty());
    }

    #[test]
    fn avcc_split_requires_exact_tiling() {
        let joined = join_avcc([SPS, PPS]);
        assert_eq!(split_avcc(&joined).unwrap(), vec![SPS, PPS]);
        assert!(split_avcc(&joined[..joined.len() - 1]).is_err());
    }

    #[test]
    fn split_any_detects_framing() {
        let annexb = [0, 0, 0, 1, 0x65, 1, 0, 0, 1, 0x41, 2];
        assert_eq!(split_any(&annexb).len(), 2);
        let avcc = join_avcc([SPS, PPS]);
        assert_eq!(split_any(&avcc), vec![SPS, PPS]);
        assert_eq!(split_any(&[0x65, 0x88, 0x80]), vec![&[0x65u8, 0x88, 0x80][..]]);
    }

    #[test]
    fn seq_header_round_trips_parameter_sets() {
        let payload = build_seq_header(SPS, PPS).unwrap();
        assert_eq!(&payload[..2], &[0x17, 0x00]);
        let (sps, pps) = parse_seq_header(&payload).unwrap();
        assert_eq!(&sps[..], SPS);
        assert_eq!(&pps[..], PPS);
    }

    #[test]
    fn truncated_seq_header_is_an_error() {
        let payload = build_seq_header(SPS, PPS).unwrap();
        assert!(parse_seq_header(&payload[..payload.len() - 2]).is_err());
    }

    #[test]
    fn profile_level_id_from_sps() {
        assert_eq!(profile_level_id(SPS).as_deref(), Some("42c01f"));
        assert_eq!(profile_level_id(&[0x67]), None);
    }
}
