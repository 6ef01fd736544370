//! AAC over RTP, MPEG4-GENERIC AAC-hbr mode (RFC 3640).
//!
//! ```text
//! AU-headers-length(16, in bits) | AU-header(size:13 index:3)* | AU data*
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::list::{PositionType, RtpPacketList};
use super::packer::PayloadPacker;
use super::rtp::{RtpPacket, sub_seq};
use super::unpacker::{UnpackerProtocol, rtp_ts_to_ms};
use crate::avpacket::{AvPacket, AvPacketPt};
use crate::codec::aac::SAMPLES_PER_FRAME;

/// Largest AU the 13-bit size field can describe.
pub const MAX_AU_SIZE: usize = (1 << 13) - 1;

/// One AU per payload with a single 16-bit AU header.
#[derive(Debug, Default)]
pub struct AacPayloadPacker;

impl PayloadPacker for AacPayloadPacker {
    fn pack(&mut self, payload: &[u8], _max_size: usize) -> Vec<Bytes> {
        if payload.is_empty() {
            return Vec::new();
        }
        let len = payload.len();
        if len > MAX_AU_SIZE {
            tracing::warn!(len, "aac frame too large for an au header, dropped");
            return Vec::new();
        }
        let mut b = BytesMut::with_capacity(4 + len);
        b.put_slice(&[0x00, 0x10, (len >> 5) as u8, ((len & 0x1F) << 3) as u8]);
        b.put_slice(payload);
        vec![b.freeze()]
    }
}

/// Parsed AU header section of one payload.
struct AuSection<'a> {
    sizes: Vec<usize>,
    data: &'a [u8],
}

fn parse_au_section(body: &[u8]) -> Option<AuSection<'_>> {
    if body.len() < 2 {
        return None;
    }
    let bits = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let header_bytes = bits.div_ceil(8);
    if bits == 0 || bits % 16 != 0 || body.len() < 2 + header_bytes {
        return None;
    }
    let sizes = body[2..2 + header_bytes]
        .chunks_exact(2)
        .map(|h| usize::from(u16::from_be_bytes([h[0], h[1]]) >> 3))
        .collect();
    Some(AuSection {
        sizes,
        data: &body[2 + header_bytes..],
    })
}

pub struct AacUnpacker {
    clock_rate: u32,
}

impl AacUnpacker {
    pub fn new(clock_rate: u32) -> Self {
        Self { clock_rate }
    }

    fn frame_duration_ms(&self) -> i64 {
        i64::from(SAMPLES_PER_FRAME * 1000 / self.clock_rate.max(1))
    }

    /// Concatenate one fragmented AU from the head of the list. Returns the
    /// AU and the index of its last packet.
    fn gather_fragments(list: &RtpPacketList, au_size: usize) -> Option<(BytesMut, usize)> {
        let first = list.front()?;
        let timestamp = first.packet.header.timestamp;
        let mut au = BytesMut::with_capacity(au_size);
        au.put_slice(parse_au_section(first.packet.body())?.data);

        let mut prev = first.seq();
        for idx in 1..list.len() {
            let p = list.get(idx)?;
            if sub_seq(p.seq(), prev) != 1 || p.packet.header.timestamp != timestamp {
                return None;
            }
            au.put_slice(parse_au_section(p.packet.body())?.data);
            if au.len() == au_size {
                return Some((au, idx));
            }
            if au.len() > au_size {
                tracing::warn!(
                    au_size,
                    gathered = au.len(),
                    "aac fragment sizes do not add up"
                );
                return None;
            }
            prev = p.seq();
        }
        None
    }
}

impl UnpackerProtocol for AacUnpacker {
    fn calc_position(&self, pkt: &RtpPacket) -> PositionType {
        match parse_au_section(pkt.body()) {
            Some(_) => PositionType::Single,
            None => PositionType::Unknown,
        }
    }

    fn try_unpack_one(
        &mut self,
        list: &mut RtpPacketList,
        out: &mut Vec<AvPacket>,
    ) -> Option<u16> {
        let first = list.front()?;
        let seq = first.seq();
        let base = rtp_ts_to_ms(first.packet.header.timestamp, self.clock_rate);
        let section = parse_au_section(first.packet.body())?;

        let total: usize = section.sizes.iter().sum();
        if section.sizes.len() == 1 && section.data.len() < total {
            let (au, last_idx) = Self::gather_fragments(list, total)?;
            let last_seq = list.get(last_idx)?.seq();
            list.drop_front(last_idx + 1);
            out.push(AvPacket::new(AvPacketPt::Aac, base, au.freeze()));
            return Some(last_seq);
        }

        if section.data.len() < total {
            tracing::warn!(
                seq,
                need = total,
                have = section.data.len(),
                "aac payload shorter than its au headers"
            );
            return None;
        }

        let step = self.frame_duration_ms();
        let mut offset = 0usize;
        for (i, &size) in section.sizes.iter().enumerate() {
            out.push(AvPacket::new(
                AvPacketPt::Aac,
                base + i as i64 * step,
                Bytes::copy_from_slice(&section.data[offset..offset + size]),
            ));
            offset += size;
        }
        list.pop_front();
        Some(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;
    use crate::media::unpacker::new_unpacker;

    fn rtp(seq: u16, ts: u32, body: &[u8]) -> RtpPacket {
        RtpPacket::new(
            RtpHeader {
                seq,
                timestamp: ts,
                payload_type: 97,
                ..RtpHeader::default()
            },
            body,
        )
    }

    #[test]
    fn packer_au_header() {
        let frame = vec![0x21; 300];
        let out = AacPayloadPacker.pack(&frame, 1400);
        assert_eq!(out.len(), 1);
        // 300 = 9 << 5 | 12
        assert_eq!(&out[0][..4], &[0x00, 0x10, 9, 12 << 3]);
        assert_eq!(out[0].len(), 304);
    }

    #[test]
    fn oversized_au_is_dropped() {
        assert!(AacPayloadPacker.pack(&vec![0x21; 8192], 1400).is_empty());
        let out = AacPayloadPacker.pack(&vec![0x21; MAX_AU_SIZE], 1400);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][2..4], &[0xFF, 0xF8]);
    }

    #[test]
    fn multiple_aus_in_one_packet() {
        let mut u = new_unpacker(AvPacketPt::Aac, 44_100, 32).unwrap();
        // Two AUs of 2 and 3 bytes.
        let body = [0x00, 0x20, 0x00, 0x10, 0x00, 0x18, 1, 2, 3, 4, 5];
        let out = u.feed(rtp(1, 44_100, &body));
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].payload[..], &[1, 2]);
        assert_eq!(&out[1].payload[..], &[3, 4, 5]);
        assert_eq!(out[0].timestamp, 1002);
        assert_eq!(out[1].timestamp, 1002 + 23);
    }

    #[test]
    fn fragmented_au_is_concatenated() {
        let mut u = new_unpacker(AvPacketPt::Aac, 48_000, 32).unwrap();
        // One AU of 5 bytes split 3 + 2.
        let head = [0x00, 0x10, 0x00, 0x28];
        let mut a = head.to_vec();
        a.extend_from_slice(&[1, 2, 3]);
        let mut b = head.to_vec();
        b.extend_from_slice(&[4, 5]);
        assert!(u.feed(rtp(7, 96_000, &a)).is_empty());
        let out = u.feed(rtp(8, 96_000, &b));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], &[1, 2, 3, 4, 5]);
        assert_eq!(out[0].timestamp, 2000);
    }

    #[test]
    fn malformed_header_section_is_dropped() {
        let mut u = new_unpacker(AvPacketPt::Aac, 48_000, 32).unwrap();
        assert!(u.feed(rtp(1, 0, &[0x00, 0x08, 0x10])).is_empty());
        assert_eq!(u.buffered(), 0);
    }

    #[test]
    fn packed_frame_unpacks() {
        let frame = [0xDE, 0xAD, 0xBE, 0xEF];
        let payload = AacPayloadPacker.pack(&frame, 1400).remove(0);
        let mut u = new_unpacker(AvPacketPt::Aac, 48_000, 32).unwrap();
        let out = u.feed(rtp(1, 4800, &payload));
        assert_eq!(&out[0].payload[..], &frame);
        assert_eq!(out[0].timestamp, 100);
    }
}
