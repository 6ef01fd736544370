use super::aac::AacUnpacker;
use super::list::{PositionType, PositionedPacket, RtpPacketList};
use super::pcm::PcmUnpacker;
use super::rtp::{RtpPacket, compare_seq, sub_seq};
use super::video::VideoUnpacker;
use crate::avpacket::{AvPacket, AvPacketPt};

/// Codec-specific half of RTP depacketization.
///
/// The [`RtpUnpacker`] driver owns ordering, de-duplication and the
/// reorder window; a protocol only classifies payloads and turns the head
/// of the list into frames.
pub trait UnpackerProtocol: Send {
    /// Classify a payload. [`PositionType::Unknown`] packets are dropped
    /// before they reach the list.
    fn calc_position(&self, pkt: &RtpPacket) -> PositionType;

    /// Try to build one frame from the packets at the head of `list`.
    ///
    /// On success the consumed packets are removed, any produced frames are
    /// pushed to `out`, and the sequence number of the last consumed packet
    /// is returned.
    fn try_unpack_one(&mut self, list: &mut RtpPacketList, out: &mut Vec<AvPacket>)
    -> Option<u16>;
}

/// Reorders RTP packets of one stream and emits complete frames.
pub struct RtpUnpacker {
    protocol: Box<dyn UnpackerProtocol>,
    list: RtpPacketList,
    unpacked_seq: Option<u16>,
}

impl RtpUnpacker {
    pub fn new(protocol: Box<dyn UnpackerProtocol>, max_size: usize) -> Self {
        Self {
            protocol,
            list: RtpPacketList::new(max_size),
            unpacked_seq: None,
        }
    }

    /// Feed one packet; returns the frames it completed, in order.
    ///
    /// Packets at or before the last consumed sequence number are stale and
    /// dropped. When the list overflows and nothing at its head can be
    /// assembled, the head packet is discarded.
    pub fn feed(&mut self, pkt: RtpPacket) -> Vec<AvPacket> {
        let mut out = Vec::new();
        let seq = pkt.header.seq;
        if let Some(last) = self.unpacked_seq
            && compare_seq(seq, last) <= 0
        {
            tracing::trace!(seq, last, "dropping stale rtp packet");
            return out;
        }

        let position = self.protocol.calc_position(&pkt);
        if position == PositionType::Unknown {
            tracing::warn!(
                seq,
                pt = pkt.header.payload_type,
                "unknown rtp payload position, dropping"
            );
            return out;
        }
        if !self.list.insert(PositionedPacket {
            packet: pkt,
            position,
        }) {
            return out;
        }

        let mut count = 0;
        while self.try_unpack_sequential(&mut out) {
            count += 1;
        }
        if count > 0 || !self.list.is_over_capacity() {
            return out;
        }

        if self.try_unpack(&mut out) {
            while self.try_unpack_sequential(&mut out) {}
        } else if let Some(dropped) = self.list.pop_front() {
            tracing::debug!(seq = dropped.seq(), "reorder window full, dropping head packet");
        }
        out
    }

    fn try_unpack_sequential(&mut self, out: &mut Vec<AvPacket>) -> bool {
        let Some(first) = self.list.front() else {
            return false;
        };
        if let Some(last) = self.unpacked_seq
            && sub_seq(first.seq(), last) != 1
        {
            return false;
        }
        self.try_unpack(out)
    }

    fn try_unpack(&mut self, out: &mut Vec<AvPacket>) -> bool {
        match self.protocol.try_unpack_one(&mut self.list, out) {
            Some(seq) => {
                self.unpacked_seq = Some(seq);
                true
            }
            None => false,
        }
    }

    pub fn buffered(&self) -> usize {
        self.list.len()
    }
}

/// RTP timestamp to milliseconds: `rtp_ts / (clock_rate / 1000)`.
pub(crate) fn rtp_ts_to_ms(ts: u32, clock_rate: u32) -> i64 {
    i64::from(ts) / i64::from((clock_rate / 1000).max(1))
}

/// Unpacker for `payload_type`, or `None` for codecs without one.
pub fn new_unpacker(payload_type: AvPacketPt, clock_rate: u32, max_size: usize) -> Option<RtpUnpacker> {
    let protocol: Box<dyn UnpackerProtocol> = match payload_type {
        AvPacketPt::Avc | AvPacketPt::Hevc => Box::new(VideoUnpacker::new(payload_type, clock_rate)),
        AvPacketPt::Aac => Box::new(AacUnpacker::new(clock_rate)),
        AvPacketPt::G711A | AvPacketPt::G711U | AvPacketPt::Opus => {
            Box::new(PcmUnpacker::new(payload_type, clock_rate))
        }
        AvPacketPt::Unknown => return None,
    };
    Some(RtpUnpacker::new(protocol, max_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;

    fn pcm(seq: u16, ts: u32) -> RtpPacket {
        let header = RtpHeader {
            seq,
            timestamp: ts,
            payload_type: 8,
            ..RtpHeader::default()
        };
        RtpPacket::new(header, &[seq as u8])
    }

    fn unpacker(max: usize) -> RtpUnpacker {
        new_unpacker(AvPacketPt::G711A, 8000, max).unwrap()
    }

    #[test]
    fn in_order_packets_emit_immediately() {
        let mut u = unpacker(8);
        assert_eq!(u.feed(pcm(1, 160)).len(), 1);
        assert_eq!(u.feed(pcm(2, 320)).len(), 1);
        assert_eq!(u.buffered(), 0);
    }

    #[test]
    fn reordered_packet_is_held_until_gap_fills() {
        let mut u = unpacker(8);
        u.feed(pcm(1, 0));
        assert!(u.feed(pcm(3, 0)).is_empty());
        let out = u.feed(pcm(2, 0));
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].payload[..], &[2]);
        assert_eq!(&out[1].payload[..], &[3]);
    }

    #[test]
    fn stale_and_duplicate_packets_are_dropped() {
        let mut u = unpacker(8);
        u.feed(pcm(5, 0));
        assert!(u.feed(pcm(5, 0)).is_empty());
        assert!(u.feed(pcm(4, 0)).is_empty());
        assert_eq!(u.buffered(), 0);
    }

    #[test]
    fn overflow_skips_a_missing_packet() {
        let mut u = unpacker(2);
        u.feed(pcm(1, 0));
        assert!(u.feed(pcm(3, 0)).is_empty());
        assert!(u.feed(pcm(4, 0)).is_empty());
        let out = u.feed(pcm(5, 0));
        assert_eq!(out.len(), 3, "gap at 2 is given up once the window overflows");
    }

    #[test]
    fn sequence_wrap_is_transparent() {
        let mut u = unpacker(8);
        let mut n = 0;
        for seq in [65534u16, 65535, 0, 1] {
            n += u.feed(pcm(seq, 0)).len();
        }
        assert_eq!(n, 4);
    }

    #[test]
    fn reordering_across_the_wrap_keeps_sequence_order() {
        let seqs = [65533u16, 65534, 65535, 0, 1];
        let ts = |i: usize| 1000 + i as u32 * 160;

        let mut u = unpacker(8);
        let mut got = Vec::new();
        for (i, seq) in seqs.iter().enumerate() {
            got.extend(u.feed(pcm(*seq, ts(i))));
        }
        let payloads: Vec<u8> = got.iter().map(|p| p.payload[0]).collect();
        assert_eq!(payloads, vec![0xFD, 0xFE, 0xFF, 0x00, 0x01]);
        assert!(got.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        let mut u = unpacker(8);
        let mut got = Vec::new();
        for i in [0usize, 3, 2, 4, 1] {
            got.extend(u.feed(pcm(seqs[i], ts(i))));
        }
        let payloads: Vec<u8> = got.iter().map(|p| p.payload[0]).collect();
        assert_eq!(payloads, vec![0xFD, 0xFE, 0xFF, 0x00, 0x01]);
        assert!(got.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn timestamp_conversion() {
        assert_eq!(rtp_ts_to_ms(90_000, 90_000), 1000);
        assert_eq!(rtp_ts_to_ms(8000, 8000), 1000);
        assert_eq!(rtp_ts_to_ms(100, 1), 100);
    }
}
