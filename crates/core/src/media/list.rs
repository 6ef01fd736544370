use std::collections::VecDeque;

use super::rtp::{RtpPacket, compare_seq};

/// Role of an RTP payload within the frame it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionType {
    /// Complete frame (or NAL unit) in one packet.
    Single,
    FuStart,
    FuMiddle,
    FuEnd,
    /// H.264 STAP-A aggregate.
    Stapa,
    /// H.265 aggregation packet.
    Ap,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PositionedPacket {
    pub packet: RtpPacket,
    pub position: PositionType,
}

impl PositionedPacket {
    pub fn seq(&self) -> u16 {
        self.packet.header.seq
    }
}

/// RTP packets kept in wrap-aware sequence order.
///
/// Arrivals are almost always in order, so insertion scans from the tail.
#[derive(Debug)]
pub struct RtpPacketList {
    items: VecDeque<PositionedPacket>,
    max_size: usize,
}

impl RtpPacketList {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Insert in order. Returns `false` for a duplicate sequence number.
    pub fn insert(&mut self, pkt: PositionedPacket) -> bool {
        let seq = pkt.seq();
        let mut idx = self.items.len();
        while idx > 0 {
            match compare_seq(seq, self.items[idx - 1].seq()) {
                0 => return false,
                c if c > 0 => break,
                _ => idx -= 1,
            }
        }
        self.items.insert(idx, pkt);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// More packets are buffered than the reorder window allows.
    pub fn is_over_capacity(&self) -> bool {
        self.items.len() > self.max_size
    }

    pub fn front(&self) -> Option<&PositionedPacket> {
        self.items.front()
    }

    pub fn get(&self, idx: usize) -> Option<&PositionedPacket> {
        self.items.get(idx)
    }

    pub fn pop_front(&mut self) -> Option<PositionedPacket> {
        self.items.pop_front()
    }

    /// Remove the first `n` packets.
    pub fn drop_front(&mut self, n: usize) {
        self.items.drain(..n.min(self.items.len()));
    }

    pub fn seqs(&self) -> impl Iterator<Item = u16> + '_ {
        self.items.iter().map(PositionedPacket::seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpHeader;

    fn pkt(seq: u16) -> PositionedPacket {
        let header = RtpHeader {
            seq,
            payload_type: 96,
            ..RtpHeader::default()
        };
        PositionedPacket {
            packet: RtpPacket::new(header, &[0x65]),
            position: PositionType::Single,
        }
    }

    #[test]
    fn keeps_sequence_order() {
        let mut l = RtpPacketList::new(16);
        for s in [3, 1, 2, 5, 4] {
            assert!(l.insert(pkt(s)));
        }
        assert_eq!(l.seqs().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn orders_across_wrap() {
        let mut l = RtpPacketList::new(16);
        for s in [0, 65535, 1, 65534] {
            l.insert(pkt(s));
        }
        assert_eq!(l.seqs().collect::<Vec<_>>(), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn rejects_duplicates() {
        let mut l = RtpPacketList::new(16);
        assert!(l.insert(pkt(7)));
        assert!(!l.insert(pkt(7)));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn capacity_and_front_removal() {
        let mut l = RtpPacketList::new(2);
        for s in 0..3 {
            l.insert(pkt(s));
        }
        assert!(l.is_over_capacity());
        l.drop_front(2);
        assert_eq!(l.front().map(PositionedPacket::seq), Some(2));
        l.drop_front(10);
        assert!(l.is_empty());
    }
}
