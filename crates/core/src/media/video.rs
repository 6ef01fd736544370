use bytes::{BufMut, BytesMut};

use super::list::{PositionType, RtpPacketList};
use super::rtp::{RtpPacket, sub_seq};
use super::unpacker::{UnpackerProtocol, rtp_ts_to_ms};
use super::{h264, h265};
use crate::avpacket::{AvPacket, AvPacketPt};
use crate::codec::avc;

/// Reassembles H.264 or H.265 NAL units from RTP.
///
/// Each output packet holds AVCC-framed NAL units: one for single and FU
/// payloads, all of them for a STAP-A.
pub struct VideoUnpacker {
    payload_type: AvPacketPt,
    clock_rate: u32,
}

impl VideoUnpacker {
    pub fn new(payload_type: AvPacketPt, clock_rate: u32) -> Self {
        Self {
            payload_type,
            clock_rate,
        }
    }

    fn is_hevc(&self) -> bool {
        self.payload_type == AvPacketPt::Hevc
    }

    fn emit(&self, out: &mut Vec<AvPacket>, timestamp: u32, payload: BytesMut) {
        out.push(AvPacket::new(
            self.payload_type,
            rtp_ts_to_ms(timestamp, self.clock_rate),
            payload.freeze(),
        ));
    }

    /// Index of the FU end packet, if every packet from the head to it is
    /// present and contiguous.
    fn find_fu_end(list: &RtpPacketList) -> Option<usize> {
        let mut prev = list.front()?.seq();
        for idx in 1..list.len() {
            let p = list.get(idx)?;
            if sub_seq(p.seq(), prev) != 1 {
                return None;
            }
            match p.position {
                PositionType::FuMiddle => prev = p.seq(),
                PositionType::FuEnd => return Some(idx),
                _ => return None,
            }
        }
        None
    }
}

impl UnpackerProtocol for VideoUnpacker {
    fn calc_position(&self, pkt: &RtpPacket) -> PositionType {
        if self.is_hevc() {
            h265::calc_position(pkt.body())
        } else {
            h264::calc_position(pkt.body())
        }
    }

    fn try_unpack_one(
        &mut self,
        list: &mut RtpPacketList,
        out: &mut Vec<AvPacket>,
    ) -> Option<u16> {
        let first = list.front()?;
        let seq = first.seq();
        let timestamp = first.packet.header.timestamp;

        match first.position {
            PositionType::Single => {
                let mut b = BytesMut::with_capacity(4 + first.packet.body().len());
                avc::put_avcc_nalu(&mut b, first.packet.body());
                list.pop_front();
                self.emit(out, timestamp, b);
                Some(seq)
            }
            PositionType::Stapa => {
                let nalus = h264::split_stapa(first.packet.body());
                if nalus.is_empty() {
                    tracing::warn!(seq, "empty STAP-A payload");
                } else {
                    let mut b = BytesMut::new();
                    for n in nalus {
                        avc::put_avcc_nalu(&mut b, n);
                    }
                    self.emit(out, timestamp, b);
                }
                list.pop_front();
                Some(seq)
            }
            PositionType::Ap => {
                tracing::warn!(seq, "hevc aggregation packets are not supported, dropping");
                list.pop_front();
                Some(seq)
            }
            PositionType::FuStart => {
                let end = Self::find_fu_end(list)?;
                let hevc = self.is_hevc();
                let (header_len, nal_header): (usize, Vec<u8>) = if hevc {
                    (h265::FU_HEADER_LEN, h265::fu_nal_header(first.packet.body()).to_vec())
                } else {
                    (h264::FU_HEADER_LEN, h264::fu_nal_header(first.packet.body()).to_vec())
                };

                let mut nal_len = nal_header.len();
                for idx in 0..=end {
                    nal_len += list.get(idx)?.packet.body().len() - header_len;
                }
                let mut b = BytesMut::with_capacity(4 + nal_len);
                b.put_u32(nal_len as u32);
                b.put_slice(&nal_header);
                for idx in 0..=end {
                    b.put_slice(&list.get(idx)?.packet.body()[header_len..]);
                }

                let last_seq = list.get(end)?.seq();
                list.drop_front(end + 1);
                self.emit(out, timestamp, b);
                Some(last_seq)
            }
            PositionType::FuMiddle | PositionType::FuEnd | PositionType::Unknown => None,
        }
    }
}
