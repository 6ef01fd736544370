//! G.711 A-law / µ-law and Opus: one frame per RTP payload.

use bytes::Bytes;

use super::list::{PositionType, RtpPacketList};
use super::packer::PayloadPacker;
use super::rtp::RtpPacket;
use super::unpacker::{UnpackerProtocol, rtp_ts_to_ms};
use crate::avpacket::{AvPacket, AvPacketPt};

#[derive(Debug, Default)]
pub struct PcmPayloadPacker;

impl PayloadPacker for PcmPayloadPacker {
    fn pack(&mut self, payload: &[u8], _max_size: usize) -> Vec<Bytes> {
        if payload.is_empty() {
            return Vec::new();
        }
        vec![Bytes::copy_from_slice(payload)]
    }
}

pub struct PcmUnpacker {
    payload_type: AvPacketPt,
    clock_rate: u32,
}

impl PcmUnpacker {
    pub fn new(payload_type: AvPacketPt, clock_rate: u32) -> Self {
        Self {
            payload_type,
            clock_rate,
        }
    }
}

impl UnpackerProtocol for PcmUnpacker {
    fn calc_position(&self, pkt: &RtpPacket) -> PositionType {
        if pkt.body().is_empty() {
            PositionType::Unknown
        } else {
            PositionType::Single
        }
    }

    fn try_unpack_one(
        &mut self,
        list: &mut RtpPacketList,
        out: &mut Vec<AvPacket>,
    ) -> Option<u16> {
        let first = list.pop_front()?;
        out.push(AvPacket::new(
            self.payload_type,
            rtp_ts_to_ms(first.packet.header.timestamp, self.clock_rate),
            first.packet.body_bytes(),
        ));
        Some(first.seq())
    }
}
