use bytes::Bytes;

use super::aac::AacPayloadPacker;
use super::h264::H264PayloadPacker;
use super::h265::H265PayloadPacker;
use super::pcm::PcmPayloadPacker;
use super::rtp::{RtpHeader, RtpPacket};
use crate::avpacket::{AvPacket, AvPacketPt};

/// Splits one frame into RTP payloads no larger than `max_size` bytes.
pub trait PayloadPacker: Send {
    fn pack(&mut self, payload: &[u8], max_size: usize) -> Vec<Bytes>;
}

/// Turns [`AvPacket`]s into RTP packets for one stream.
///
/// The marker bit is set on the last packet of each frame. Sequence
/// numbers increment by one per packet and wrap at 65536.
pub struct RtpPacker {
    payload_packer: Box<dyn PayloadPacker>,
    header: RtpHeader,
    clock_rate: u32,
    max_payload_size: usize,
}

impl RtpPacker {
    pub fn new(
        payload_packer: Box<dyn PayloadPacker>,
        payload_type: u8,
        ssrc: u32,
        clock_rate: u32,
        max_payload_size: usize,
    ) -> Self {
        Self {
            payload_packer,
            header: RtpHeader {
                payload_type,
                ssrc,
                seq: rand::random::<u16>() & 0x7FFF,
                ..RtpHeader::default()
            },
            clock_rate,
            max_payload_size,
        }
    }

    /// Start numbering at `seq`.
    pub fn with_initial_seq(mut self, seq: u16) -> Self {
        self.header.seq = seq;
        self
    }

    pub fn pack(&mut self, pkt: &AvPacket) -> Vec<RtpPacket> {
        let payloads = self.payload_packer.pack(&pkt.payload, self.max_payload_size);
        let timestamp = ms_to_rtp_ts(pkt.pts, self.clock_rate);
        let last = payloads.len().saturating_sub(1);
        let mut out = Vec::with_capacity(payloads.len());
        for (i, payload) in payloads.iter().enumerate() {
            let header = RtpHeader {
                marker: i == last,
                timestamp,
                ..self.header
            };
            out.push(RtpPacket::new(header, payload));
            self.header.seq = self.header.seq.wrapping_add(1);
        }
        tracing::trace!(
            pt = self.header.payload_type,
            ts = timestamp,
            packets = out.len(),
            frame_bytes = pkt.payload.len(),
            "frame packed"
        );
        out
    }

    /// Sequence number the next packet will carry.
    pub fn next_seq(&self) -> u16 {
        self.header.seq
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
}

/// Milliseconds to RTP clock units, wrapping at 2^32.
pub(crate) fn ms_to_rtp_ts(ms: i64, clock_rate: u32) -> u32 {
    (ms.wrapping_mul(i64::from(clock_rate)) / 1000) as u32
}

/// Packer for `payload_type`, or `None` for codecs without one.
pub fn new_packer(
    payload_type: AvPacketPt,
    rtp_payload_type: u8,
    clock_rate: u32,
    max_payload_size: usize,
) -> Option<RtpPacker> {
    let payload_packer: Box<dyn PayloadPacker> = match payload_type {
        AvPacketPt::Avc => Box::new(H264PayloadPacker),
        AvPacketPt::Hevc => Box::new(H265PayloadPacker),
        AvPacketPt::Aac => Box::new(AacPayloadPacker),
        AvPacketPt::G711A | AvPacketPt::G711U | AvPacketPt::Opus => Box::new(PcmPayloadPacker),
        AvPacketPt::Unknown => return None,
    };
    Some(RtpPacker::new(
        payload_packer,
        rtp_payload_type,
        rand::random::<u32>(),
        clock_rate,
        max_payload_size,
    ))
}
