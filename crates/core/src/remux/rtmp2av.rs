//! RTMP audio/video messages to protocol-neutral [`AvPacket`]s.
//!
//! ```text
//! video (legacy)    frameType(4) codecId(4) packetType(8) cts(24) data
//! video (enhanced)  1 frameType(3) packetType(4) fourcc(32) [cts(24)] data
//! audio             soundFormat(4) rate(2) size(1) type(1) [aacPacketType(8)] data
//! ```

use bytes::Bytes;

use crate::avpacket::{AvConfig, AvPacket, AvPacketPt};
use crate::codec::{aac, avc, hevc};
use crate::error::{Error, Result};
use crate::rtmp::{RtmpMessage, type_id};

pub const VIDEO_CODEC_AVC: u8 = 7;
pub const VIDEO_CODEC_HEVC: u8 = 12;
pub const SOUND_FORMAT_G711A: u8 = 7;
pub const SOUND_FORMAT_G711U: u8 = 8;
pub const SOUND_FORMAT_AAC: u8 = 10;

const AVC_PACKET_TYPE_SEQ_HEADER: u8 = 0;
const AVC_PACKET_TYPE_NALU: u8 = 1;

const ENHANCED_SEQUENCE_START: u8 = 0;
const ENHANCED_CODED_FRAMES: u8 = 1;
const ENHANCED_SEQUENCE_END: u8 = 2;
const ENHANCED_CODED_FRAMES_X: u8 = 3;

/// What one RTMP message turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtmpAvEvent {
    /// A sequence header updated the decoder configuration; carries the
    /// configuration as it stands after the update.
    Config(AvConfig),
    Packet(AvPacket),
}

/// Stateful converter that accumulates sequence headers into an
/// [`AvConfig`] and turns coded frames into [`AvPacket`]s.
#[derive(Debug, Default)]
pub struct RtmpToAv {
    config: AvConfig,
}

impl RtmpToAv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &AvConfig {
        &self.config
    }

    /// `Ok(None)` for messages with nothing to hand on: metadata, end of
    /// sequence markers and codecs without a mapping.
    pub fn feed(&mut self, msg: &RtmpMessage) -> Result<Option<RtmpAvEvent>> {
        match msg.header.msg_type_id {
            type_id::AUDIO => self.feed_audio(msg),
            type_id::VIDEO => self.feed_video(msg),
            _ => Ok(None),
        }
    }

    fn feed_audio(&mut self, msg: &RtmpMessage) -> Result<Option<RtmpAvEvent>> {
        let payload = &msg.payload;
        if payload.is_empty() {
            return Err(Error::short(1, 0));
        }
        let ts = i64::from(msg.header.timestamp_abs);
        match payload[0] >> 4 {
            SOUND_FORMAT_AAC => {
                if payload.len() < 2 {
                    return Err(Error::short(2, payload.len()));
                }
                if aac::is_seq_header(payload) {
                    self.config.asc = Some(aac::parse_seq_header(payload)?);
                    return Ok(Some(RtmpAvEvent::Config(self.config.clone())));
                }
                Ok(Some(RtmpAvEvent::Packet(AvPacket::new(
                    AvPacketPt::Aac,
                    ts,
                    payload.slice(2..),
                ))))
            }
            SOUND_FORMAT_G711A => Ok(Some(RtmpAvEvent::Packet(AvPacket::new(
                AvPacketPt::G711A,
                ts,
                payload.slice(1..),
            )))),
            SOUND_FORMAT_G711U => Ok(Some(RtmpAvEvent::Packet(AvPacket::new(
                AvPacketPt::G711U,
                ts,
                payload.slice(1..),
            )))),
            other => {
                tracing::trace!(sound_format = other, "audio codec without mapping");
                Ok(None)
            }
        }
    }

    fn feed_video(&mut self, msg: &RtmpMessage) -> Result<Option<RtmpAvEvent>> {
        let payload = &msg.payload;
        if payload.len() < 5 {
            return Err(Error::short(5, payload.len()));
        }
        if payload[0] & 0x80 != 0 {
            return self.feed_enhanced_video(msg);
        }

        let dts = i64::from(msg.header.timestamp_abs);
        let payload_type = match payload[0] & 0x0F {
            VIDEO_CODEC_AVC => AvPacketPt::Avc,
            VIDEO_CODEC_HEVC => AvPacketPt::Hevc,
            other => {
                tracing::trace!(codec_id = other, "video codec without mapping");
                return Ok(None);
            }
        };
        match payload[1] {
            AVC_PACKET_TYPE_SEQ_HEADER => {
                if payload_type == AvPacketPt::Avc {
                    let (sps, pps) = avc::parse_seq_header(payload)?;
                    self.config.vps = None;
                    self.config.sps = Some(sps);
                    self.config.pps = Some(pps);
                } else {
                    self.set_hevc(hevc::parse_seq_header(payload)?);
                }
                Ok(Some(RtmpAvEvent::Config(self.config.clone())))
            }
            AVC_PACKET_TYPE_NALU => {
                let cts = i64::from(read_i24(&payload[2..5]));
                Ok(Some(RtmpAvEvent::Packet(frame(payload_type, dts, cts, payload.slice(5..)))))
            }
            _ => Ok(None),
        }
    }

    fn feed_enhanced_video(&mut self, msg: &RtmpMessage) -> Result<Option<RtmpAvEvent>> {
        let payload = &msg.payload;
        if &payload[1..5] != hevc::FOURCC_HVC1 {
            return Err(Error::NotYetSupported("enhanced rtmp codec other than hvc1"));
        }
        let dts = i64::from(msg.header.timestamp_abs);
        match payload[0] & 0x0F {
            ENHANCED_SEQUENCE_START => {
                self.set_hevc(hevc::parse_seq_header(payload)?);
                Ok(Some(RtmpAvEvent::Config(self.config.clone())))
            }
            ENHANCED_CODED_FRAMES => {
                if payload.len() < 8 {
                    return Err(Error::short(8, payload.len()));
                }
                let cts = i64::from(read_i24(&payload[5..8]));
                Ok(Some(RtmpAvEvent::Packet(frame(AvPacketPt::Hevc, dts, cts, payload.slice(8..)))))
            }
            ENHANCED_CODED_FRAMES_X => Ok(Some(RtmpAvEvent::Packet(frame(
                AvPacketPt::Hevc,
                dts,
                0,
                payload.slice(5..),
            )))),
            ENHANCED_SEQUENCE_END => Ok(None),
            other => {
                tracing::trace!(packet_type = other, "enhanced video packet type ignored");
                Ok(None)
            }
        }
    }

    fn set_hevc(&mut self, p: hevc::HevcParameterSets) {
        self.config.vps = Some(p.vps);
        self.config.sps = Some(p.sps);
        self.config.pps = Some(p.pps);
    }
}

fn frame(payload_type: AvPacketPt, dts: i64, cts: i64, payload: Bytes) -> AvPacket {
    AvPacket {
        payload_type,
        timestamp: dts,
        pts: dts + cts,
        payload,
    }
}

/// Signed 24-bit big-endian composition time.
fn read_i24(b: &[u8]) -> i32 {
    (i32::from(b[0]) << 24 | i32::from(b[1]) << 16 | i32::from(b[2]) << 8) >> 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::csid;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];

    fn video(ts: u32, payload: Vec<u8>) -> RtmpMessage {
        RtmpMessage::new(csid::VIDEO, type_id::VIDEO, 1, ts, Bytes::from(payload))
    }

    fn audio(ts: u32, payload: Vec<u8>) -> RtmpMessage {
        RtmpMessage::new(csid::AUDIO, type_id::AUDIO, 1, ts, Bytes::from(payload))
    }

    #[test]
    fn avc_seq_header_then_frame_with_cts() {
        let mut r = RtmpToAv::new();
        let seq = avc::build_seq_header(SPS, PPS).unwrap();
        match r.feed(&video(0, seq.to_vec())).unwrap() {
            Some(RtmpAvEvent::Config(c)) => {
                assert_eq!(c.sps.as_deref(), Some(SPS));
                assert_eq!(c.pps.as_deref(), Some(PPS));
                assert!(!c.is_hevc());
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut body = vec![0x17, 0x01, 0x00, 0x00, 0x50];
        body.extend_from_slice(&[0, 0, 0, 2, 0x65, 0x88]);
        match r.feed(&video(1000, body)).unwrap() {
            Some(RtmpAvEvent::Packet(p)) => {
                assert_eq!(p.payload_type, AvPacketPt::Avc);
                assert_eq!(p.timestamp, 1000);
                assert_eq!(p.pts, 1080);
                assert_eq!(&p.payload[..], &[0, 0, 0, 2, 0x65, 0x88]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negative_composition_time() {
        let mut r = RtmpToAv::new();
        let body = vec![0x27, 0x01, 0xFF, 0xFF, 0xF6, 0, 0, 0, 1, 0x41];
        let Some(RtmpAvEvent::Packet(p)) = r.feed(&video(500, body)).unwrap() else {
            panic!("expected a packet");
        };
        assert_eq!(p.pts, 490);
    }

    #[test]
    fn enhanced_hevc_frames() {
        let mut r = RtmpToAv::new();
        let ps = crate::codec::hevc::tests::parameter_sets();
        let config = hevc::build_decoder_config(&ps).unwrap();
        let mut seq = vec![0x90];
        seq.extend_from_slice(hevc::FOURCC_HVC1);
        seq.extend_from_slice(&config);
        let Some(RtmpAvEvent::Config(c)) = r.feed(&video(0, seq)).unwrap() else {
            panic!("expected config");
        };
        assert!(c.is_hevc());
        assert_eq!(c.sps.as_ref(), Some(&ps.sps));

        let mut coded = vec![0x91];
        coded.extend_from_slice(hevc::FOURCC_HVC1);
        coded.extend_from_slice(&[0, 0, 40, 0, 0, 0, 1, 0x26]);
        let Some(RtmpAvEvent::Packet(p)) = r.feed(&video(100, coded)).unwrap() else {
            panic!("expected a packet");
        };
        assert_eq!((p.payload_type, p.timestamp, p.pts), (AvPacketPt::Hevc, 100, 140));

        let mut x = vec![0x93];
        x.extend_from_slice(hevc::FOURCC_HVC1);
        x.extend_from_slice(&[0, 0, 0, 1, 0x02]);
        let Some(RtmpAvEvent::Packet(p)) = r.feed(&video(133, x)).unwrap() else {
            panic!("expected a packet");
        };
        assert_eq!(p.pts, 133);
        assert_eq!(&p.payload[..], &[0, 0, 0, 1, 0x02]);
    }

    #[test]
    fn enhanced_other_fourcc_not_supported() {
        let mut r = RtmpToAv::new();
        let body = vec![0x91, b'a', b'v', b'0', b'1', 0, 0, 0];
        assert!(matches!(r.feed(&video(0, body)), Err(Error::NotYetSupported(_))));
    }

    #[test]
    fn aac_and_g711() {
        let mut r = RtmpToAv::new();
        let asc = [0x12, 0x10];
        let Some(RtmpAvEvent::Config(c)) = r.feed(&audio(0, aac::build_seq_header(&asc).to_vec())).unwrap() else {
            panic!("expected config");
        };
        assert_eq!(c.asc.as_deref(), Some(&asc[..]));

        let Some(RtmpAvEvent::Packet(p)) = r.feed(&audio(23, aac::build_raw_payload(&[1, 2, 3]).to_vec())).unwrap()
        else {
            panic!("expected a packet");
        };
        assert_eq!((p.payload_type, p.timestamp), (AvPacketPt::Aac, 23));
        assert_eq!(&p.payload[..], &[1, 2, 3]);

        let Some(RtmpAvEvent::Packet(p)) = r.feed(&audio(40, vec![0x72, 9, 9])).unwrap() else {
            panic!("expected a packet");
        };
        assert_eq!(p.payload_type, AvPacketPt::G711A);
        assert_eq!(&p.payload[..], &[9, 9]);

        assert_eq!(r.feed(&audio(40, vec![0x22, 1])).unwrap(), None);
    }

    #[test]
    fn short_video_rejected() {
        let mut r = RtmpToAv::new();
        assert!(matches!(r.feed(&video(0, vec![0x17, 0x01])), Err(Error::ShortBuffer { .. })));
    }
}
