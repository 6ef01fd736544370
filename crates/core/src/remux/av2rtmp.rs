use bytes::{BufMut, Bytes, BytesMut};

use super::rtmp2av::{SOUND_FORMAT_G711A, SOUND_FORMAT_G711U, VIDEO_CODEC_AVC, VIDEO_CODEC_HEVC};
use crate::avpacket::{AvConfig, AvPacket, AvPacketPt};
use crate::codec::{aac, avc, hevc};
use crate::error::Result;
use crate::rtmp::{RtmpMessage, csid, type_id};

/// Stream id stamped on produced messages; sessions re-stamp on write.
const MSG_STREAM_ID: u32 = 1;

/// 5.5 kHz, 16-bit, mono. Players ignore the rate bits for G.711.
const G711_SOUND_FLAGS: u8 = 0x02;

const FRAME_TYPE_KEY: u8 = 1;
const FRAME_TYPE_INTER: u8 = 2;

/// Turns [`AvPacket`]s (and their [`AvConfig`]) back into RTMP messages.
///
/// Sequence headers go out whenever a configuration arrives and in front
/// of the first key frame. Parameter sets found inside a key frame replace
/// the known ones and trigger a new video sequence header when they
/// differ. Video before the first sequence header and AAC before an ASC
/// are dropped.
#[derive(Debug, Default)]
pub struct AvPacketToRtmp {
    config: AvConfig,
    video_seq_sent: bool,
    audio_seq_sent: bool,
}

impl AvPacketToRtmp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &AvConfig {
        &self.config
    }

    pub fn feed_av_config(&mut self, config: &AvConfig) -> Result<Vec<RtmpMessage>> {
        if config.asc.is_some() {
            self.config.asc = config.asc.clone();
        }
        if config.has_video() {
            self.config.vps = config.vps.clone();
            self.config.sps = config.sps.clone();
            self.config.pps = config.pps.clone();
        }
        let mut out = Vec::with_capacity(2);
        if let Some(msg) = self.video_seq_header(0)? {
            out.push(msg);
            self.video_seq_sent = true;
        }
        if let Some(msg) = self.audio_seq_header(0) {
            out.push(msg);
            self.audio_seq_sent = true;
        }
        Ok(out)
    }

    pub fn feed_av_packet(&mut self, pkt: &AvPacket) -> Result<Vec<RtmpMessage>> {
        match pkt.payload_type {
            AvPacketPt::Avc | AvPacketPt::Hevc => self.feed_video(pkt),
            AvPacketPt::Aac => {
                let ts = pkt.timestamp as u32;
                let mut out = Vec::with_capacity(2);
                if !self.audio_seq_sent {
                    match self.audio_seq_header(ts) {
                        Some(msg) => {
                            out.push(msg);
                            self.audio_seq_sent = true;
                        }
                        None => {
                            tracing::trace!("aac frame before asc dropped");
                            return Ok(out);
                        }
                    }
                }
                out.push(audio_message(ts, aac::build_raw_payload(&pkt.payload)));
                Ok(out)
            }
            AvPacketPt::G711A | AvPacketPt::G711U => {
                let format = if pkt.payload_type == AvPacketPt::G711A {
                    SOUND_FORMAT_G711A
                } else {
                    SOUND_FORMAT_G711U
                };
                let mut b = BytesMut::with_capacity(1 + pkt.payload.len());
                b.put_u8(format << 4 | G711_SOUND_FLAGS);
                b.put_slice(&pkt.payload);
                Ok(vec![audio_message(pkt.timestamp as u32, b.freeze())])
            }
            AvPacketPt::Opus | AvPacketPt::Unknown => {
                tracing::trace!(pt = ?pkt.payload_type, "no rtmp mapping");
                Ok(Vec::new())
            }
        }
    }

    fn feed_video(&mut self, pkt: &AvPacket) -> Result<Vec<RtmpMessage>> {
        let is_hevc = pkt.payload_type == AvPacketPt::Hevc;
        let nalus = avc::split_avcc(&pkt.payload)?;
        let mut key = false;
        let mut params = AvConfig::default();
        for nalu in &nalus {
            let Some(&header) = nalu.first() else { continue };
            if is_hevc {
                match hevc::nalu_type(header) {
                    hevc::NALU_TYPE_VPS => params.vps = Some(Bytes::copy_from_slice(nalu)),
                    hevc::NALU_TYPE_SPS => params.sps = Some(Bytes::copy_from_slice(nalu)),
                    hevc::NALU_TYPE_PPS => params.pps = Some(Bytes::copy_from_slice(nalu)),
                    t if hevc::is_irap(t) => key = true,
                    _ => {}
                }
            } else {
                match avc::nalu_type(header) {
                    avc::NALU_TYPE_SPS => params.sps = Some(Bytes::copy_from_slice(nalu)),
                    avc::NALU_TYPE_PPS => params.pps = Some(Bytes::copy_from_slice(nalu)),
                    avc::NALU_TYPE_IDR => key = true,
                    _ => {}
                }
            }
        }

        let dts = pkt.timestamp as u32;
        let mut out = Vec::with_capacity(2);
        if key {
            let changed = params.has_video()
                && (params.sps != self.config.sps
                    || params.pps != self.config.pps
                    || params.vps != self.config.vps);
            if changed {
                self.config.vps = params.vps;
                self.config.sps = params.sps;
                self.config.pps = params.pps;
            }
            if changed || !self.video_seq_sent {
                if let Some(msg) = self.video_seq_header(dts)? {
                    out.push(msg);
                    self.video_seq_sent = true;
                }
            }
        }
        if !self.video_seq_sent {
            tracing::trace!(key, "video before sequence header dropped");
            return Ok(out);
        }

        let codec_id = if is_hevc { VIDEO_CODEC_HEVC } else { VIDEO_CODEC_AVC };
        let frame_type = if key { FRAME_TYPE_KEY } else { FRAME_TYPE_INTER };
        let cts = (pkt.pts - pkt.timestamp).clamp(-0x80_0000, 0x7F_FFFF) as i32;
        let mut b = BytesMut::with_capacity(5 + pkt.payload.len());
        b.put_u8(frame_type << 4 | codec_id);
        b.put_u8(1);
        b.put_slice(&cts.to_be_bytes()[1..]);
        b.put_slice(&pkt.payload);
        out.push(RtmpMessage::new(csid::VIDEO, type_id::VIDEO, MSG_STREAM_ID, dts, b.freeze()));
        Ok(out)
    }

    fn video_seq_header(&self, ts: u32) -> Result<Option<RtmpMessage>> {
        let (Some(sps), Some(pps)) = (&self.config.sps, &self.config.pps) else {
            return Ok(None);
        };
        let payload = match &self.config.vps {
            Some(vps) => hevc::build_seq_header(&hevc::HevcParameterSets {
                vps: vps.clone(),
                sps: sps.clone(),
                pps: pps.clone(),
            })?,
            None => avc::build_seq_header(sps, pps)?,
        };
        Ok(Some(RtmpMessage::new(csid::VIDEO, type_id::VIDEO, MSG_STREAM_ID, ts, payload)))
    }

    fn audio_seq_header(&self, ts: u32) -> Option<RtmpMessage> {
        let asc = self.config.asc.as_ref()?;
        Some(audio_message(ts, aac::build_seq_header(asc)))
    }
}

fn audio_message(ts: u32, payload: Bytes) -> RtmpMessage {
    RtmpMessage::new(csid::AUDIO, type_id::AUDIO, MSG_STREAM_ID, ts, payload)
}
