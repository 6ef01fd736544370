use std::sync::Arc;

use super::rtmp2av::{RtmpAvEvent, RtmpToAv};
use crate::avpacket::{AvConfig, AvPacket, AvPacketPt};
use crate::codec::aac::AudioSpecificConfig;
use crate::config::Config;
use crate::error::Result;
use crate::media::{RtpPacker, RtpPacket, new_packer};
use crate::rtmp::RtmpMessage;
use crate::sdp::pack::{AUDIO_PAYLOAD_TYPE, SdpSession, VIDEO_PAYLOAD_TYPE, pack_sdp};

/// Frames held back while waiting for the sequence header of the other
/// medium. Reaching it describes whatever is known so far.
const ANALYZE_PACKET_LIMIT: usize = 64;

const VIDEO_CLOCK_RATE: u32 = 90_000;

pub trait RtmpToRtspObserver: Send + Sync {
    /// Called once, before the first RTP packet.
    fn on_sdp(&self, raw_sdp: &str);

    fn on_rtp_packet(&self, pkt: &RtpPacket);
}

/// Feeds an RTMP stream into RTSP.
///
/// Sequence headers are collected until both an AVC/HEVC and an AAC
/// configuration are known (or [`ANALYZE_PACKET_LIMIT`] frames went by);
/// then the SDP is generated, the held frames are flushed and every later
/// frame is packed into RTP straight away. Codecs the SDP cannot describe
/// are dropped.
pub struct RtmpToRtsp {
    observer: Arc<dyn RtmpToRtspObserver>,
    sdp_session: SdpSession,
    max_payload_size: usize,
    to_av: RtmpToAv,
    pending: Vec<AvPacket>,
    described: Option<AvConfig>,
    audio_packer: Option<RtpPacker>,
    video_packer: Option<RtpPacker>,
}

impl RtmpToRtsp {
    pub fn new(config: &Config, observer: Arc<dyn RtmpToRtspObserver>) -> Self {
        Self {
            observer,
            sdp_session: SdpSession::new(config),
            max_payload_size: config.rtp_max_payload_size,
            to_av: RtmpToAv::new(),
            pending: Vec::new(),
            described: None,
            audio_packer: None,
            video_packer: None,
        }
    }

    /// Whether the SDP has been produced.
    pub fn is_described(&self) -> bool {
        self.described.is_some()
    }

    pub fn feed_rtmp_message(&mut self, msg: &RtmpMessage) -> Result<()> {
        match self.to_av.feed(msg)? {
            None => Ok(()),
            Some(RtmpAvEvent::Config(config)) => {
                if self.described.is_some() {
                    tracing::debug!("sequence header after sdp ignored");
                    return Ok(());
                }
                if config.has_video() && config.asc.is_some() {
                    self.describe()?;
                }
                Ok(())
            }
            Some(RtmpAvEvent::Packet(pkt)) => {
                if self.described.is_some() {
                    self.pack(&pkt);
                    return Ok(());
                }
                self.pending.push(pkt);
                if self.pending.len() >= ANALYZE_PACKET_LIMIT {
                    self.describe()?;
                }
                Ok(())
            }
        }
    }

    fn describe(&mut self) -> Result<()> {
        let config = self.to_av.config().clone();
        let sdp = pack_sdp(&config, &self.sdp_session)?;

        if config.has_video() {
            let pt = if config.is_hevc() { AvPacketPt::Hevc } else { AvPacketPt::Avc };
            self.video_packer = new_packer(pt, VIDEO_PAYLOAD_TYPE, VIDEO_CLOCK_RATE, self.max_payload_size);
        }
        if let Some(asc) = &config.asc {
            let clock_rate = AudioSpecificConfig::parse(asc)?.sampling_frequency();
            self.audio_packer = new_packer(AvPacketPt::Aac, AUDIO_PAYLOAD_TYPE, clock_rate, self.max_payload_size);
        }
        tracing::info!(
            video = ?self.video_packer.as_ref().map(|p| p.ssrc()),
            audio = ?self.audio_packer.as_ref().map(|p| p.ssrc()),
            held = self.pending.len(),
            "rtmp to rtsp described"
        );
        self.described = Some(config);
        self.observer.on_sdp(&sdp);

        for pkt in std::mem::take(&mut self.pending) {
            self.pack(&pkt);
        }
        Ok(())
    }

    fn pack(&mut self, pkt: &AvPacket) {
        let described = self.described.as_ref();
        let packer = match pkt.payload_type {
            AvPacketPt::Avc | AvPacketPt::Hevc => {
                let hevc = described.is_some_and(|c| c.is_hevc());
                if hevc != (pkt.payload_type == AvPacketPt::Hevc) {
                    tracing::trace!(pt = ?pkt.payload_type, "video codec differs from sdp");
                    return;
                }
                self.video_packer.as_mut()
            }
            AvPacketPt::Aac => self.audio_packer.as_mut(),
            _ => None,
        };
        let Some(packer) = packer else {
            tracing::trace!(pt = ?pkt.payload_type, "no rtp track for frame");
            return;
        };
        for rtp in packer.pack(pkt) {
            self.observer.on_rtp_packet(&rtp);
        }
    }
}
