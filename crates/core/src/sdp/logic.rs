use base64::prelude::{BASE64_STANDARD, BASE64_STANDARD_NO_PAD, Engine as _};
use bytes::Bytes;

use super::{MediaDescription, RawSdp};
use crate::avpacket::{AvConfig, AvPacketPt};
use crate::codec::{avc, hevc};
use crate::error::{Error, ProtocolErrorKind, Result};

/// What a session needs to know about one medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub payload_type: AvPacketPt,
    /// RTP payload type number.
    pub rtp_payload_type: u8,
    pub clock_rate: u32,
    /// `a=control` value, absolute or relative.
    pub control: Option<String>,
}

/// Session view of an SDP: codec, clock rate and control URI per medium,
/// plus the decoder configuration carried in `fmtp`.
///
/// Read-only once built.
#[derive(Debug, Clone)]
pub struct SdpLogicContext {
    pub raw_sdp: String,
    pub audio: Option<MediaInfo>,
    pub video: Option<MediaInfo>,
    pub asc: Option<Bytes>,
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    session_control: Option<String>,
}

impl SdpLogicContext {
    pub fn parse(raw_sdp: &str) -> Result<Self> {
        let sdp = super::parse(raw_sdp)?;
        Self::from_raw(raw_sdp, &sdp)
    }

    fn from_raw(raw_sdp: &str, sdp: &RawSdp) -> Result<Self> {
        let mut ctx = Self {
            raw_sdp: raw_sdp.to_string(),
            audio: None,
            video: None,
            asc: None,
            vps: None,
            sps: None,
            pps: None,
            session_control: sdp.control.clone(),
        };

        for media in &sdp.medias {
            let Some(info) = media_info(media) else {
                tracing::warn!(media = %media.media, formats = ?media.formats, "unsupported sdp media, ignoring");
                continue;
            };
            match media.media.as_str() {
                "video" if ctx.video.is_none() => {
                    ctx.parse_video_fmtp(media, info.payload_type);
                    ctx.video = Some(info);
                }
                "audio" if ctx.audio.is_none() => {
                    if info.payload_type == AvPacketPt::Aac {
                        ctx.asc = media
                            .fmtp()
                            .and_then(|f| f.get("config"))
                            .and_then(decode_hex);
                    }
                    ctx.audio = Some(info);
                }
                _ => {}
            }
        }

        if ctx.audio.is_none() && ctx.video.is_none() {
            return Err(Error::invalid(ProtocolErrorKind::InvalidSdp(
                "no supported media",
            )));
        }
        Ok(ctx)
    }

    fn parse_video_fmtp(&mut self, media: &MediaDescription, pt: AvPacketPt) {
        let Some(fmtp) = media.fmtp() else {
            return;
        };
        match pt {
            AvPacketPt::Avc => {
                let Some(sets) = fmtp.get("sprop-parameter-sets") else {
                    return;
                };
                for set in sets.split(',').filter_map(decode_base64) {
                    match set.first().map(|&b| avc::nalu_type(b)) {
                        Some(avc::NALU_TYPE_SPS) => self.sps = Some(set),
                        Some(avc::NALU_TYPE_PPS) => self.pps = Some(set),
                        _ => {}
                    }
                }
            }
            AvPacketPt::Hevc => {
                self.vps = fmtp.get("sprop-vps").and_then(decode_base64);
                self.sps = fmtp.get("sprop-sps").and_then(decode_base64);
                self.pps = fmtp.get("sprop-pps").and_then(decode_base64);
                if let Some(vps) = &self.vps
                    && vps.first().map(|&b| hevc::nalu_type(b)) != Some(hevc::NALU_TYPE_VPS)
                {
                    tracing::warn!("sprop-vps does not hold a VPS");
                }
            }
            _ => {}
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn is_audio_payload_type(&self, rtp_payload_type: u8) -> bool {
        self.audio
            .as_ref()
            .is_some_and(|a| a.rtp_payload_type == rtp_payload_type)
    }

    pub fn is_video_payload_type(&self, rtp_payload_type: u8) -> bool {
        self.video
            .as_ref()
            .is_some_and(|v| v.rtp_payload_type == rtp_payload_type)
    }

    pub fn av_config(&self) -> AvConfig {
        AvConfig {
            asc: self.asc.clone(),
            vps: self.vps.clone(),
            sps: self.sps.clone(),
            pps: self.pps.clone(),
        }
    }

    /// SETUP URI for `control`, resolved against the presentation URL.
    pub fn make_control_uri(&self, base_url: &str, control: Option<&str>) -> String {
        let base = match &self.session_control {
            Some(c) if is_absolute(c) => c.as_str(),
            _ => base_url,
        };
        match control {
            None | Some("") | Some("*") => base.to_string(),
            Some(c) if is_absolute(c) => c.to_string(),
            Some(c) => format!("{}/{}", base.trim_end_matches('/'), c.trim_start_matches('/')),
        }
    }

    pub fn audio_control_uri(&self, base_url: &str) -> Option<String> {
        let audio = self.audio.as_ref()?;
        Some(self.make_control_uri(base_url, audio.control.as_deref()))
    }

    pub fn video_control_uri(&self, base_url: &str) -> Option<String> {
        let video = self.video.as_ref()?;
        Some(self.make_control_uri(base_url, video.control.as_deref()))
    }
}

fn is_absolute(uri: &str) -> bool {
    uri.starts_with("rtsp://") || uri.starts_with("rtsps://")
}

fn media_info(media: &MediaDescription) -> Option<MediaInfo> {
    let rtp_payload_type = *media.formats.first()?;
    let (payload_type, clock_rate) = match media.rtpmap() {
        Some(map) => (codec_of(&map.encoding_name), map.clock_rate),
        // RFC 3551 static assignments.
        None => match rtp_payload_type {
            0 => (AvPacketPt::G711U, 8000),
            8 => (AvPacketPt::G711A, 8000),
            _ => return None,
        },
    };
    if payload_type == AvPacketPt::Unknown {
        return None;
    }
    Some(MediaInfo {
        payload_type,
        rtp_payload_type,
        clock_rate,
        control: media.control.clone(),
    })
}

fn codec_of(encoding_name: &str) -> AvPacketPt {
    match encoding_name.to_ascii_uppercase().as_str() {
        "H264" => AvPacketPt::Avc,
        "H265" => AvPacketPt::Hevc,
        "MPEG4-GENERIC" => AvPacketPt::Aac,
        "PCMA" => AvPacketPt::G711A,
        "PCMU" => AvPacketPt::G711U,
        "OPUS" => AvPacketPt::Opus,
        _ => AvPacketPt::Unknown,
    }
}

fn decode_base64(s: &str) -> Option<Bytes> {
    let s = s.trim();
    BASE64_STANDARD
        .decode(s)
        .or_else(|_| BASE64_STANDARD_NO_PAD.decode(s.trim_end_matches('=')))
        .ok()
        .filter(|b| !b.is_empty())
        .map(Bytes::from)
}

fn decode_hex(s: &str) -> Option<Bytes> {
    let s = s.trim();
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}
