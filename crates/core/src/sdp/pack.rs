//! SDP generation (RFC 8866) for a stream described by an [`AvConfig`].
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:streamcore/x.y.z                      ← producing software
//! m=video 0 RTP/AVP 96                         ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1; ...          ← codec parameters
//! a=control:streamid=0                         ← track control URL
//! ```

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::avpacket::AvConfig;
use crate::codec::{aac::AudioSpecificConfig, avc};
use crate::config::Config;
use crate::error::{Error, ProtocolErrorKind, Result};

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;
pub const VIDEO_CONTROL: &str = "streamid=0";
pub const AUDIO_CONTROL: &str = "streamid=1";

/// Session-level fields of a generated SDP.
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub ip: String,
    pub session_name: String,
    pub tool: String,
}

impl SdpSession {
    pub fn new(config: &Config) -> Self {
        Self {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            ip: "127.0.0.1".to_string(),
            session_name: "No Name".to_string(),
            tool: config.library_tag(),
        }
    }
}

/// Build an SDP with one video section (H.264 or H.265, when SPS and PPS
/// are known) and one AAC audio section (when an ASC is known).
pub fn pack_sdp(av: &AvConfig, session: &SdpSession) -> Result<String> {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        session.username, session.session_id, session.session_version, session.ip
    ));
    sdp.push(format!("s={}", session.session_name));
    sdp.push(format!("c=IN IP4 {}", session.ip));
    sdp.push("t=0 0".to_string());
    sdp.push(format!("a=tool:{}", session.tool));

    let mut has_media = false;
    if let (Some(sps), Some(pps)) = (&av.sps, &av.pps) {
        let pt = VIDEO_PAYLOAD_TYPE;
        sdp.push(format!("m=video 0 RTP/AVP {pt}"));
        match &av.vps {
            Some(vps) => {
                sdp.push(format!("a=rtpmap:{pt} H265/90000"));
                sdp.push(format!(
                    "a=fmtp:{pt} sprop-vps={}; sprop-sps={}; sprop-pps={}",
                    BASE64_STANDARD.encode(vps),
                    BASE64_STANDARD.encode(sps),
                    BASE64_STANDARD.encode(pps)
                ));
            }
            None => {
                let mut fmtp = format!(
                    "a=fmtp:{pt} packetization-mode=1; sprop-parameter-sets={},{}",
                    BASE64_STANDARD.encode(sps),
                    BASE64_STANDARD.encode(pps)
                );
                if let Some(pl) = avc::profile_level_id(sps) {
                    fmtp.push_str(&format!("; profile-level-id={pl}"));
                }
                sdp.push(format!("a=rtpmap:{pt} H264/90000"));
                sdp.push(fmtp);
            }
        }
        sdp.push(format!("a=control:{VIDEO_CONTROL}"));
        has_media = true;
    }

    if let Some(asc) = &av.asc {
        let cfg = AudioSpecificConfig::parse(asc)?;
        let pt = AUDIO_PAYLOAD_TYPE;
        sdp.push(format!("m=audio 0 RTP/AVP {pt}"));
        sdp.push(format!(
            "a=rtpmap:{pt} MPEG4-GENERIC/{}/{}",
            cfg.sampling_frequency(),
            cfg.channel_configuration
        ));
        let config_hex: String = asc.iter().map(|b| format!("{b:02x}")).collect();
        sdp.push(format!(
            "a=fmtp:{pt} profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3; config={config_hex}"
        ));
        sdp.push(format!("a=control:{AUDIO_CONTROL}"));
        has_media = true;
    }

    if !has_media {
        return Err(Error::invalid(ProtocolErrorKind::InvalidSdp(
            "nothing to describe",
        )));
    }

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    Ok(format!("{}\r\n", sdp.join("\r\n")))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::avpacket::AvPacketPt;
    use crate::sdp::SdpLogicContext;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];

    fn session() -> SdpSession {
        SdpSession::new(&Config::default())
    }

    #[test]
    fn generates_h264_aac_sdp() {
        let av = AvConfig {
            asc: Some(Bytes::from_static(&[0x12, 0x10])),
            sps: Some(Bytes::from_static(SPS)),
            pps: Some(Bytes::from_static(PPS)),
            vps: None,
        };
        let sdp = pack_sdp(&av, &session()).unwrap();
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains(&format!("a=tool:{}\r\n", Config::default().library_tag())));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("profile-level-id=64001f"));
        assert!(sdp.contains("a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n"));
        assert!(sdp.contains("config=1210\r\n"));

        // rtpmap must come before fmtp (RFC 6184 §8.2.1)
        let rtpmap_idx = sdp.find("a=rtpmap:96").unwrap();
        let fmtp_idx = sdp.find("a=fmtp:96").unwrap();
        assert!(rtpmap_idx < fmtp_idx, "a=rtpmap must precede a=fmtp");
        assert!(sdp.ends_with("\r\n"), "SDP must end with CRLF");

        let ctx = SdpLogicContext::parse(&sdp).unwrap();
        assert_eq!(ctx.sps.as_deref(), Some(SPS));
        assert_eq!(ctx.pps.as_deref(), Some(PPS));
        assert_eq!(ctx.asc.as_deref(), Some(&[0x12u8, 0x10][..]));
    }

    #[test]
    fn generates_h265_sdp() {
        let av = AvConfig {
            asc: None,
            vps: Some(Bytes::from_static(&[0x40, 0x01, 0x0C])),
            sps: Some(Bytes::from_static(&[0x42, 0x01, 0x01])),
            pps: Some(Bytes::from_static(&[0x44, 0x01, 0xC0])),
        };
        let sdp = pack_sdp(&av, &session()).unwrap();
        assert!(sdp.contains("a=rtpmap:96 H265/90000\r\n"));
        assert!(!sdp.contains("m=audio"));
        let ctx = SdpLogicContext::parse(&sdp).unwrap();
        assert_eq!(ctx.video.unwrap().payload_type, AvPacketPt::Hevc);
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(pack_sdp(&AvConfig::default(), &session()).is_err());
    }
}
