//! SDP (Session Description Protocol, RFC 8866) parsing and packing.
//!
//! [`parse`] yields the raw media descriptions; [`logic::SdpLogicContext`]
//! derives what a session needs from them (codecs, clock rates, control
//! URIs, parameter sets); [`pack`] builds a description from an
//! [`AvConfig`](crate::avpacket::AvConfig).

pub mod logic;
pub mod pack;

pub use logic::SdpLogicContext;
pub use pack::{SdpSession, pack_sdp};

use crate::error::{Error, ProtocolErrorKind, Result};

/// `a=rtpmap:<pt> <encoding>/<clock>[/<params>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtpmap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
    /// Channel count for audio, when present.
    pub params: Option<String>,
}

impl Rtpmap {
    fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::invalid(ProtocolErrorKind::InvalidSdp("rtpmap"));
        let (pt, rest) = value.trim().split_once(' ').ok_or_else(invalid)?;
        let mut parts = rest.trim().splitn(3, '/');
        let encoding_name = parts.next().ok_or_else(invalid)?.to_string();
        let clock_rate = parts
            .next()
            .and_then(|c| c.trim().parse().ok())
            .ok_or_else(invalid)?;
        Ok(Self {
            payload_type: pt.trim().parse().map_err(|_| invalid())?,
            encoding_name,
            clock_rate,
            params: parts.next().map(str::to_string),
        })
    }
}

/// `a=fmtp:<pt> key=value; key=value`. Keys are kept lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmtp {
    pub payload_type: u8,
    pub params: Vec<(String, String)>,
}

impl Fmtp {
    fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::invalid(ProtocolErrorKind::InvalidSdp("fmtp"));
        let (pt, rest) = value.trim().split_once(' ').ok_or_else(invalid)?;
        let params = rest
            .split(';')
            .filter_map(|kv| {
                let (k, v) = kv.trim().split_once('=')?;
                Some((k.trim().to_ascii_lowercase(), v.trim().to_string()))
            })
            .collect();
        Ok(Self {
            payload_type: pt.trim().parse().map_err(|_| invalid())?,
            params,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// One `m=` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    /// `audio`, `video`, ...
    pub media: String,
    pub port: u16,
    pub proto: String,
    pub formats: Vec<u8>,
    pub rtpmaps: Vec<Rtpmap>,
    pub fmtps: Vec<Fmtp>,
    pub control: Option<String>,
    /// Remaining `a=` lines as `(name, value)`.
    pub attributes: Vec<(String, Option<String>)>,
}

impl MediaDescription {
    /// rtpmap of the first listed format.
    pub fn rtpmap(&self) -> Option<&Rtpmap> {
        let pt = *self.formats.first()?;
        self.rtpmaps.iter().find(|r| r.payload_type == pt)
    }

    pub fn fmtp(&self) -> Option<&Fmtp> {
        let pt = *self.formats.first()?;
        self.fmtps.iter().find(|f| f.payload_type == pt)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSdp {
    pub session_name: Option<String>,
    /// Session-level `a=control`.
    pub control: Option<String>,
    pub medias: Vec<MediaDescription>,
}

/// Split into logical lines, joining any line that does not start with
/// `<letter>=` onto the previous one. Some encoders wrap long base64
/// values.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let bytes = line.as_bytes();
        let is_field = bytes.len() >= 2 && bytes[0].is_ascii_lowercase() && bytes[1] == b'=';
        match lines.last_mut() {
            Some(prev) if !is_field => prev.push_str(line.trim()),
            _ => lines.push(line.to_string()),
        }
    }
    lines
}

pub fn parse(text: &str) -> Result<RawSdp> {
    let mut sdp = RawSdp::default();
    for line in logical_lines(text) {
        let (Some(field), Some(value)) = (line.get(..2), line.get(2..)) else {
            continue;
        };
        match field {
            "s=" => sdp.session_name = Some(value.to_string()),
            "m=" => {
                let mut it = value.split_whitespace();
                let media = it.next().unwrap_or_default().to_string();
                let port = it
                    .next()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                let proto = it.next().unwrap_or_default().to_string();
                let formats = it.filter_map(|f| f.parse().ok()).collect();
                sdp.medias.push(MediaDescription {
                    media,
                    port,
                    proto,
                    formats,
                    ..MediaDescription::default()
                });
            }
            "a=" => {
                let (name, attr_value) = match value.split_once(':') {
                    Some((n, v)) => (n, Some(v)),
                    None => (value, None),
                };
                if sdp.medias.is_empty() {
                    if name == "control" {
                        sdp.control = attr_value.map(str::to_string);
                    }
                    continue;
                }
                let Some(media) = sdp.medias.last_mut() else {
                    continue;
                };
                match (name, attr_value) {
                    ("rtpmap", Some(v)) => media.rtpmaps.push(Rtpmap::parse(v)?),
                    ("fmtp", Some(v)) => media.fmtps.push(Fmtp::parse(v)?),
                    ("control", Some(v)) => media.control = Some(v.to_string()),
                    _ => media
                        .attributes
                        .push((name.to_string(), attr_value.map(str::to_string))),
                }
            }
            _ => {}
        }
    }
    if sdp.medias.is_empty() {
        return Err(Error::invalid(ProtocolErrorKind::InvalidSdp(
            "no media description",
        )));
    }
    Ok(sdp)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FFMPEG_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=No Name\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
a=tool:libavformat 58.76.100\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z2QAH6zZQFAFuwEQAAADABAAAAMDKPGDGWA=,aOvjyyLA; profile-level-id=64001F\r\n\
a=control:streamid=0\r\n\
m=audio 0 RTP/AVP 97\r\n\
b=AS:128\r\n\
a=rtpmap:97 MPEG4-GENERIC/44100/2\r\n\
a=fmtp:97 profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3; config=1210\r\n\
a=control:streamid=1\r\n";

    #[test]
    fn parses_media_sections() {
        let sdp = parse(FFMPEG_SDP).unwrap();
        assert_eq!(sdp.session_name.as_deref(), Some("No Name"));
        assert_eq!(sdp.medias.len(), 2);

        let video = &sdp.medias[0];
        assert_eq!(video.media, "video");
        assert_eq!(video.formats, vec![96]);
        let rtpmap = video.rtpmap().unwrap();
        assert_eq!(rtpmap.encoding_name, "H264");
        assert_eq!(rtpmap.clock_rate, 90000);
        assert_eq!(video.fmtp().unwrap().get("packetization-mode"), Some("1"));
        assert_eq!(video.control.as_deref(), Some("streamid=0"));

        let audio = &sdp.medias[1];
        assert_eq!(audio.rtpmap().unwrap().params.as_deref(), Some("2"));
        assert_eq!(audio.fmtp().unwrap().get("CONFIG"), Some("1210"));
    }

    #[test]
    fn wrapped_lines_are_merged() {
        let text = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z2QAH6zZ\r\nQFAFuwEQ,aOvjyyLA\r\n";
        let sdp = parse(text).unwrap();
        let fmtp = sdp.medias[0].fmtp().unwrap();
        assert_eq!(fmtp.get("sprop-parameter-sets"), Some("Z2QAH6zZQFAFuwEQ,aOvjyyLA"));
    }

    #[test]
    fn session_without_media_is_invalid() {
        let err = parse("v=0\r\ns=x\r\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn malformed_rtpmap_is_invalid() {
        assert!(parse("m=video 0 RTP/AVP 96\r\na=rtpmap:96\r\n").is_err());
    }
}
