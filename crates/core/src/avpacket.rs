//! Protocol-neutral media frame passed between unpackers, the aligner and
//! the remuxers.

use bytes::Bytes;

/// Codec of an [`AvPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvPacketPt {
    Avc,
    Hevc,
    Aac,
    G711A,
    G711U,
    Opus,
    Unknown,
}

impl AvPacketPt {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Avc | Self::Hevc)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Aac | Self::G711A | Self::G711U | Self::Opus)
    }
}

/// One access unit (video) or audio frame.
///
/// Video payloads are AVCC: each NAL unit is prefixed with its 4-byte
/// big-endian length. Audio payloads are raw frames (no ADTS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPacket {
    pub payload_type: AvPacketPt,
    /// Decode timestamp in milliseconds.
    pub timestamp: i64,
    /// Presentation timestamp in milliseconds.
    pub pts: i64,
    pub payload: Bytes,
}

impl AvPacket {
    /// Packet whose presentation and decode times coincide.
    pub fn new(payload_type: AvPacketPt, timestamp: i64, payload: Bytes) -> Self {
        Self {
            payload_type,
            timestamp,
            pts: timestamp,
            payload,
        }
    }

    pub fn is_video(&self) -> bool {
        self.payload_type.is_video()
    }

    pub fn is_audio(&self) -> bool {
        self.payload_type.is_audio()
    }
}

/// Out-of-band decoder configuration that accompanies a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvConfig {
    /// AAC AudioSpecificConfig.
    pub asc: Option<Bytes>,
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl AvConfig {
    pub fn has_video(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    pub fn is_hevc(&self) -> bool {
        self.vps.is_some()
    }
}

/// Consumer of what an input session produces.
///
/// Called from the session's reader tasks, never with a session lock held.
/// All methods default to no-ops so a sink implements only what it needs.
pub trait AvPacketSink: Send + Sync {
    /// Decoder configuration, delivered before the first packet. Any field
    /// may be absent.
    fn on_av_config(&self, _config: &AvConfig) {}

    fn on_av_packet(&self, _pkt: AvPacket) {}

    /// Raw RTP as received, for relays that forward without unpacking.
    fn on_rtp_packet(&self, _pkt: &crate::media::RtpPacket) {}
}
