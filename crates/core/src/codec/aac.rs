//! AAC AudioSpecificConfig and the RTMP/FLV AAC tag layout.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ProtocolErrorKind, Result};

/// FLV SoundFormat 10 (AAC), 44 kHz, 16-bit, stereo: always 0xAF for AAC.
pub const FLV_AAC_HEADER: u8 = 0xAF;
pub const AAC_PACKET_TYPE_SEQ_HEADER: u8 = 0;
pub const AAC_PACKET_TYPE_RAW: u8 = 1;

/// Samples per AAC frame.
pub const SAMPLES_PER_FRAME: u32 = 1024;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// First two bytes of an AudioSpecificConfig (ISO 14496-3 §1.6.2.1).
///
/// ```text
/// audioObjectType(5) samplingFrequencyIndex(4) channelConfiguration(4) ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
}

impl AudioSpecificConfig {
    pub fn parse(asc: &[u8]) -> Result<Self> {
        if asc.len() < 2 {
            return Err(Error::short(2, asc.len()));
        }
        let cfg = Self {
            object_type: asc[0] >> 3,
            sampling_frequency_index: ((asc[0] & 0x07) << 1) | (asc[1] >> 7),
            channel_configuration: (asc[1] >> 3) & 0x0F,
        };
        if cfg.sampling_frequency_index as usize >= SAMPLING_FREQUENCIES.len() {
            return Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
                "aac sampling frequency index",
            )));
        }
        Ok(cfg)
    }

    pub fn pack(&self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.sampling_frequency_index >> 1),
            ((self.sampling_frequency_index & 0x01) << 7) | (self.channel_configuration << 3),
        ]
    }

    pub fn sampling_frequency(&self) -> u32 {
        SAMPLING_FREQUENCIES
            .get(self.sampling_frequency_index as usize)
            .copied()
            .unwrap_or(44100)
    }

    /// Index of `hz`, if it is a standard sampling frequency.
    pub fn frequency_index(hz: u32) -> Option<u8> {
        SAMPLING_FREQUENCIES
            .iter()
            .position(|&f| f == hz)
            .map(|i| i as u8)
    }
}

/// Whether an RTMP audio payload is an AAC sequence header.
pub fn is_seq_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[0] >> 4 == 10 && payload[1] == AAC_PACKET_TYPE_SEQ_HEADER
}

/// AudioSpecificConfig from an RTMP AAC sequence-header payload.
pub fn parse_seq_header(payload: &[u8]) -> Result<Bytes> {
    if !is_seq_header(payload) {
        return Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
            "not an aac sequence header",
        )));
    }
    AudioSpecificConfig::parse(&payload[2..])?;
    Ok(Bytes::copy_from_slice(&payload[2..]))
}

pub fn build_seq_header(asc: &[u8]) -> Bytes {
    build_payload(AAC_PACKET_TYPE_SEQ_HEADER, asc)
}

/// RTMP audio payload carrying one raw AAC frame.
pub fn build_raw_payload(frame: &[u8]) -> Bytes {
    build_payload(AAC_PACKET_TYPE_RAW, frame)
}

fn build_payload(packet_type: u8, data: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(2 + data.len());
    b.put_u8(FLV_AAC_HEADER);
    b.put_u8(packet_type);
    b.put_slice(data);
    b.freeze()
}
