//! RTMP chunk-stream protocol: handshake, chunk codec, AMF0 command
//! choreography, and the server, push and pull sessions built on them.

pub mod chunk;
mod client_session;
pub mod handshake;
pub mod message;
pub mod pull_session;
pub mod push_session;
pub mod server;
pub mod server_session;
pub mod stream;

use bytes::Bytes;

pub use chunk::{ChunkComposer, pack_message};
pub use pull_session::PullSession;
pub use push_session::PushSession;
pub use server::{RtmpServer, RtmpServerObserver};
pub use server_session::ServerSession;
pub use stream::MessageReader;

pub const DEFAULT_PORT: u16 = 1935;
/// Chunk size both sides assume until a SetChunkSize arrives.
pub const DEFAULT_CHUNK_SIZE: u32 = 128;
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;
pub const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

pub mod type_id {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF3: u8 = 15;
    pub const COMMAND_AMF3: u8 = 17;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

pub mod csid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const OVER_CONNECTION: u32 = 3;
    pub const OVER_STREAM: u32 = 5;
    pub const AUDIO: u32 = 6;
    pub const VIDEO: u32 = 7;
}

pub mod user_control {
    pub const STREAM_BEGIN: u16 = 0;
    pub const STREAM_EOF: u16 = 1;
    pub const SET_BUFFER_LENGTH: u16 = 3;
    pub const PING_REQUEST: u16 = 6;
    pub const PING_RESPONSE: u16 = 7;
}

/// Header of a reassembled message. `timestamp_abs` is always absolute
/// after decoding, whatever chunk format carried it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtmpHeader {
    pub csid: u32,
    pub msg_len: u32,
    pub msg_type_id: u8,
    pub msg_stream_id: u32,
    pub timestamp_abs: u32,
}

/// One RTMP message. Audio and video payloads follow FLV tag body layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub header: RtmpHeader,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(csid: u32, msg_type_id: u8, msg_stream_id: u32, timestamp_abs: u32, payload: Bytes) -> Self {
        Self {
            header: RtmpHeader {
                csid,
                msg_len: payload.len() as u32,
                msg_type_id,
                msg_stream_id,
                timestamp_abs,
            },
            payload,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.header.msg_type_id == type_id::AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.header.msg_type_id == type_id::VIDEO
    }

    pub fn is_metadata(&self) -> bool {
        self.header.msg_type_id == type_id::DATA_AMF0
    }

    pub fn is_av(&self) -> bool {
        self.is_audio() || self.is_video()
    }

    /// Video key frame, sequence headers included. Works for both legacy
    /// (`0x17`/`0x1C`) and enhanced (`0x9x`) first bytes.
    pub fn is_video_key_frame(&self) -> bool {
        self.is_video() && self.payload.first().is_some_and(|b| (b >> 4) & 0x07 == 1)
    }

    /// AVC or HEVC sequence header in either legacy or enhanced layout.
    pub fn is_video_seq_header(&self) -> bool {
        if !self.is_video() || self.payload.len() < 2 {
            return false;
        }
        let b0 = self.payload[0];
        if b0 & 0x80 != 0 {
            return b0 & 0x0F == 0;
        }
        matches!(b0, 0x17 | 0x1C) && self.payload[1] == 0
    }

    pub fn is_aac_seq_header(&self) -> bool {
        self.is_audio() && crate::codec::aac::is_seq_header(&self.payload)
    }
}

/// Consumer of the audio, video and metadata messages a session reads.
///
/// Called on the session's read task; implementations must not block.
pub trait RtmpMessageSink: Send + Sync {
    fn on_rtmp_message(&self, msg: &RtmpMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(payload: &'static [u8]) -> RtmpMessage {
        RtmpMessage::new(csid::VIDEO, type_id::VIDEO, 1, 0, Bytes::from_static(payload))
    }

    #[test]
    fn classifies_video_headers() {
        assert!(video(&[0x17, 0x00, 0, 0, 0]).is_video_seq_header());
        assert!(video(&[0x1C, 0x00, 0, 0, 0]).is_video_seq_header());
        assert!(video(&[0x90, b'h', b'v', b'c', b'1']).is_video_seq_header());
        assert!(!video(&[0x17, 0x01, 0, 0, 0]).is_video_seq_header());
        assert!(!video(&[0x91, b'h', b'v', b'c', b'1']).is_video_seq_header());

        assert!(video(&[0x17, 0x01]).is_video_key_frame());
        assert!(video(&[0x91, b'h']).is_video_key_frame());
        assert!(!video(&[0x27, 0x01]).is_video_key_frame());
        assert!(!video(&[0xA1, b'h']).is_video_key_frame());
    }
}
