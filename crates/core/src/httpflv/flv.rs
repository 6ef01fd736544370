//! FLV file header and tag framing.
//!
//! An RTMP audio, video or data message body is an FLV tag body; only the
//! 11-byte tag header and the trailing previous-tag-size are added here.
//!
//! ```text
//! +---------+-------------+--------------+-------------+-------------+------+--------------+
//! | Type(1) | DataSize(3) | Timestamp(3) | TsExtend(1) | StreamId(3) | Data | PrevSize(4)  |
//! +---------+-------------+--------------+-------------+-------------+------+--------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ProtocolErrorKind, Result};
use crate::rtmp::{RtmpMessage, type_id};

pub const TAG_TYPE_AUDIO: u8 = type_id::AUDIO;
pub const TAG_TYPE_VIDEO: u8 = type_id::VIDEO;
pub const TAG_TYPE_SCRIPT: u8 = type_id::DATA_AMF0;

pub const TAG_HEADER_SIZE: usize = 11;
pub const PREV_TAG_SIZE_FIELD_SIZE: usize = 4;

/// `FLV` version 1 with both audio and video flags set, followed by the
/// zero PreviousTagSize0.
pub const FLV_HEADER: [u8; 13] = [b'F', b'L', b'V', 1, 0x05, 0, 0, 0, 9, 0, 0, 0, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub body: Bytes,
}

impl FlvTag {
    /// Tag for an RTMP audio, video or data message; `None` for anything
    /// else.
    pub fn from_rtmp(msg: &RtmpMessage) -> Option<Self> {
        match msg.header.msg_type_id {
            TAG_TYPE_AUDIO | TAG_TYPE_VIDEO | TAG_TYPE_SCRIPT => Some(Self {
                tag_type: msg.header.msg_type_id,
                timestamp: msg.header.timestamp_abs,
                body: msg.payload.clone(),
            }),
            _ => None,
        }
    }

    /// Header, body and previous-tag-size in one buffer.
    pub fn pack(&self) -> Bytes {
        let data_size = self.body.len();
        let mut b = BytesMut::with_capacity(TAG_HEADER_SIZE + data_size + PREV_TAG_SIZE_FIELD_SIZE);
        b.put_u8(self.tag_type);
        b.put_uint(data_size as u64, 3);
        b.put_uint(u64::from(self.timestamp & 0xFF_FFFF), 3);
        b.put_u8((self.timestamp >> 24) as u8);
        b.put_uint(0, 3);
        b.put_slice(&self.body);
        b.put_u32((TAG_HEADER_SIZE + data_size) as u32);
        b.freeze()
    }

    /// Parse one tag (with its previous-tag-size) from the front of `b`;
    /// returns the tag and the bytes consumed.
    pub fn parse(b: &[u8]) -> Result<(Self, usize)> {
        if b.len() < TAG_HEADER_SIZE {
            return Err(Error::short(TAG_HEADER_SIZE, b.len()));
        }
        let data_size = (usize::from(b[1]) << 16) | (usize::from(b[2]) << 8) | usize::from(b[3]);
        let total = TAG_HEADER_SIZE + data_size + PREV_TAG_SIZE_FIELD_SIZE;
        if b.len() < total {
            return Err(Error::short(total, b.len()));
        }
        let timestamp = (u32::from(b[7]) << 24)
            | (u32::from(b[4]) << 16)
            | (u32::from(b[5]) << 8)
            | u32::from(b[6]);
        let prev = u32::from_be_bytes([b[total - 4], b[total - 3], b[total - 2], b[total - 1]]);
        if prev as usize != TAG_HEADER_SIZE + data_size {
            return Err(Error::invalid(ProtocolErrorKind::InvalidCodecData(
                "flv previous tag size mismatch",
            )));
        }
        let tag = Self {
            tag_type: b[0],
            timestamp,
            body: Bytes::copy_from_slice(&b[TAG_HEADER_SIZE..TAG_HEADER_SIZE + data_size]),
        };
        Ok((tag, total))
    }
}
