//! Chunk-stream codec.
//!
//! ```text
//! +--------------+----------------------+--------------+-------------+
//! | basic header | message header       | ext. ts      | chunk data  |
//! | 1-3 bytes    | 11 / 7 / 3 / 0 bytes | 0 or 4 bytes | <= chunk sz |
//! +--------------+----------------------+--------------+-------------+
//! ```
//!
//! The composer keeps per-csid state and always reports absolute
//! timestamps. The packer writes fmt 0 for the first chunk of every message
//! and fmt 3 for its continuations, so it needs no state of its own.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::{DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE, RtmpHeader, RtmpMessage};
use crate::buffer::Buffer;
use crate::error::{Error, ProtocolErrorKind, Result};

const MESSAGE_HEADER_LEN: [usize; 4] = [11, 7, 3, 0];

#[derive(Debug, Default)]
struct ChunkStream {
    header: RtmpHeader,
    timestamp_delta: u32,
    has_extended: bool,
    seen: bool,
    remaining: u32,
    msg: BytesMut,
}

/// Reassembles messages from chunks fed in arbitrary slices.
#[derive(Debug)]
pub struct ChunkComposer {
    peer_chunk_size: u32,
    streams: HashMap<u32, ChunkStream>,
    buf: Buffer,
}

impl Default for ChunkComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkComposer {
    pub fn new() -> Self {
        Self {
            peer_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            buf: Buffer::new(16 * 1024),
        }
    }

    pub fn peer_chunk_size(&self) -> u32 {
        self.peer_chunk_size
    }

    /// Apply a SetChunkSize from the peer.
    pub fn set_peer_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(Error::invalid(ProtocolErrorKind::InvalidChunk("chunk size out of range")));
        }
        self.peer_chunk_size = size;
        Ok(())
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.write(data);
    }

    /// Bytes fed but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, or `None` when more input is needed.
    pub fn next_message(&mut self) -> Result<Option<RtmpMessage>> {
        loop {
            match self.next_chunk()? {
                None => return Ok(None),
                Some(Some(msg)) => return Ok(Some(msg)),
                Some(None) => continue,
            }
        }
    }

    /// `None`: need input. `Some(None)`: consumed a chunk that did not
    /// complete a message.
    fn next_chunk(&mut self) -> Result<Option<Option<RtmpMessage>>> {
        let b = self.buf.bytes();
        if b.is_empty() {
            return Ok(None);
        }
        let fmt = (b[0] >> 6) as usize;
        let (csid, mut pos) = match b[0] & 0x3F {
            0 => {
                if b.len() < 2 {
                    return Ok(None);
                }
                (64 + b[1] as u32, 2)
            }
            1 => {
                if b.len() < 3 {
                    return Ok(None);
                }
                (64 + b[1] as u32 + ((b[2] as u32) << 8), 3)
            }
            n => (n as u32, 1),
        };
        if b.len() < pos + MESSAGE_HEADER_LEN[fmt] {
            return Ok(None);
        }

        let stream = self.streams.entry(csid).or_default();
        if !stream.seen && fmt != 0 {
            return Err(Error::invalid(ProtocolErrorKind::InvalidChunk(
                "chunk stream starts without a full header",
            )));
        }

        let mut header = stream.header;
        header.csid = csid;
        let mut ts_field = None;
        if fmt <= 2 {
            ts_field = Some(read_u24(&b[pos..]));
        }
        if fmt <= 1 {
            header.msg_len = read_u24(&b[pos + 3..]);
            header.msg_type_id = b[pos + 6];
        }
        if fmt == 0 {
            header.msg_stream_id = u32::from_le_bytes([b[pos + 7], b[pos + 8], b[pos + 9], b[pos + 10]]);
        }
        pos += MESSAGE_HEADER_LEN[fmt];

        let extended = ts_field.map_or(stream.has_extended, |t| t == EXTENDED_TIMESTAMP);
        let mut ts_value = ts_field.unwrap_or(0);
        if extended {
            if b.len() < pos + 4 {
                return Ok(None);
            }
            if ts_field.is_some() {
                ts_value = u32::from_be_bytes([b[pos], b[pos + 1], b[pos + 2], b[pos + 3]]);
            }
            pos += 4;
        }

        let in_progress = stream.remaining > 0;
        let new_message = fmt != 3 || !in_progress;
        let mut delta = stream.timestamp_delta;
        match fmt {
            0 => {
                header.timestamp_abs = ts_value;
                delta = 0;
            }
            1 | 2 => {
                header.timestamp_abs = header.timestamp_abs.wrapping_add(ts_value);
                delta = ts_value;
            }
            _ if new_message => header.timestamp_abs = header.timestamp_abs.wrapping_add(delta),
            _ => {}
        }

        if new_message && header.msg_len > MAX_MESSAGE_SIZE {
            return Err(Error::invalid(ProtocolErrorKind::InvalidChunk("message too large")));
        }
        let remaining = if new_message { header.msg_len } else { stream.remaining };
        let data_len = remaining.min(self.peer_chunk_size) as usize;
        if b.len() < pos + data_len {
            return Ok(None);
        }

        if new_message && in_progress {
            tracing::warn!(csid, fmt, "chunk restarts an unfinished message");
        }
        if new_message {
            stream.msg.clear();
            stream.msg.reserve(header.msg_len as usize);
        }
        stream.header = header;
        stream.timestamp_delta = delta;
        if fmt != 3 {
            stream.has_extended = extended;
        }
        stream.seen = true;
        stream.msg.extend_from_slice(&b[pos..pos + data_len]);
        stream.remaining = remaining - data_len as u32;

        let done = stream.remaining == 0;
        let msg = done.then(|| RtmpMessage {
            header,
            payload: stream.msg.split().freeze(),
        });
        self.buf.skip(pos + data_len);
        Ok(Some(msg))
    }
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

fn put_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    if csid < 64 {
        buf.put_u8((fmt << 6) | csid as u8);
    } else if csid < 64 + 256 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        let id = csid - 64;
        buf.put_u8((fmt << 6) | 1);
        buf.put_u8(id as u8);
        buf.put_u8((id >> 8) as u8);
    }
}

/// Split `msg` into chunks of at most `chunk_size` payload bytes.
pub fn pack_message(msg: &RtmpMessage, chunk_size: u32) -> Bytes {
    let h = &msg.header;
    let chunk_size = chunk_size.max(1) as usize;
    let extended = h.timestamp_abs >= EXTENDED_TIMESTAMP;
    let chunks = msg.payload.len().div_ceil(chunk_size).max(1);
    let mut buf = BytesMut::with_capacity(msg.payload.len() + 16 + chunks * 8);

    put_basic_header(&mut buf, 0, h.csid);
    put_u24(&mut buf, h.timestamp_abs.min(EXTENDED_TIMESTAMP));
    put_u24(&mut buf, msg.payload.len() as u32);
    buf.put_u8(h.msg_type_id);
    buf.put_u32_le(h.msg_stream_id);
    if extended {
        buf.put_u32(h.timestamp_abs);
    }

    for (i, piece) in msg.payload.chunks(chunk_size).enumerate() {
        if i > 0 {
            put_basic_header(&mut buf, 3, h.csid);
            if extended {
                buf.put_u32(h.timestamp_abs);
            }
        }
        buf.put_slice(piece);
    }
    buf.freeze()
}
