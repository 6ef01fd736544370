//! Framing of one RTSP connection's inbound byte stream.
//!
//! Text messages and interleaved binary frames share the connection
//! (RFC 2326 §10.12). The first byte decides: `$` (0x24) starts a
//! binary frame, anything else a request or response.
//!
//! ```text
//! +------+---------+----------------+----------------+
//! | 0x24 | channel | length (u16be) | length bytes   |
//! +------+---------+----------------+----------------+
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};

use super::{RtspRequest, RtspResponse};
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::session::SessionStat;

pub const INTERLEAVED_MAGIC: u8 = 0x24;

const INTERLEAVED_HEADER_SIZE: usize = 4;

/// Upper bound on a message's start line plus headers.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// One unit read from an RTSP connection.
#[derive(Debug)]
pub enum RtspFrame {
    Request(RtspRequest),
    Response(RtspResponse),
    Interleaved { channel: u8, payload: Bytes },
}

/// Splits the connection's bytes into [`RtspFrame`]s. A frame is taken
/// out of the buffer only once it is complete.
pub struct RtspCodec {
    stat: Arc<SessionStat>,
}

impl RtspCodec {
    pub fn new(stat: Arc<SessionStat>) -> Self {
        Self { stat }
    }

    fn consume(&self, src: &mut BytesMut, n: usize) -> BytesMut {
        self.stat.add_read_bytes(n);
        src.split_to(n)
    }
}

impl Decoder for RtspCodec {
    type Item = RtspFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RtspFrame>> {
        // Blank lines between messages.
        let blank = src.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
        if blank > 0 {
            self.stat.add_read_bytes(blank);
            src.advance(blank);
        }
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        if first == INTERLEAVED_MAGIC {
            if src.len() < INTERLEAVED_HEADER_SIZE {
                return Ok(None);
            }
            let total = INTERLEAVED_HEADER_SIZE + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let frame = self.consume(src, total).freeze();
            return Ok(Some(RtspFrame::Interleaved {
                channel: frame[1],
                payload: frame.slice(INTERLEAVED_HEADER_SIZE..),
            }));
        }

        let Some(head_len) = head_len(src) else {
            if src.len() > MAX_HEAD_SIZE {
                return Err(Error::invalid(ProtocolErrorKind::InvalidHeader));
            }
            return Ok(None);
        };
        let head = std::str::from_utf8(&src[..head_len]).map_err(|_| Error::invalid(ProtocolErrorKind::InvalidHeader))?;
        let frame = if head.starts_with("RTSP/") {
            RtspFrame::Response(RtspResponse::parse(head)?)
        } else {
            RtspFrame::Request(RtspRequest::parse(head)?)
        };
        let body_len = match &frame {
            RtspFrame::Response(resp) => resp.content_length(),
            RtspFrame::Request(req) => req.content_length(),
            RtspFrame::Interleaved { .. } => 0,
        };
        if src.len() < head_len + body_len {
            src.reserve(head_len + body_len - src.len());
            return Ok(None);
        }

        let mut raw = self.consume(src, head_len + body_len);
        let body = String::from_utf8_lossy(&raw.split_off(head_len)).into_owned();
        Ok(Some(match frame {
            RtspFrame::Response(mut resp) => {
                resp.body = body;
                RtspFrame::Response(resp)
            }
            RtspFrame::Request(mut req) => {
                req.body = body;
                RtspFrame::Request(req)
            }
            interleaved => interleaved,
        }))
    }
}

/// Length of the head up to and including the empty line that ends it.
/// Accepts both CRLF and bare LF line endings.
fn head_len(b: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(i) = b[start..].iter().position(|c| *c == b'\n') {
        let line = &b[start..start + i];
        start += i + 1;
        if line.is_empty() || line == b"\r" {
            return Some(start);
        }
    }
    None
}

/// Inbound half of an RTSP connection.
///
/// [`read_frame`](Self::read_frame) is cancel safe: partial frames stay
/// buffered, so it may be raced in `select!` against timers.
pub struct FrameReader<R> {
    inner: FramedRead<R, RtspCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, stat: Arc<SessionStat>) -> Self {
        Self {
            inner: FramedRead::new(inner, RtspCodec::new(stat)),
        }
    }

    /// Read the next frame. End of stream yields [`Error::TransportClosed`].
    pub async fn read_frame(&mut self) -> Result<RtspFrame> {
        self.inner.next().await.unwrap_or(Err(Error::TransportClosed))
    }
}

/// Frame `data` for interleaved delivery on `channel`.
pub fn pack_interleaved(channel: u8, data: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(4 + data.len());
    b.put_u8(INTERLEAVED_MAGIC);
    b.put_u8(channel);
    b.put_u16(data.len() as u16);
    b.put_slice(data);
    b.freeze()
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::session::{Protocol, SessionRole};

    fn stat() -> Arc<SessionStat> {
        Arc::new(SessionStat::new("T".into(), Protocol::Rtsp, SessionRole::Pub))
    }

    #[tokio::test]
    async fn mixed_text_and_binary_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\r\nANNOUNCE rtsp://h/a RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nv=0\r\n");
        wire.extend_from_slice(&pack_interleaved(1, b"rtcp"));
        wire.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n");

        let stat = stat();
        let mut r = FrameReader::new(&wire[..], stat.clone());

        match r.read_frame().await.unwrap() {
            RtspFrame::Request(req) => {
                assert_eq!(req.method, "ANNOUNCE");
                assert_eq!(req.body, "v=0\r\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        match r.read_frame().await.unwrap() {
            RtspFrame::Interleaved { channel, payload } => {
                assert_eq!(channel, 1);
                assert_eq!(&payload[..], b"rtcp");
            }
            other => panic!("unexpected {other:?}"),
        }
        match r.read_frame().await.unwrap() {
            RtspFrame::Response(resp) => assert_eq!(resp.cseq(), Some("3")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            r.read_frame().await.unwrap_err().kind(),
            crate::error::ErrorKind::TransportClosed
        );
        assert_eq!(stat.read_bytes(), wire.len() as u64);
    }

    #[tokio::test]
    async fn truncated_binary_frame_is_an_error() {
        let wire = [INTERLEAVED_MAGIC, 0, 0, 10, 1, 2];
        let mut r = FrameReader::new(&wire[..], stat());
        assert!(r.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn frame_split_across_a_cancelled_read_survives() {
        let frame = pack_interleaved(0, &[0x80; 100]);
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut r = FrameReader::new(rx, stat());

        tx.write_all(&frame[..52]).await.unwrap();
        tokio::select! {
            _ = r.read_frame() => panic!("frame is incomplete"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
        tx.write_all(&frame[52..]).await.unwrap();
        tx.write_all(&pack_interleaved(1, b"rr")).await.unwrap();

        match r.read_frame().await.unwrap() {
            RtspFrame::Interleaved { channel, payload } => {
                assert_eq!(channel, 0);
                assert_eq!(payload, frame.slice(4..));
            }
            other => panic!("unexpected {other:?}"),
        }
        match r.read_frame().await.unwrap() {
            RtspFrame::Interleaved { channel, payload } => {
                assert_eq!(channel, 1);
                assert_eq!(&payload[..], b"rr");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn body_waits_for_content_length() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut r = FrameReader::new(rx, stat());

        tx.write_all(b"RTSP/1.0 200 OK\nCSeq: 4\nContent-Length: 6\n\nv=").await.unwrap();
        tokio::select! {
            _ = r.read_frame() => panic!("body is incomplete"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
        tx.write_all(b"0\r\nx").await.unwrap();
        match r.read_frame().await.unwrap() {
            RtspFrame::Response(resp) => {
                assert_eq!(resp.cseq(), Some("4"));
                assert_eq!(resp.body, "v=0\r\nx");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interleaved_header_layout() {
        let f = pack_interleaved(3, &[0xAA; 300]);
        assert_eq!(&f[..4], &[0x24, 3, 0x01, 0x2C]);
        assert_eq!(f.len(), 304);
    }
}
