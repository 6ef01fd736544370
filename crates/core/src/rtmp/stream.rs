use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::chunk::{ChunkComposer, pack_message};
use super::message::{self, parse_u32_body, parse_user_control};
use super::{DEFAULT_CHUNK_SIZE, RtmpMessage, csid, type_id, user_control};
use crate::error::{Error, Result};
use crate::session::SessionStat;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Reads messages off a connection and handles flow control on the way.
///
/// SetChunkSize, WindowAckSize, Ack, Abort and ping requests are consumed
/// here; acknowledgements and ping responses go out through `writer`.
/// Everything else is returned to the caller.
pub struct MessageReader<R> {
    inner: R,
    composer: ChunkComposer,
    read_buf: Box<[u8]>,
    stat: Arc<SessionStat>,
    writer: mpsc::Sender<Bytes>,
    peer_window_ack_size: u32,
    total_read: u64,
    last_ack: u64,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, stat: Arc<SessionStat>, writer: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner,
            composer: ChunkComposer::new(),
            read_buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
            stat,
            writer,
            peer_window_ack_size: 0,
            total_read: 0,
            last_ack: 0,
            idle_timeout: None,
        }
    }

    /// Fail reads with [`Error::Timeout`] once the connection has been
    /// silent for `timeout`. Any inbound bytes, flow control included,
    /// restart the clock.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout);
    }

    /// Next message that is not flow control. Cancel-safe.
    pub async fn read_message(&mut self) -> Result<RtmpMessage> {
        loop {
            while let Some(msg) = self.composer.next_message()? {
                if let Some(msg) = self.handle_control(msg)? {
                    return Ok(msg);
                }
            }
            let read = self.inner.read(&mut self.read_buf);
            let n = match self.idle_timeout {
                Some(t) => tokio::time::timeout(t, read)
                    .await
                    .map_err(|_| Error::Timeout("rtmp read"))??,
                None => read.await?,
            };
            if n == 0 {
                return Err(Error::TransportClosed);
            }
            self.stat.add_read_bytes(n);
            self.composer.feed(&self.read_buf[..n]);
            self.total_read += n as u64;
            self.maybe_ack();
        }
    }

    fn handle_control(&mut self, msg: RtmpMessage) -> Result<Option<RtmpMessage>> {
        match msg.header.msg_type_id {
            type_id::SET_CHUNK_SIZE => {
                let size = parse_u32_body(&msg.payload)?;
                tracing::debug!(size, "peer chunk size");
                self.composer.set_peer_chunk_size(size)?;
            }
            type_id::WINDOW_ACK_SIZE => {
                self.peer_window_ack_size = parse_u32_body(&msg.payload)?;
                tracing::debug!(size = self.peer_window_ack_size, "peer window ack size");
                self.maybe_ack();
            }
            type_id::ACK | type_id::ABORT | type_id::SET_PEER_BANDWIDTH => {
                tracing::trace!(type_id = msg.header.msg_type_id, "control message");
            }
            type_id::USER_CONTROL => {
                let (event, value) = parse_user_control(&msg.payload)?;
                if event == user_control::PING_REQUEST {
                    self.send(&message::ping_response(value));
                } else {
                    tracing::trace!(event, value, "user control");
                }
            }
            _ => return Ok(Some(msg)),
        }
        Ok(None)
    }

    fn maybe_ack(&mut self) {
        let window = self.peer_window_ack_size as u64;
        if window == 0 || self.total_read - self.last_ack < window {
            return;
        }
        self.last_ack = self.total_read;
        self.send(&message::ack(self.total_read as u32));
    }

    fn send(&self, msg: &RtmpMessage) {
        if self.writer.try_send(pack_message(msg, DEFAULT_CHUNK_SIZE)).is_err() {
            tracing::warn!(type_id = msg.header.msg_type_id, "control reply dropped");
        }
    }
}

/// Queue an audio, video or metadata message on `writer` without waiting,
/// re-stamped for `stream_id` on the chunk stream of its kind.
///
/// A full queue is [`Error::ResourceExhausted`].
pub(crate) fn queue_media_message(
    writer: &mpsc::Sender<Bytes>,
    msg: &RtmpMessage,
    stream_id: u32,
    chunk_size: u32,
) -> Result<()> {
    let mut out = msg.clone();
    out.header.msg_stream_id = stream_id;
    out.header.csid = match out.header.msg_type_id {
        type_id::AUDIO => csid::AUDIO,
        type_id::VIDEO => csid::VIDEO,
        _ => csid::OVER_STREAM,
    };
    match writer.try_send(pack_message(&out, chunk_size)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(Error::ResourceExhausted("rtmp write queue full".into())),
        Err(TrySendError::Closed(_)) => Err(Error::TransportClosed),
    }
}
