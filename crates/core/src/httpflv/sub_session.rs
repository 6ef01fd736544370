use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::flv::{FLV_HEADER, FlvTag};
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::rtmp::RtmpMessage;
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::transport::spawn_write_loop;
use crate::url::parse_httpflv_url;

const MAX_REQUEST_HEAD_SIZE: usize = 8 * 1024;

/// Request line and headers of the player's GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestHead {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.split("\r\n");
        let first = lines.next().unwrap_or_default();
        let mut parts = first.split_whitespace();
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::invalid(ProtocolErrorKind::InvalidRequestLine));
        };
        if !version.starts_with("HTTP/") {
            return Err(Error::invalid(ProtocolErrorKind::InvalidRequestLine));
        }
        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (k, v) = line
                .split_once(':')
                .ok_or(Error::invalid(ProtocolErrorKind::InvalidHeader))?;
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One HTTP-FLV player: answers `GET /app/stream.flv` and then streams FLV
/// tags over the same connection until either side closes it.
pub struct SubSession {
    info: SessionInfo,
    runtime: Runtime,
    head: HttpRequestHead,
    writer: mpsc::Sender<Bytes>,
    header_sent: Mutex<bool>,
    closer: Arc<Closer>,
}

impl SubSession {
    /// Read the request head from `stream` and build the session. Nothing
    /// is answered yet; the server does that once the observer accepted.
    pub(crate) async fn accept(
        mut stream: TcpStream,
        remote: SocketAddr,
        runtime: Runtime,
    ) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let config = runtime.config.clone();
        let head = tokio::time::timeout(config.handshake_timeout, read_request_head(&mut stream))
            .await
            .map_err(|_| Error::Timeout("http-flv request"))??;

        if head.method != "GET" {
            write_status(&mut stream, 405, "Method Not Allowed").await;
            return Err(Error::invalid(ProtocolErrorKind::InvalidRequestLine));
        }
        let host = match head.header("Host") {
            Some(h) => h.to_string(),
            None => stream.local_addr()?.to_string(),
        };
        let url = match parse_httpflv_url(&format!("http://{host}{}", head.uri), false) {
            Ok(u) => u,
            Err(e) => {
                write_status(&mut stream, 404, "Not Found").await;
                return Err(e);
            }
        };

        let info = SessionInfo::new(runtime.ids.next(prefix::HTTPFLV_SUB), Protocol::HttpFlv, SessionRole::Sub);
        info.stat().set_remote_addr(remote.to_string());
        info.set_url(url);
        let closer = Arc::new(Closer::new());
        let (read_half, write_half) = stream.into_split();
        let writer = spawn_write_loop(
            write_half,
            config.merge_write_threshold,
            config.write_channel_capacity,
            info.stat().clone(),
            closer.clone(),
        );
        tracing::info!(session = %info.unique_key(), %remote, uri = %head.uri, "http-flv request");
        let session = Arc::new(Self {
            info,
            runtime,
            head,
            writer,
            header_sent: Mutex::new(false),
            closer,
        });
        Ok((session, read_half))
    }

    pub fn request(&self) -> &HttpRequestHead {
        &self.head
    }

    pub(crate) fn closer(&self) -> Arc<Closer> {
        self.closer.clone()
    }

    /// Queue `200 OK` and the FLV file header unless already queued. The
    /// first tag written queues them implicitly.
    pub fn write_response_header(&self) -> Result<()> {
        let mut sent = self.header_sent.lock();
        if !*sent {
            self.try_queue(self.response_header())?;
            *sent = true;
        }
        Ok(())
    }

    fn response_header(&self) -> Bytes {
        let head = format!(
            "HTTP/1.1 200 OK\r\n\
             Server: {}\r\n\
             Cache-Control: no-cache\r\n\
             Content-Type: video/x-flv\r\n\
             Connection: close\r\n\
             Expires: -1\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Pragma: no-cache\r\n\r\n",
            self.runtime.config.library_tag()
        );
        let mut b = BytesMut::with_capacity(head.len() + FLV_HEADER.len());
        b.extend_from_slice(head.as_bytes());
        b.extend_from_slice(&FLV_HEADER);
        b.freeze()
    }

    /// Answer 404 if nothing was answered yet.
    pub(crate) fn write_not_found(&self) {
        let mut sent = self.header_sent.lock();
        if *sent {
            return;
        }
        *sent = true;
        let resp = "HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
        if self.try_queue(Bytes::from_static(resp.as_bytes())).is_err() {
            tracing::debug!(session = %self.unique_key(), "404 not sent");
        }
    }

    /// Queue an RTMP audio, video or metadata message as an FLV tag. Other
    /// message types are ignored. Never blocks: a full queue is
    /// [`Error::ResourceExhausted`].
    pub fn write_rtmp_message(&self, msg: &RtmpMessage) -> Result<()> {
        match FlvTag::from_rtmp(msg) {
            Some(tag) => self.write_raw(tag.pack()),
            None => Ok(()),
        }
    }

    /// Queue an already packed tag.
    pub fn write_raw(&self, b: Bytes) -> Result<()> {
        self.write_response_header()?;
        self.try_queue(b)
    }

    fn try_queue(&self, b: Bytes) -> Result<()> {
        self.writer.try_send(b).map_err(|e| match e {
            TrySendError::Full(_) => {
                Error::ResourceExhausted(format!("{} write queue full", self.unique_key()))
            }
            TrySendError::Closed(_) => Error::TransportClosed,
        })
    }

    /// Wait for the player to go away. Players send nothing after the
    /// request, so any read result but data ends the session.
    pub(crate) async fn run_loop(&self, mut reader: OwnedReadHalf) -> Result<()> {
        let mut buf = [0u8; 1024];
        let result = loop {
            tokio::select! {
                _ = self.closer.closed() => break Ok(()),
                r = reader.read(&mut buf) => match r {
                    Ok(0) => break Err(Error::TransportClosed),
                    Ok(n) => self.info.stat().add_read_bytes(n),
                    Err(e) => break Err(e.into()),
                },
            }
        };
        self.closer.close();
        tracing::info!(session = %self.unique_key(), "http-flv session closed");
        result
    }

    pub fn dispose(&self) {
        if self.closer.close() {
            tracing::info!(session = %self.unique_key(), "http-flv session disposed");
        }
    }
}

impl Session for SubSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn stream_name(&self) -> String {
        self.info
            .url_context()
            .map(|u| u.last_item_of_path.trim_end_matches(".flv").to_string())
            .unwrap_or_default()
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Result<HttpRequestHead> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let raw = std::str::from_utf8(&buf[..end])
                .map_err(|_| Error::invalid(ProtocolErrorKind::InvalidRequestLine))?;
            return HttpRequestHead::parse(raw);
        }
        if buf.len() >= MAX_REQUEST_HEAD_SIZE {
            return Err(Error::ResourceExhausted("http request head too large".to_string()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::TransportClosed);
        }
    }
}

fn find_head_end(b: &[u8]) -> Option<usize> {
    b.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

async fn write_status(stream: &mut TcpStream, code: u16, reason: &str) {
    let resp = format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    if let Err(e) = stream.write_all(resp.as_bytes()).await {
        tracing::debug!(error = %e, code, "status not sent");
    }
}
