//! Client command session shared by [`PullSession`](super::PullSession) and
//! [`PushSession`](super::PushSession).
//!
//! Negotiation runs sequentially on the caller's task: each request waits
//! for the response with the same CSeq, answering one 401 with credentials
//! from the URL. After PLAY/RECORD the connection moves to a background
//! task that routes interleaved frames and sends keepalives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::auth::Challenge;
use super::channel::MediaChannel;
use super::reader::{FrameReader, RtspFrame};
use super::transport::{LowerTransport, TransportHeader};
use super::{RtspRequest, RtspResponse, header, method};
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::session::{Closer, SessionStat};
use crate::transport::spawn_write_loop;
use crate::url::UrlContext;

/// Callback for interleaved frames: `(channel, payload)`.
pub(crate) type InterleavedHandler = Arc<dyn Fn(u8, Bytes) + Send + Sync>;

/// State that outlives negotiation and is needed to build requests from
/// any task, including TEARDOWN on dispose.
pub(crate) struct ClientShared {
    url: UrlContext,
    user_agent: String,
    cseq: AtomicU32,
    session_id: Mutex<Option<String>>,
    challenge: Mutex<Option<Challenge>>,
    writer: mpsc::Sender<Bytes>,
}

impl ClientShared {
    /// URI used in request lines: the URL without credentials.
    pub(crate) fn base_uri(&self) -> &str {
        &self.url.raw_url_without_user_info
    }

    pub(crate) fn build_request(&self, method: &str, uri: &str) -> RtspRequest {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut req = RtspRequest::new(method, uri)
            .add_header(header::CSEQ, &cseq.to_string())
            .add_header(header::USER_AGENT, &self.user_agent);
        if let Some(id) = self.session_id.lock().as_deref() {
            req = req.add_header(header::SESSION, id);
        }
        let challenge = self.challenge.lock().clone();
        if let Some(c) = challenge {
            let value = c.authorization(&self.url.username, &self.url.password, method, uri);
            req = req.add_header(header::AUTHORIZATION, &value);
        }
        req
    }

    async fn send(&self, req: &RtspRequest) -> Result<()> {
        self.writer
            .send(Bytes::from(req.serialize()))
            .await
            .map_err(|_| Error::TransportClosed)
    }

    /// Queue TEARDOWN without waiting for the answer.
    pub(crate) fn send_teardown(&self) {
        if self.session_id.lock().is_none() {
            return;
        }
        let req = self.build_request(method::TEARDOWN, self.base_uri());
        if self.writer.try_send(Bytes::from(req.serialize())).is_err() {
            tracing::debug!("teardown not queued");
        }
    }

    pub(crate) fn writer(&self) -> mpsc::Sender<Bytes> {
        self.writer.clone()
    }
}

pub(crate) struct ClientCommandSession {
    unique_key: String,
    runtime: Runtime,
    shared: Arc<ClientShared>,
    reader: FrameReader<OwnedReadHalf>,
    server_addr: SocketAddr,
    public_methods: String,
    closer: Arc<Closer>,
}

impl ClientCommandSession {
    pub(crate) async fn connect(
        unique_key: &str,
        runtime: Runtime,
        url: UrlContext,
        stat: Arc<SessionStat>,
        closer: Arc<Closer>,
    ) -> Result<Self> {
        let config = runtime.config.clone();
        let stream = tokio::time::timeout(
            config.handshake_timeout,
            TcpStream::connect((url.host.as_str(), url.port)),
        )
        .await
        .map_err(|_| Error::Timeout("rtsp connect"))??;
        stream.set_nodelay(true)?;
        let server_addr = stream.peer_addr()?;
        stat.set_remote_addr(server_addr.to_string());
        tracing::info!(session = %unique_key, remote = %server_addr, "rtsp connected");

        let (read_half, write_half) = stream.into_split();
        let writer = spawn_write_loop(
            write_half,
            config.merge_write_threshold,
            config.write_channel_capacity,
            stat.clone(),
            closer.clone(),
        );
        Ok(Self {
            unique_key: unique_key.to_string(),
            shared: Arc::new(ClientShared {
                url,
                user_agent: config.library_tag(),
                cseq: AtomicU32::new(0),
                session_id: Mutex::new(None),
                challenge: Mutex::new(None),
                writer,
            }),
            runtime,
            reader: FrameReader::new(read_half, stat),
            server_addr,
            public_methods: String::new(),
            closer,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    /// Send a request built by `build` and wait for its response.
    ///
    /// A 401 is answered once with credentials from the URL; a second 401
    /// is [`Error::AuthFailed`]. Interleaved frames that arrive meanwhile
    /// go to `on_interleaved`.
    pub(crate) async fn request(
        &mut self,
        method: &str,
        uri: &str,
        extra_headers: &[(&str, &str)],
        body: Option<String>,
        on_interleaved: Option<&InterleavedHandler>,
    ) -> Result<RtspResponse> {
        let mut retried = false;
        loop {
            let mut req = self.shared.build_request(method, uri);
            for (name, value) in extra_headers {
                req = req.add_header(name, value);
            }
            if let Some(body) = &body {
                req = req.with_body(body.clone());
            }
            let resp = self.round_trip(&req, on_interleaved).await?;

            if resp.status_code != 401 {
                return resp.ensure_ok();
            }
            if retried {
                return Err(Error::AuthFailed);
            }
            let challenge = Challenge::select(
                resp.headers
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case(header::WWW_AUTHENTICATE))
                    .map(|(_, v)| v.as_str()),
            );
            let Some(challenge) = challenge else {
                return Err(Error::AuthRequired);
            };
            if self.shared.url.username.is_empty() {
                return Err(Error::AuthRequired);
            }
            tracing::debug!(session = %self.unique_key, method, scheme = ?challenge.scheme, "retrying with credentials");
            *self.shared.challenge.lock() = Some(challenge);
            retried = true;
        }
    }

    async fn round_trip(
        &mut self,
        req: &RtspRequest,
        on_interleaved: Option<&InterleavedHandler>,
    ) -> Result<RtspResponse> {
        let cseq = req.cseq().unwrap_or_default().to_string();
        tracing::debug!(session = %self.unique_key, method = %req.method, uri = %req.uri, %cseq, "request");
        self.shared.send(req).await?;

        let timeout = self.runtime.config.command_timeout;
        let closer = self.closer.clone();
        let wait = async {
            loop {
                match self.reader.read_frame().await? {
                    RtspFrame::Response(resp) if resp.cseq() == Some(cseq.as_str()) => {
                        return Ok::<_, Error>(resp);
                    }
                    RtspFrame::Response(resp) => {
                        tracing::debug!(session = %self.unique_key, cseq = ?resp.cseq(), "stale response");
                    }
                    RtspFrame::Interleaved { channel, payload } => {
                        if let Some(handler) = on_interleaved {
                            handler(channel, payload);
                        }
                    }
                    RtspFrame::Request(r) => {
                        tracing::debug!(session = %self.unique_key, method = %r.method, "ignoring server request");
                    }
                }
            }
        };
        let resp = tokio::select! {
            _ = closer.closed() => return Err(Error::TransportClosed),
            r = tokio::time::timeout(timeout, wait) => {
                r.map_err(|_| Error::Timeout("rtsp response"))??
            }
        };
        tracing::debug!(session = %self.unique_key, status = resp.status_code, %cseq, "response");
        Ok(resp)
    }

    pub(crate) async fn options(&mut self) -> Result<()> {
        let uri = self.shared.base_uri().to_string();
        let resp = self.request(method::OPTIONS, &uri, &[], None, None).await?;
        self.public_methods = resp.get_header(header::PUBLIC).unwrap_or_default().to_string();
        Ok(())
    }

    /// SETUP one medium. UDP binds a port pair from the pool and points it
    /// at the server's ports; TCP uses `interleaved_base`/`+1`.
    pub(crate) async fn setup(
        &mut self,
        uri: &str,
        over_tcp: bool,
        interleaved_base: u8,
        record: bool,
    ) -> Result<MediaChannel> {
        if over_tcp {
            let transport = TransportHeader::client_tcp(interleaved_base, record).to_header_value();
            let resp = self
                .request(method::SETUP, uri, &[(header::TRANSPORT, &transport)], None, None)
                .await?;
            self.store_session_id(&resp);
            let reply = reply_transport(&resp)?;
            let (rtp_channel, rtcp_channel) = reply
                .interleaved
                .unwrap_or((interleaved_base, interleaved_base.wrapping_add(1)));
            return Ok(MediaChannel::Interleaved {
                writer: self.shared.writer(),
                rtp_channel,
                rtcp_channel,
            });
        }

        let (rtp, rtcp) = self.runtime.ports.acquire_pair().await?;
        let transport = TransportHeader::client_udp(rtp.local_port(), record).to_header_value();
        let resp = self
            .request(method::SETUP, uri, &[(header::TRANSPORT, &transport)], None, None)
            .await?;
        self.store_session_id(&resp);
        let reply = reply_transport(&resp)?;
        if reply.lower != LowerTransport::Udp {
            return Err(Error::invalid(ProtocolErrorKind::InvalidTransport));
        }
        let (server_rtp, server_rtcp) = reply
            .server_port
            .ok_or(Error::invalid(ProtocolErrorKind::InvalidTransport))?;
        rtp.set_remote(SocketAddr::new(self.server_addr.ip(), server_rtp));
        rtcp.set_remote(SocketAddr::new(self.server_addr.ip(), server_rtcp));
        Ok(MediaChannel::Udp {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
        })
    }

    fn store_session_id(&self, resp: &RtspResponse) {
        if let Some(value) = resp.get_header(header::SESSION) {
            let id = value.split(';').next().unwrap_or_default().trim().to_string();
            *self.shared.session_id.lock() = Some(id);
        }
    }

    fn keepalive_method(&self) -> &'static str {
        if self.public_methods.contains(method::GET_PARAMETER) {
            method::GET_PARAMETER
        } else {
            method::OPTIONS
        }
    }

    /// Move the connection to a background task. Its end, for whatever
    /// reason, finishes `closer`. With `read_av_timeout` set, a gap that
    /// long between interleaved frames ends it with [`Error::Timeout`].
    pub(crate) fn spawn_run_loop(mut self, on_interleaved: InterleavedHandler, read_av_timeout: Option<Duration>) {
        tokio::spawn(async move {
            let closer = self.closer.clone();
            let result = self.run_loop(on_interleaved, read_av_timeout).await;
            match result {
                Ok(()) => closer.finish(Error::TransportClosed),
                Err(e) => {
                    tracing::warn!(session = %self.unique_key, error = %e, "rtsp client session ended");
                    closer.finish(e);
                }
            }
        });
    }

    async fn run_loop(&mut self, on_interleaved: InterleavedHandler, read_av_timeout: Option<Duration>) -> Result<()> {
        let keepalive_method = self.keepalive_method();
        let mut keepalive = tokio::time::interval(self.runtime.config.rtsp_keepalive_interval);
        keepalive.tick().await;
        let av_timeout = read_av_timeout.unwrap_or_default();
        let idle = tokio::time::sleep(av_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = self.closer.closed() => return Ok(()),
                _ = &mut idle, if read_av_timeout.is_some() => return Err(Error::Timeout("rtsp read av")),
                frame = self.reader.read_frame() => match frame? {
                    RtspFrame::Interleaved { channel, payload } => {
                        idle.as_mut().reset(Instant::now() + av_timeout);
                        on_interleaved(channel, payload);
                    }
                    RtspFrame::Response(resp) if !resp.is_ok() => {
                        tracing::warn!(session = %self.unique_key, status = resp.status_code, "keepalive rejected");
                    }
                    RtspFrame::Response(_) => {}
                    RtspFrame::Request(r) => {
                        tracing::debug!(session = %self.unique_key, method = %r.method, "ignoring server request");
                    }
                },
                _ = keepalive.tick() => {
                    let req = self.shared.build_request(keepalive_method, self.shared.base_uri());
                    tracing::trace!(session = %self.unique_key, method = keepalive_method, "keepalive");
                    self.shared.send(&req).await?;
                }
            }
        }
    }
}

fn reply_transport(resp: &RtspResponse) -> Result<TransportHeader> {
    let value = resp
        .get_header(header::TRANSPORT)
        .ok_or(Error::invalid(ProtocolErrorKind::MissingHeader(header::TRANSPORT)))?;
    TransportHeader::parse(value)
}
