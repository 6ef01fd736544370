use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::auth::DigestAuthenticator;
use super::channel::MediaChannel;
use super::pub_session::PubSession;
use super::reader::{FrameReader, RtspFrame};
use super::server::RtspServerObserver;
use super::sub_session::SubSession;
use super::transport::{LowerTransport, TransportHeader};
use super::{PUBLIC_METHODS, RtspRequest, RtspResponse, header, method};
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::transport::spawn_write_loop;
use crate::url::parse_rtsp_url;

/// Target of one interleaved channel negotiated on this connection.
#[derive(Debug, Clone, Copy)]
struct InterleavedTarget {
    is_rtcp: bool,
}

/// One accepted RTSP connection.
///
/// Answers requests in arrival order and, once a pub or sub session has
/// been negotiated, routes interleaved frames to it. The connection ends
/// on TEARDOWN, on a transport error, or when its closer fires; the data
/// session created on it is disposed with it.
pub(crate) struct ServerCommandSession {
    info: SessionInfo,
    runtime: Runtime,
    observer: Arc<dyn RtspServerObserver>,
    auth: Option<Arc<DigestAuthenticator>>,
    remote: SocketAddr,
    reader: FrameReader<OwnedReadHalf>,
    writer: mpsc::Sender<Bytes>,
    closer: Arc<Closer>,
    session_id: String,
    pub_session: Option<Arc<PubSession>>,
    sub_session: Option<Arc<SubSession>>,
    interleaved: HashMap<u8, InterleavedTarget>,
    /// RECORD accepted with media interleaved on this connection.
    recording_interleaved: bool,
}

impl ServerCommandSession {
    pub(crate) fn new(
        stream: TcpStream,
        remote: SocketAddr,
        runtime: Runtime,
        observer: Arc<dyn RtspServerObserver>,
        auth: Option<Arc<DigestAuthenticator>>,
    ) -> Self {
        let info = SessionInfo::new(
            runtime.ids.next(prefix::RTSP_SERVER_COMMAND),
            Protocol::Rtsp,
            SessionRole::PubSub,
        );
        info.stat().set_remote_addr(remote.to_string());
        let closer = Arc::new(Closer::new());
        let (read_half, write_half) = stream.into_split();
        let writer = spawn_write_loop(
            write_half,
            runtime.config.merge_write_threshold,
            runtime.config.write_channel_capacity,
            info.stat().clone(),
            closer.clone(),
        );
        Self {
            reader: FrameReader::new(read_half, info.stat().clone()),
            info,
            runtime,
            observer,
            auth,
            remote,
            writer,
            closer,
            session_id: format!("{:08X}", rand::random::<u32>()),
            pub_session: None,
            sub_session: None,
            interleaved: HashMap::new(),
            recording_interleaved: false,
        }
    }

    pub(crate) fn closer(&self) -> Arc<Closer> {
        self.closer.clone()
    }

    /// Serve the connection until it ends; returns why it ended.
    pub(crate) async fn run_loop(mut self) -> Result<()> {
        tracing::info!(session = %self.unique_key(), remote = %self.remote, "rtsp connection accepted");
        self.observer
            .on_new_rtsp_session_connect(self.unique_key(), self.remote);

        let result = self.serve().await;
        self.dispose();
        match &result {
            Ok(()) => tracing::info!(session = %self.unique_key(), "rtsp connection closed"),
            Err(e) => {
                tracing::info!(session = %self.unique_key(), error = %e, "rtsp connection closed")
            }
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let av_timeout = self.runtime.config.read_av_timeout;
        let idle = tokio::time::sleep(av_timeout);
        tokio::pin!(idle);

        loop {
            let frame = tokio::select! {
                _ = self.closer.closed() => return Ok(()),
                _ = &mut idle, if self.recording_interleaved => return Err(Error::Timeout("rtsp read av")),
                frame = self.reader.read_frame() => frame,
            };
            match frame {
                Ok(RtspFrame::Request(req)) => {
                    let was_recording = self.recording_interleaved;
                    if !self.handle_request(req).await? {
                        return Ok(());
                    }
                    if !was_recording && self.recording_interleaved {
                        idle.as_mut().reset(Instant::now() + av_timeout);
                    }
                }
                Ok(RtspFrame::Interleaved { channel, payload }) => {
                    idle.as_mut().reset(Instant::now() + av_timeout);
                    self.handle_interleaved(channel, payload);
                }
                Ok(RtspFrame::Response(resp)) => {
                    tracing::debug!(session = %self.unique_key(), status = resp.status_code, "ignoring response from client");
                }
                Err(Error::TransportClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Answer one request; `false` ends the connection.
    async fn handle_request(&mut self, req: RtspRequest) -> Result<bool> {
        let cseq = req.cseq().unwrap_or("0").to_string();
        tracing::debug!(session = %self.unique_key(), method = %req.method, uri = %req.uri, %cseq, "request");

        if let Some(auth) = &self.auth
            && req.method != method::OPTIONS
            && !auth.verify(&req.method, req.get_header(header::AUTHORIZATION))
        {
            let challenge = auth.challenge();
            tracing::debug!(session = %self.unique_key(), method = %req.method, "authorization required");
            self.send_response(&cseq, RtspResponse::unauthorized().add_header(header::WWW_AUTHENTICATE, &challenge))
                .await?;
            return Ok(true);
        }

        let response = match req.method.as_str() {
            method::OPTIONS => RtspResponse::ok().add_header(header::PUBLIC, PUBLIC_METHODS),
            method::ANNOUNCE => self.handle_announce(&req),
            method::DESCRIBE => self.handle_describe(&req),
            method::SETUP => self.handle_setup(&req).await,
            method::RECORD => self.handle_record(),
            method::PLAY => self.handle_play(),
            method::TEARDOWN => RtspResponse::ok(),
            method::GET_PARAMETER => RtspResponse::ok(),
            _ => {
                tracing::warn!(session = %self.unique_key(), method = %req.method, %cseq, "unsupported rtsp method");
                RtspResponse::not_implemented()
            }
        };
        let ok = response.is_ok();
        self.send_response(&cseq, response).await?;

        match req.method.as_str() {
            method::TEARDOWN => return Ok(false),
            method::PLAY if ok => return Ok(self.start_play()),
            _ => {}
        }
        Ok(true)
    }

    async fn send_response(&self, cseq: &str, response: RtspResponse) -> Result<()> {
        let response = response
            .add_header(header::CSEQ, cseq)
            .add_header(header::SERVER, &self.runtime.config.library_tag());
        tracing::debug!(session = %self.unique_key(), status = response.status_code, %cseq, "response");
        self.writer
            .send(Bytes::from(response.serialize()))
            .await
            .map_err(|_| Error::TransportClosed)
    }

    fn handle_announce(&mut self, req: &RtspRequest) -> RtspResponse {
        if self.pub_session.is_some() || self.sub_session.is_some() {
            return RtspResponse::method_not_valid();
        }
        let url = match parse_rtsp_url(&req.uri) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), uri = %req.uri, error = %e, "bad announce uri");
                return RtspResponse::bad_request();
            }
        };
        let sdp = match SdpLogicContext::parse(&req.body) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), error = %e, "bad announce sdp");
                return RtspResponse::bad_request();
            }
        };

        let session = Arc::new(PubSession::new(&self.runtime, url, sdp, self.closer.clone()));
        if let Err(e) = self.observer.on_new_rtsp_pub_session(&session) {
            tracing::warn!(session = %session.unique_key(), error = %e, "pub session rejected");
            return RtspResponse::not_acceptable();
        }
        tracing::info!(session = %session.unique_key(), url = %session.url(), "rtsp pub session created");
        self.pub_session = Some(session);
        RtspResponse::ok()
    }

    fn handle_describe(&mut self, req: &RtspRequest) -> RtspResponse {
        if self.pub_session.is_some() {
            return RtspResponse::method_not_valid();
        }
        let url = match parse_rtsp_url(&req.uri) {
            Ok(u) => u,
            Err(_) => return RtspResponse::bad_request(),
        };
        let session = Arc::new(SubSession::new(&self.runtime, url, self.closer.clone()));
        let Some(raw_sdp) = self.observer.on_new_rtsp_sub_session_describe(&session) else {
            tracing::info!(session = %session.unique_key(), url = %session.url(), "no stream to describe");
            return RtspResponse::not_found();
        };
        let sdp = match SdpLogicContext::parse(&raw_sdp) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(session = %session.unique_key(), error = %e, "observer returned unusable sdp");
                return RtspResponse::internal_error();
            }
        };
        session.init_with_sdp(sdp);
        tracing::info!(session = %session.unique_key(), url = %session.url(), "rtsp sub session created");
        let content_base = format!("{}/", req.uri.trim_end_matches('/'));
        // A repeated DESCRIBE replaces the previous sub session.
        if let Some(old) = self.sub_session.replace(session) {
            dispose_sub(&*self.observer, &old);
        }
        RtspResponse::ok()
            .add_header(header::CONTENT_TYPE, "application/sdp")
            .add_header(header::CONTENT_BASE, &content_base)
            .with_body(raw_sdp)
    }

    async fn handle_setup(&mut self, req: &RtspRequest) -> RtspResponse {
        let Some(transport) = req.get_header(header::TRANSPORT) else {
            return RtspResponse::bad_request();
        };
        let requested = match TransportHeader::parse(transport) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), transport, error = %e, "bad transport");
                return RtspResponse::unsupported_transport();
            }
        };

        let (sdp, base_url) = match (&self.pub_session, &self.sub_session) {
            (Some(p), _) => (p.sdp(), p.url()),
            (None, Some(s)) => (s.sdp(), s.url()),
            (None, None) => return RtspResponse::method_not_valid(),
        };
        let Some(sdp) = sdp else {
            return RtspResponse::method_not_valid();
        };
        let Some(is_audio) = match_medium(&sdp, &base_url, &req.uri) else {
            tracing::warn!(session = %self.unique_key(), uri = %req.uri, "setup uri matches no media");
            return RtspResponse::not_found();
        };

        let (channel, reply) = match requested.lower {
            LowerTransport::Udp => {
                let Some((client_rtp, client_rtcp)) = requested.client_port else {
                    return RtspResponse::unsupported_transport();
                };
                let (rtp, rtcp) = match self.runtime.ports.acquire_pair().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(session = %self.unique_key(), error = %e, "no udp ports for setup");
                        return RtspResponse::internal_error();
                    }
                };
                rtp.set_remote(SocketAddr::new(self.remote.ip(), client_rtp));
                rtcp.set_remote(SocketAddr::new(self.remote.ip(), client_rtcp));
                let reply = requested
                    .clone()
                    .with_server_port(rtp.local_port(), rtcp.local_port());
                (
                    MediaChannel::Udp {
                        rtp: Arc::new(rtp),
                        rtcp: Arc::new(rtcp),
                    },
                    reply,
                )
            }
            LowerTransport::Tcp => {
                let (rtp_channel, rtcp_channel) = requested.interleaved.unwrap_or_else(|| {
                    let next = self.interleaved.keys().max().map_or(0, |m| m.saturating_add(1) & !1);
                    (next, next + 1)
                });
                self.interleaved
                    .insert(rtp_channel, InterleavedTarget { is_rtcp: false });
                self.interleaved
                    .insert(rtcp_channel, InterleavedTarget { is_rtcp: true });
                let reply = requested.clone().with_interleaved(rtp_channel, rtcp_channel);
                (
                    MediaChannel::Interleaved {
                        writer: self.writer.clone(),
                        rtp_channel,
                        rtcp_channel,
                    },
                    reply,
                )
            }
        };

        tracing::debug!(
            session = %self.unique_key(),
            audio = is_audio,
            transport = %reply.to_header_value(),
            "media set up"
        );
        if let Some(p) = &self.pub_session {
            p.base().set_channel(is_audio, channel);
        } else if let Some(s) = &self.sub_session {
            s.base().set_channel(is_audio, channel);
        }

        RtspResponse::ok()
            .add_header(header::TRANSPORT, &reply.to_header_value())
            .add_header(header::SESSION, &self.session_id)
    }

    fn handle_record(&mut self) -> RtspResponse {
        let Some(session) = &self.pub_session else {
            return RtspResponse::method_not_valid();
        };
        session.base().spawn_udp_readers();
        self.recording_interleaved = !self.interleaved.is_empty();
        tracing::info!(session = %session.unique_key(), tcp = self.recording_interleaved, "rtsp record started");
        RtspResponse::ok().add_header(header::SESSION, &self.session_id)
    }

    fn handle_play(&mut self) -> RtspResponse {
        if self.sub_session.is_none() {
            return RtspResponse::method_not_valid();
        }
        RtspResponse::ok()
            .add_header(header::RANGE, "npt=0.000-")
            .add_header(header::SESSION, &self.session_id)
    }

    /// After the PLAY reply is queued, hand the sub session to the observer
    /// so no media can overtake the reply.
    fn start_play(&mut self) -> bool {
        let Some(session) = self.sub_session.clone() else {
            return true;
        };
        session.base().spawn_udp_readers();
        match self.observer.on_new_rtsp_sub_session_play(&session) {
            Ok(()) => {
                tracing::info!(session = %session.unique_key(), "rtsp play started");
                true
            }
            Err(e) => {
                tracing::warn!(session = %session.unique_key(), error = %e, "play rejected");
                false
            }
        }
    }

    fn handle_interleaved(&self, channel: u8, payload: Bytes) {
        let Some(target) = self.interleaved.get(&channel) else {
            tracing::trace!(session = %self.unique_key(), channel, "frame on unknown channel");
            return;
        };
        if let Some(p) = &self.pub_session {
            p.feed_interleaved(target.is_rtcp, payload);
        } else {
            tracing::trace!(session = %self.unique_key(), channel, len = payload.len(), "rtcp from player");
        }
    }

    fn dispose(&mut self) {
        self.closer.close();
        if let Some(p) = self.pub_session.take() {
            p.dispose();
            self.observer.on_del_rtsp_pub_session(&p);
        }
        if let Some(s) = self.sub_session.take() {
            dispose_sub(&*self.observer, &s);
        }
    }
}

fn dispose_sub(observer: &dyn RtspServerObserver, session: &Arc<SubSession>) {
    session.dispose();
    observer.on_del_rtsp_sub_session(session);
}

impl Session for ServerCommandSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}

/// Which medium a SETUP URI addresses: `Some(true)` for audio. The URI may
/// be the absolute control URI or end with the relative control.
fn match_medium(sdp: &SdpLogicContext, base_url: &str, uri: &str) -> Option<bool> {
    let uri = uri.trim_end_matches('/');
    let hits = |full: Option<String>, control: Option<&str>| {
        full.as_deref().map(|f| f.trim_end_matches('/')) == Some(uri)
            || control.is_some_and(|c| {
                let c = c.trim_start_matches('/');
                !c.is_empty() && c != "*" && uri.ends_with(&format!("/{c}"))
            })
    };
    if let Some(audio) = &sdp.audio
        && hits(sdp.audio_control_uri(base_url), audio.control.as_deref())
    {
        return Some(true);
    }
    if let Some(video) = &sdp.video
        && hits(sdp.video_control_uri(base_url), video.control.as_deref())
    {
        return Some(false);
    }
    match (sdp.has_audio(), sdp.has_video()) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::tests::FFMPEG_SDP;

    #[test]
    fn setup_uri_selects_medium() {
        let sdp = SdpLogicContext::parse(FFMPEG_SDP).unwrap();
        let base = "rtsp://127.0.0.1:5544/live/test";
        assert_eq!(match_medium(&sdp, base, "rtsp://127.0.0.1:5544/live/test/streamid=1"), Some(true));
        assert_eq!(match_medium(&sdp, base, "rtsp://localhost/live/test/streamid=0"), Some(false));
        assert_eq!(match_medium(&sdp, base, "rtsp://127.0.0.1:5544/live/test/other"), None);
    }

    #[test]
    fn single_medium_accepts_any_uri() {
        let sdp = SdpLogicContext::parse("v=0\r\nm=audio 0 RTP/AVP 8\r\n").unwrap();
        assert_eq!(match_medium(&sdp, "rtsp://h/a", "rtsp://h/a"), Some(true));
    }
}
