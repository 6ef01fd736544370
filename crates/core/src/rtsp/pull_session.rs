use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::MediaChannel;
use super::client::{ClientCommandSession, ClientShared, InterleavedHandler};
use super::in_session::BaseInSession;
use super::{header, method};
use crate::avpacket::AvPacketSink;
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::url::parse_rtsp_url;

/// Pulls a stream from a remote RTSP server: OPTIONS, DESCRIBE, one SETUP
/// per medium, then PLAY.
///
/// Media arrives over UDP port pairs from the runtime's pool, or
/// interleaved on the command connection when `over_tcp` is set.
pub struct PullSession {
    info: SessionInfo,
    runtime: Runtime,
    over_tcp: bool,
    base: Arc<BaseInSession>,
    shared: Mutex<Option<Arc<ClientShared>>>,
    closer: Arc<Closer>,
}

impl PullSession {
    pub fn new(runtime: &Runtime, over_tcp: bool) -> Self {
        let info = SessionInfo::new(runtime.ids.next(prefix::RTSP_PULL), Protocol::Rtsp, SessionRole::Pull);
        let closer = Arc::new(Closer::new());
        let base = Arc::new(BaseInSession::new(
            info.unique_key(),
            runtime.clone(),
            info.stat().clone(),
            closer.clone(),
        ));
        Self {
            info,
            runtime: runtime.clone(),
            over_tcp,
            base,
            shared: Mutex::new(None),
            closer,
        }
    }

    /// Set before [`pull`](Self::pull); the sink sees the SDP's
    /// configuration first, then every RTP packet and frame.
    pub fn set_sink(&self, sink: Arc<dyn AvPacketSink>) {
        self.base.set_sink(sink);
    }

    /// Interleave audio and video by timestamp before handing frames to
    /// the sink.
    pub fn enable_aligner(&self) {
        self.base.enable_aligner();
    }

    pub fn sdp(&self) -> Option<Arc<SdpLogicContext>> {
        self.base.sdp()
    }

    /// Connect and negotiate. Returns once PLAY is answered; media then
    /// flows to the sink until [`dispose`](Self::dispose) or an error,
    /// which [`wait`](Self::wait) reports.
    pub async fn pull(&self, raw_url: &str) -> Result<()> {
        let url = parse_rtsp_url(raw_url)?;
        self.info.set_url(url.clone());
        tracing::info!(session = %self.unique_key(), url = %url.raw_url_without_user_info, tcp = self.over_tcp, "rtsp pull");

        let result = async {
            let mut client = ClientCommandSession::connect(
                self.unique_key(),
                self.runtime.clone(),
                url,
                self.info.stat().clone(),
                self.closer.clone(),
            )
            .await?;
            *self.shared.lock() = Some(client.shared().clone());
            self.negotiate(&mut client).await?;
            Ok(client)
        }
        .await;

        match result {
            Ok(client) => {
                let handler = self.interleaved_handler();
                // UDP readers watch their own sockets.
                let read_av_timeout = self.over_tcp.then_some(self.runtime.config.read_av_timeout);
                client.spawn_run_loop(handler, read_av_timeout);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), error = %e, "rtsp pull failed");
                self.base.dispose();
                self.closer.finish(Error::TransportClosed);
                Err(e)
            }
        }
    }

    async fn negotiate(&self, client: &mut ClientCommandSession) -> Result<()> {
        client.options().await?;

        let uri = client.shared().base_uri().to_string();
        let resp = client
            .request(method::DESCRIBE, &uri, &[(header::ACCEPT, "application/sdp")], None, None)
            .await?;
        let base_url = resp
            .get_header(header::CONTENT_BASE)
            .map(str::to_string)
            .unwrap_or_else(|| uri.clone());
        let sdp = SdpLogicContext::parse(&resp.body)?;
        let media: Vec<(bool, String)> = [
            (true, sdp.audio_control_uri(&base_url)),
            (false, sdp.video_control_uri(&base_url)),
        ]
        .into_iter()
        .filter_map(|(is_audio, uri)| uri.map(|u| (is_audio, u)))
        .collect();
        if media.is_empty() {
            return Err(Error::invalid(ProtocolErrorKind::InvalidSdp("no usable media")));
        }
        self.base.init_with_sdp(sdp);

        let mut next_channel = 0u8;
        for (is_audio, control_uri) in media {
            let channel = client
                .setup(&control_uri, self.over_tcp, next_channel, false)
                .await?;
            if let MediaChannel::Interleaved { rtcp_channel, .. } = &channel {
                next_channel = rtcp_channel.saturating_add(1);
            }
            self.base.set_channel(is_audio, channel);
        }

        let handler = self.interleaved_handler();
        client
            .request(method::PLAY, &uri, &[(header::RANGE, "npt=0.000-")], None, Some(&handler))
            .await?;
        self.base.spawn_udp_readers();
        Ok(())
    }

    fn interleaved_handler(&self) -> InterleavedHandler {
        let base = self.base.clone();
        Arc::new(move |channel, payload| {
            // RTP travels on even channels, RTCP on the odd one after it.
            if channel % 2 == 0 {
                base.feed_rtp(payload);
            } else {
                base.feed_rtcp(payload);
            }
        })
    }

    /// Resolves with the error that ended the session.
    pub async fn wait(&self) -> Error {
        self.closer.wait().await
    }

    /// Send TEARDOWN and stop.
    pub fn dispose(&self) {
        let shared = self.shared.lock().take();
        if let Some(shared) = shared {
            shared.send_teardown();
        }
        tracing::info!(session = %self.unique_key(), "rtsp pull session disposed");
        self.base.dispose();
        self.closer.finish(Error::TransportClosed);
    }
}

impl Session for PullSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
