use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::MediaChannel;
use super::client::{ClientCommandSession, ClientShared, InterleavedHandler};
use super::out_session::BaseOutSession;
use super::{header, method};
use crate::avpacket::AvPacket;
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::media::RtpPacket;
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::url::parse_rtsp_url;

/// Publishes a stream to a remote RTSP server: OPTIONS, ANNOUNCE, one
/// SETUP per medium with `mode=record`, then RECORD.
pub struct PushSession {
    info: SessionInfo,
    runtime: Runtime,
    over_tcp: bool,
    base: Arc<BaseOutSession>,
    shared: Mutex<Option<Arc<ClientShared>>>,
    closer: Arc<Closer>,
}

impl PushSession {
    pub fn new(runtime: &Runtime, over_tcp: bool) -> Self {
        let info = SessionInfo::new(runtime.ids.next(prefix::RTSP_PUSH), Protocol::Rtsp, SessionRole::Push);
        let closer = Arc::new(Closer::new());
        let base = Arc::new(BaseOutSession::new(
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

    /// Announce `raw_sdp` and negotiate. Returns once RECORD is answered;
    /// from then on packets may be written.
    pub async fn push(&self, raw_url: &str, raw_sdp: &str) -> Result<()> {
        let url = parse_rtsp_url(raw_url)?;
        self.info.set_url(url.clone());
        let sdp = SdpLogicContext::parse(raw_sdp)?;
        tracing::info!(session = %self.unique_key(), url = %url.raw_url_without_user_info, tcp = self.over_tcp, "rtsp push");

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
            self.negotiate(&mut client, sdp).await?;
            Ok(client)
        }
        .await;

        match result {
            Ok(client) => {
                // Servers may send RTCP receiver reports; nothing consumes them.
                let ignore: InterleavedHandler = Arc::new(|_, _| {});
                client.spawn_run_loop(ignore, None);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), error = %e, "rtsp push failed");
                self.base.dispose();
                self.closer.finish(Error::TransportClosed);
                Err(e)
            }
        }
    }

    async fn negotiate(&self, client: &mut ClientCommandSession, sdp: SdpLogicContext) -> Result<()> {
        client.options().await?;

        let uri = client.shared().base_uri().to_string();
        client
            .request(
                method::ANNOUNCE,
                &uri,
                &[(header::CONTENT_TYPE, "application/sdp")],
                Some(sdp.raw_sdp.clone()),
                None,
            )
            .await?;

        let media: Vec<(bool, String)> = [
            (true, sdp.audio_control_uri(&uri)),
            (false, sdp.video_control_uri(&uri)),
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
                .setup(&control_uri, self.over_tcp, next_channel, true)
                .await?;
            if let MediaChannel::Interleaved { rtcp_channel, .. } = &channel {
                next_channel = rtcp_channel.saturating_add(1);
            }
            self.base.set_channel(is_audio, channel);
        }

        client.request(method::RECORD, &uri, &[], None, None).await?;
        self.base.spawn_udp_readers();
        Ok(())
    }

    pub fn sdp(&self) -> Option<Arc<SdpLogicContext>> {
        self.base.sdp()
    }

    /// Forward an RTP packet as-is, routed by payload type.
    pub fn write_rtp_packet(&self, pkt: &RtpPacket) -> Result<()> {
        self.base.write_rtp_packet(pkt)
    }

    /// Packetize and send one frame.
    pub fn write_av_packet(&self, pkt: &AvPacket) -> Result<()> {
        self.base.write_av_packet(pkt)
    }

    pub async fn wait(&self) -> Error {
        self.closer.wait().await
    }

    /// Send TEARDOWN and stop.
    pub fn dispose(&self) {
        let shared = self.shared.lock().take();
        if let Some(shared) = shared {
            shared.send_teardown();
        }
        tracing::info!(session = %self.unique_key(), "rtsp push session disposed");
        self.base.dispose();
        self.closer.finish(Error::TransportClosed);
    }
}

impl Session for PushSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
