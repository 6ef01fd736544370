use std::sync::Arc;

use super::out_session::BaseOutSession;
use crate::avpacket::AvPacket;
use crate::config::Runtime;
use crate::error::Result;
use crate::media::RtpPacket;
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::url::UrlContext;

/// A remote player pulling from the server with DESCRIBE/PLAY.
///
/// The observer answers DESCRIBE with an SDP; once PLAY succeeds it feeds
/// the session with [`write_rtp_packet`](Self::write_rtp_packet) or
/// [`write_av_packet`](Self::write_av_packet).
pub struct SubSession {
    info: SessionInfo,
    base: Arc<BaseOutSession>,
}

impl SubSession {
    pub(crate) fn new(runtime: &Runtime, url: UrlContext, closer: Arc<Closer>) -> Self {
        let info = SessionInfo::new(runtime.ids.next(prefix::RTSP_SUB), Protocol::Rtsp, SessionRole::Sub);
        info.set_url(url);
        let base = Arc::new(BaseOutSession::new(
            info.unique_key(),
            runtime.clone(),
            info.stat().clone(),
            closer,
        ));
        Self { info, base }
    }

    pub(crate) fn init_with_sdp(&self, sdp: SdpLogicContext) {
        self.base.init_with_sdp(sdp);
    }

    pub fn sdp(&self) -> Option<Arc<SdpLogicContext>> {
        self.base.sdp()
    }

    pub(crate) fn base(&self) -> &Arc<BaseOutSession> {
        &self.base
    }

    pub fn write_rtp_packet(&self, pkt: &RtpPacket) -> Result<()> {
        self.base.write_rtp_packet(pkt)
    }

    pub fn write_av_packet(&self, pkt: &AvPacket) -> Result<()> {
        self.base.write_av_packet(pkt)
    }

    pub fn dispose(&self) {
        tracing::info!(session = %self.unique_key(), "rtsp sub session disposed");
        self.base.dispose();
    }
}

impl Session for SubSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
