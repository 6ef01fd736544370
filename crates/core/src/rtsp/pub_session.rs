use std::sync::Arc;

use bytes::Bytes;

use super::in_session::BaseInSession;
use crate::avpacket::AvPacketSink;
use crate::config::Runtime;
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::url::UrlContext;

/// A remote encoder publishing to the server with ANNOUNCE/RECORD.
///
/// Shares its [`Closer`] with the command connection that created it, so
/// disposing either ends both.
pub struct PubSession {
    info: SessionInfo,
    base: Arc<BaseInSession>,
}

impl PubSession {
    pub(crate) fn new(runtime: &Runtime, url: UrlContext, sdp: SdpLogicContext, closer: Arc<Closer>) -> Self {
        let info = SessionInfo::new(runtime.ids.next(prefix::RTSP_PUB), Protocol::Rtsp, SessionRole::Pub);
        info.set_url(url);
        let base = Arc::new(BaseInSession::new(
            info.unique_key(),
            runtime.clone(),
            info.stat().clone(),
            closer,
        ));
        base.init_with_sdp(sdp);
        Self { info, base }
    }

    pub fn sdp(&self) -> Option<Arc<SdpLogicContext>> {
        self.base.sdp()
    }

    /// The SDP as ANNOUNCEd.
    pub fn raw_sdp(&self) -> String {
        self.sdp().map(|s| s.raw_sdp.clone()).unwrap_or_default()
    }

    pub fn set_sink(&self, sink: Arc<dyn AvPacketSink>) {
        self.base.set_sink(sink);
    }

    pub fn enable_aligner(&self) {
        self.base.enable_aligner();
    }

    pub(crate) fn base(&self) -> &Arc<BaseInSession> {
        &self.base
    }

    pub(crate) fn feed_interleaved(&self, is_rtcp: bool, payload: Bytes) {
        if is_rtcp {
            self.base.feed_rtcp(payload);
        } else {
            self.base.feed_rtp(payload);
        }
    }

    pub fn dispose(&self) {
        tracing::info!(session = %self.unique_key(), "rtsp pub session disposed");
        self.base.dispose();
    }
}

impl Session for PubSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
