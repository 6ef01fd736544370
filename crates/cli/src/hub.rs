//! Stream-name routing for `serve`. Each stream name gets a [`Group`] that
//! ties one publisher (RTMP or RTSP) to any number of RTMP, RTSP and
//! HTTP-FLV players, remuxing where the protocols differ.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use streamcore::amf0::Amf0Object;
use streamcore::httpflv::{HttpFlvServerObserver, SubSession as FlvSubSession};
use streamcore::media::RtpPacket;
use streamcore::remux::{AvPacketToRtmp, RtmpToRtsp, RtmpToRtspObserver};
use streamcore::rtmp::{RtmpMessage, RtmpMessageSink, RtmpServerObserver, ServerSession};
use streamcore::rtsp::{PubSession, RtspServerObserver, SubSession as RtspSubSession};
use streamcore::{AvConfig, AvPacket, AvPacketSink, Error, Result, Runtime, Session};

pub struct Hub {
    runtime: Runtime,
    groups: Mutex<HashMap<String, Arc<Group>>>,
}

impl Hub {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn group(&self, stream_name: &str) -> Arc<Group> {
        self.groups
            .lock()
            .entry(stream_name.to_string())
            .or_insert_with(|| {
                tracing::info!(stream = %stream_name, "group created");
                Arc::new(Group::new(stream_name, self.runtime.clone()))
            })
            .clone()
    }

    fn existing(&self, stream_name: &str) -> Option<Arc<Group>> {
        self.groups.lock().get(stream_name).cloned()
    }

    fn release_if_empty(&self, stream_name: &str) {
        let mut groups = self.groups.lock();
        if groups.get(stream_name).is_some_and(|g| g.is_empty()) {
            groups.remove(stream_name);
            tracing::info!(stream = %stream_name, "group removed");
        }
    }
}

impl RtmpServerObserver for Hub {
    fn on_rtmp_connect(&self, session: &Arc<ServerSession>, object: &Amf0Object) {
        tracing::debug!(
            session = %session.unique_key(),
            app = object.get_str("app").unwrap_or_default(),
            tc_url = object.get_str("tcUrl").unwrap_or_default(),
            "rtmp connect"
        );
    }

    fn on_new_rtmp_pub_session(&self, session: &Arc<ServerSession>) -> Result<()> {
        let group = self.group(&session.stream_name());
        group.add_rtmp_pub(session)?;
        session.set_sink(group);
        Ok(())
    }

    fn on_del_rtmp_pub_session(&self, session: &Arc<ServerSession>) {
        let name = session.stream_name();
        if let Some(group) = self.existing(&name) {
            group.del_publisher(session.unique_key());
        }
        self.release_if_empty(&name);
    }

    fn on_new_rtmp_sub_session(&self, session: &Arc<ServerSession>) -> Result<()> {
        self.group(&session.stream_name()).add_rtmp_sub(session.clone());
        Ok(())
    }

    fn on_del_rtmp_sub_session(&self, session: &Arc<ServerSession>) {
        let name = session.stream_name();
        if let Some(group) = self.existing(&name) {
            group.del_sub(session.unique_key());
        }
        self.release_if_empty(&name);
    }
}

impl RtspServerObserver for Hub {
    fn on_new_rtsp_pub_session(&self, session: &Arc<PubSession>) -> Result<()> {
        let group = self.group(&session.stream_name());
        group.add_rtsp_pub(session)?;
        session.set_sink(group);
        Ok(())
    }

    fn on_del_rtsp_pub_session(&self, session: &Arc<PubSession>) {
        let name = session.stream_name();
        if let Some(group) = self.existing(&name) {
            group.del_publisher(session.unique_key());
        }
        self.release_if_empty(&name);
    }

    fn on_new_rtsp_sub_session_describe(&self, session: &Arc<RtspSubSession>) -> Option<String> {
        self.existing(&session.stream_name())?.rtsp_sdp()
    }

    fn on_new_rtsp_sub_session_play(&self, session: &Arc<RtspSubSession>) -> Result<()> {
        self.group(&session.stream_name()).rtsp_out.add(session.clone());
        Ok(())
    }

    fn on_del_rtsp_sub_session(&self, session: &Arc<RtspSubSession>) {
        let name = session.stream_name();
        if let Some(group) = self.existing(&name) {
            group.rtsp_out.remove(session.unique_key());
        }
        self.release_if_empty(&name);
    }
}

impl HttpFlvServerObserver for Hub {
    fn on_new_http_flv_sub_session(&self, session: &Arc<FlvSubSession>) -> Result<()> {
        self.group(&session.stream_name()).add_flv_sub(session.clone());
        Ok(())
    }

    fn on_del_http_flv_sub_session(&self, session: &Arc<FlvSubSession>) {
        let name = session.stream_name();
        if let Some(group) = self.existing(&name) {
            group.del_sub(session.unique_key());
        }
        self.release_if_empty(&name);
    }
}

enum Publisher {
    Rtmp(String),
    Rtsp(String),
}

impl Publisher {
    fn key(&self) -> &str {
        match self {
            Self::Rtmp(k) | Self::Rtsp(k) => k,
        }
    }
}

#[derive(Default)]
struct GroupState {
    publisher: Option<Publisher>,
    rtmp_subs: Vec<Arc<ServerSession>>,
    flv_subs: Vec<Arc<FlvSubSession>>,
    meta: Option<RtmpMessage>,
    video_seq: Option<RtmpMessage>,
    audio_seq: Option<RtmpMessage>,
    /// Present while an RTMP publisher feeds RTSP players.
    rtmp_to_rtsp: Option<RtmpToRtsp>,
    /// Used while an RTSP publisher feeds RTMP and HTTP-FLV players.
    av_to_rtmp: AvPacketToRtmp,
}

impl GroupState {
    fn cache(&mut self, msg: &RtmpMessage) {
        if msg.is_metadata() {
            self.meta = Some(msg.clone());
        } else if msg.is_video_seq_header() {
            self.video_seq = Some(msg.clone());
        } else if msg.is_aac_seq_header() {
            self.audio_seq = Some(msg.clone());
        }
    }

    fn broadcast(&mut self, msg: &RtmpMessage) {
        self.cache(msg);
        for sub in &self.rtmp_subs {
            if let Err(e) = sub.write_message(msg) {
                tracing::debug!(session = %sub.unique_key(), error = %e, "rtmp write dropped");
            }
        }
        for sub in &self.flv_subs {
            if let Err(e) = sub.write_rtmp_message(msg) {
                tracing::debug!(session = %sub.unique_key(), error = %e, "flv write dropped");
            }
        }
    }

    fn cached(&self) -> impl Iterator<Item = &RtmpMessage> {
        [&self.meta, &self.video_seq, &self.audio_seq].into_iter().flatten()
    }

    fn reset_media(&mut self) {
        self.meta = None;
        self.video_seq = None;
        self.audio_seq = None;
        self.rtmp_to_rtsp = None;
        self.av_to_rtmp = AvPacketToRtmp::new();
    }
}

/// One stream name: its publisher and every player.
pub struct Group {
    stream_name: String,
    runtime: Runtime,
    rtsp_out: Arc<RtspFanout>,
    state: Mutex<GroupState>,
}

impl Group {
    fn new(stream_name: &str, runtime: Runtime) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            runtime,
            rtsp_out: Arc::new(RtspFanout::default()),
            state: Mutex::new(GroupState::default()),
        }
    }

    fn claim(&self, state: &mut GroupState, publisher: Publisher) -> Result<()> {
        if let Some(existing) = &state.publisher {
            tracing::warn!(stream = %self.stream_name, publisher = %existing.key(), "stream already published");
            return Err(Error::ResourceExhausted(format!(
                "stream {} already published",
                self.stream_name
            )));
        }
        tracing::info!(stream = %self.stream_name, publisher = %publisher.key(), "publisher attached");
        state.reset_media();
        state.publisher = Some(publisher);
        Ok(())
    }

    fn add_rtmp_pub(&self, session: &Arc<ServerSession>) -> Result<()> {
        let mut state = self.state.lock();
        self.claim(&mut state, Publisher::Rtmp(session.unique_key().to_string()))?;
        state.rtmp_to_rtsp = Some(RtmpToRtsp::new(&self.runtime.config, self.rtsp_out.clone()));
        self.rtsp_out.set_sdp(None);
        Ok(())
    }

    fn add_rtsp_pub(&self, session: &Arc<PubSession>) -> Result<()> {
        let mut state = self.state.lock();
        self.claim(&mut state, Publisher::Rtsp(session.unique_key().to_string()))?;
        self.rtsp_out.set_sdp(Some(session.raw_sdp()));
        Ok(())
    }

    fn del_publisher(&self, key: &str) {
        let mut state = self.state.lock();
        if state.publisher.as_ref().is_some_and(|p| p.key() == key) {
            tracing::info!(stream = %self.stream_name, publisher = %key, "publisher detached");
            state.publisher = None;
            state.reset_media();
            self.rtsp_out.set_sdp(None);
        }
    }

    fn add_rtmp_sub(&self, session: Arc<ServerSession>) {
        let mut state = self.state.lock();
        for msg in state.cached() {
            if let Err(e) = session.write_message(msg) {
                tracing::debug!(session = %session.unique_key(), error = %e, "cached header dropped");
            }
        }
        state.rtmp_subs.push(session);
    }

    fn add_flv_sub(&self, session: Arc<FlvSubSession>) {
        let mut state = self.state.lock();
        for msg in state.cached() {
            if let Err(e) = session.write_rtmp_message(msg) {
                tracing::debug!(session = %session.unique_key(), error = %e, "cached header dropped");
            }
        }
        state.flv_subs.push(session);
    }

    fn del_sub(&self, key: &str) {
        let mut state = self.state.lock();
        state.rtmp_subs.retain(|s| s.unique_key() != key);
        state.flv_subs.retain(|s| s.unique_key() != key);
    }

    fn rtsp_sdp(&self) -> Option<String> {
        self.rtsp_out.sdp.lock().clone()
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.publisher.is_none()
            && state.rtmp_subs.is_empty()
            && state.flv_subs.is_empty()
            && self.rtsp_out.subs.lock().is_empty()
    }
}

impl RtmpMessageSink for Group {
    fn on_rtmp_message(&self, msg: &RtmpMessage) {
        let mut state = self.state.lock();
        state.broadcast(msg);
        if let Some(remuxer) = state.rtmp_to_rtsp.as_mut()
            && let Err(e) = remuxer.feed_rtmp_message(msg)
        {
            tracing::debug!(stream = %self.stream_name, error = %e, "rtmp to rtsp remux failed");
        }
    }
}

impl AvPacketSink for Group {
    fn on_av_config(&self, config: &AvConfig) {
        let mut state = self.state.lock();
        match state.av_to_rtmp.feed_av_config(config) {
            Ok(msgs) => msgs.iter().for_each(|m| state.broadcast(m)),
            Err(e) => tracing::debug!(stream = %self.stream_name, error = %e, "av config not remuxed"),
        }
    }

    fn on_av_packet(&self, pkt: AvPacket) {
        let mut state = self.state.lock();
        match state.av_to_rtmp.feed_av_packet(&pkt) {
            Ok(msgs) => msgs.iter().for_each(|m| state.broadcast(m)),
            Err(e) => tracing::debug!(stream = %self.stream_name, error = %e, "av packet not remuxed"),
        }
    }

    fn on_rtp_packet(&self, pkt: &RtpPacket) {
        self.rtsp_out.on_rtp_packet(pkt);
    }
}

/// RTSP players of one group and the SDP they are served.
#[derive(Default)]
struct RtspFanout {
    sdp: Mutex<Option<String>>,
    subs: Mutex<Vec<Arc<RtspSubSession>>>,
}

impl RtspFanout {
    fn set_sdp(&self, sdp: Option<String>) {
        *self.sdp.lock() = sdp;
    }

    fn add(&self, session: Arc<RtspSubSession>) {
        self.subs.lock().push(session);
    }

    fn remove(&self, key: &str) {
        self.subs.lock().retain(|s| s.unique_key() != key);
    }
}

impl RtmpToRtspObserver for RtspFanout {
    fn on_sdp(&self, raw_sdp: &str) {
        tracing::info!("rtsp sdp ready for rtmp publisher");
        self.set_sdp(Some(raw_sdp.to_string()));
    }

    fn on_rtp_packet(&self, pkt: &RtpPacket) {
        for sub in self.subs.lock().iter() {
            if let Err(e) = sub.write_rtp_packet(pkt) {
                tracing::debug!(session = %sub.unique_key(), error = %e, "rtp write dropped");
            }
        }
    }
}
