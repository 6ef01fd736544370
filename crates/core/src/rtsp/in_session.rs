use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::channel::MediaChannel;
use crate::aligner::AvPacketQueue;
use crate::avpacket::{AvPacket, AvPacketSink};
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::media::rtcp::{RTCP_PACKET_TYPE_SR, RrProducer, RtcpHeader, SenderReport};
use crate::media::{RtpPacket, RtpUnpacker, new_unpacker};
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, SessionStat};

#[derive(Default)]
struct Track {
    unpacker: Option<RtpUnpacker>,
    rr: Option<RrProducer>,
    ssrc: Option<u32>,
    channel: Option<MediaChannel>,
}

#[derive(Default)]
struct InState {
    audio: Track,
    video: Track,
    aligner: Option<AvPacketQueue>,
}

/// Receiving half shared by the server pub session and the pull client.
///
/// Raw RTP arrives either from per-medium UDP reader tasks or from the
/// command connection's interleaved frames. Each packet is forwarded to the
/// sink as-is, then unpacked (and optionally aligned) into [`AvPacket`]s.
/// Sender reports are answered with receiver reports on the same channel.
pub struct BaseInSession {
    unique_key: String,
    runtime: Runtime,
    sdp: RwLock<Option<Arc<SdpLogicContext>>>,
    sink: RwLock<Option<Arc<dyn AvPacketSink>>>,
    state: Mutex<InState>,
    /// Taken before `state` is released so that sink calls keep the order
    /// in which packets went through the unpackers and the aligner.
    delivery: Mutex<()>,
    stat: Arc<SessionStat>,
    closer: Arc<Closer>,
}

impl BaseInSession {
    pub fn new(unique_key: &str, runtime: Runtime, stat: Arc<SessionStat>, closer: Arc<Closer>) -> Self {
        Self {
            unique_key: unique_key.to_string(),
            runtime,
            sdp: RwLock::new(None),
            sink: RwLock::new(None),
            state: Mutex::new(InState::default()),
            delivery: Mutex::new(()),
            stat,
            closer,
        }
    }

    /// Build unpackers and RR producers for the media `sdp` describes.
    pub fn init_with_sdp(&self, sdp: SdpLogicContext) {
        let capacity = self.runtime.config.rtp_unpacker_capacity;
        let sdp = Arc::new(sdp);
        {
            let mut state = self.state.lock();
            if let Some(audio) = &sdp.audio {
                state.audio.unpacker = new_unpacker(audio.payload_type, audio.clock_rate, capacity);
                state.audio.rr = Some(RrProducer::new(audio.clock_rate));
            }
            if let Some(video) = &sdp.video {
                state.video.unpacker = new_unpacker(video.payload_type, video.clock_rate, capacity);
                state.video.rr = Some(RrProducer::new(video.clock_rate));
            }
        }
        *self.sdp.write() = Some(sdp.clone());

        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_av_config(&sdp.av_config());
        }
    }

    pub fn sdp(&self) -> Option<Arc<SdpLogicContext>> {
        self.sdp.read().clone()
    }

    /// Install the consumer. If the SDP is already known the sink gets the
    /// decoder configuration right away.
    pub fn set_sink(&self, sink: Arc<dyn AvPacketSink>) {
        *self.sink.write() = Some(sink.clone());
        if let Some(sdp) = self.sdp() {
            sink.on_av_config(&sdp.av_config());
        }
    }

    /// Merge audio and video onto one timeline before they reach the sink.
    pub fn enable_aligner(&self) {
        let config = &self.runtime.config;
        self.state.lock().aligner = Some(AvPacketQueue::new(
            config.aligner_queue_capacity,
            config.aligner_rebase_on_backward_jump,
        ));
    }

    pub fn set_channel(&self, is_audio: bool, channel: MediaChannel) {
        let mut state = self.state.lock();
        let track = if is_audio { &mut state.audio } else { &mut state.video };
        track.channel = Some(channel);
    }

    /// Start one reader task per UDP socket. A medium that stays silent for
    /// `read_av_timeout` ends the session.
    pub fn spawn_udp_readers(self: &Arc<Self>) {
        let channels: Vec<MediaChannel> = {
            let state = self.state.lock();
            [&state.audio.channel, &state.video.channel]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for channel in channels {
            let MediaChannel::Udp { rtp, rtcp } = channel else {
                continue;
            };
            let idle = self.runtime.config.read_av_timeout;

            let this = self.clone();
            tokio::spawn(async move {
                let closer = this.closer.clone();
                let res = rtp
                    .read_loop(&closer, Some(idle), |data, _| this.feed_rtp(data))
                    .await;
                if let Err(e) = res {
                    tracing::warn!(session = %this.unique_key, error = %e, "rtp read loop ended");
                    closer.finish(e);
                }
            });

            let this = self.clone();
            tokio::spawn(async move {
                let closer = this.closer.clone();
                let res = rtcp
                    .read_loop(&closer, None, |data, _| this.feed_rtcp(data))
                    .await;
                if let Err(e) = res {
                    tracing::debug!(session = %this.unique_key, error = %e, "rtcp read loop ended");
                }
            });
        }
    }

    /// Entry point for one RTP datagram or interleaved frame.
    pub fn feed_rtp(&self, data: Bytes) {
        self.stat.add_read_bytes(data.len());
        if let Err(e) = self.handle_rtp(data) {
            tracing::warn!(session = %self.unique_key, error = %e, "dropping rtp packet");
        }
    }

    /// Entry point for one RTCP datagram or interleaved frame.
    pub fn feed_rtcp(&self, data: Bytes) {
        self.stat.add_read_bytes(data.len());
        if let Err(e) = self.handle_rtcp(&data) {
            tracing::warn!(session = %self.unique_key, error = %e, "dropping rtcp packet");
        }
    }

    fn handle_rtp(&self, data: Bytes) -> Result<()> {
        let pkt = RtpPacket::parse(data)?;
        let Some(sdp) = self.sdp() else {
            return Err(Error::invalid(ProtocolErrorKind::InvalidSdp("rtp before sdp")));
        };
        let pt = pkt.header.payload_type;
        let is_audio = if sdp.is_audio_payload_type(pt) {
            true
        } else if sdp.is_video_payload_type(pt) {
            false
        } else {
            tracing::trace!(session = %self.unique_key, pt, "rtp payload type not in sdp");
            return Ok(());
        };

        let (out, _delivery) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let track = if is_audio { &mut state.audio } else { &mut state.video };
            track.ssrc = Some(pkt.header.ssrc);
            if let Some(rr) = track.rr.as_mut() {
                rr.feed_rtp(&pkt.header);
            }
            let unpacked = match track.unpacker.as_mut() {
                Some(unpacker) => unpacker.feed(pkt.clone()),
                None => Vec::new(),
            };
            let out: Vec<AvPacket> = match state.aligner.as_mut() {
                Some(aligner) => unpacked.into_iter().flat_map(|p| aligner.feed(p)).collect(),
                None => unpacked,
            };
            (out, self.delivery.lock())
        };

        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_rtp_packet(&pkt);
            for av in out {
                self.deliver(&*sink, av);
            }
        }
        Ok(())
    }

    fn deliver(&self, sink: &dyn AvPacketSink, pkt: AvPacket) {
        tracing::trace!(
            session = %self.unique_key,
            pt = ?pkt.payload_type,
            ts = pkt.timestamp,
            len = pkt.payload.len(),
            "av packet"
        );
        sink.on_av_packet(pkt);
    }

    /// Walk a compound RTCP packet and answer each SR that belongs to one of
    /// our media. SRs from unknown SSRCs are ignored.
    fn handle_rtcp(&self, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let header = RtcpHeader::parse(rest)?;
            let len = header.packet_len();
            if len > rest.len() {
                return Err(Error::short(len, rest.len()));
            }
            if header.packet_type == RTCP_PACKET_TYPE_SR {
                let sr = SenderReport::parse(&rest[..len])?;
                self.answer_sr(&sr);
            }
            rest = &rest[len..];
        }
        Ok(())
    }

    fn answer_sr(&self, sr: &SenderReport) {
        let reply = {
            let mut state = self.state.lock();
            let track = if state.audio.ssrc == Some(sr.sender_ssrc) {
                &mut state.audio
            } else if state.video.ssrc == Some(sr.sender_ssrc) {
                &mut state.video
            } else {
                return;
            };
            match (track.rr.as_mut(), track.channel.clone()) {
                (Some(rr), Some(channel)) => Some((rr.build_rr(sr), channel)),
                _ => None,
            }
        };
        if let Some((rr, channel)) = reply {
            if let Err(e) = channel.send_rtcp(&rr) {
                tracing::debug!(session = %self.unique_key, error = %e, "rr not sent");
            } else {
                self.stat.add_wrote_bytes(rr.len());
            }
        }
    }

    /// Close the session and release its sockets.
    pub fn dispose(&self) {
        self.closer.close();
        let mut state = self.state.lock();
        state.audio.channel = None;
        state.video.channel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avpacket::{AvConfig, AvPacketPt};
    use crate::media::RtpHeader;
    use crate::sdp::tests::FFMPEG_SDP;
    use crate::session::{Protocol, SessionRole};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        configs: Mutex<Vec<AvConfig>>,
        packets: Mutex<Vec<AvPacket>>,
        rtp: Mutex<usize>,
    }

    impl AvPacketSink for Recorder {
        fn on_av_config(&self, config: &AvConfig) {
            self.configs.lock().push(config.clone());
        }
        fn on_av_packet(&self, pkt: AvPacket) {
            self.packets.lock().push(pkt);
        }
        fn on_rtp_packet(&self, _pkt: &RtpPacket) {
            *self.rtp.lock() += 1;
        }
    }

    fn session() -> BaseInSession {
        let stat = Arc::new(SessionStat::new("RTSPPUB1".into(), Protocol::Rtsp, SessionRole::Pub));
        BaseInSession::new("RTSPPUB1", Runtime::default(), stat, Arc::new(Closer::new()))
    }

    fn rtp(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Bytes {
        let header = RtpHeader {
            payload_type: pt,
            seq,
            timestamp: ts,
            ssrc,
            marker: true,
            ..RtpHeader::default()
        };
        RtpPacket::new(header, payload).raw
    }

    #[test]
    fn sink_gets_config_then_packets() {
        let s = session();
        let sink = Arc::new(Recorder::default());
        s.init_with_sdp(SdpLogicContext::parse(FFMPEG_SDP).unwrap());
        s.set_sink(sink.clone());
        assert!(sink.configs.lock()[0].has_video());

        s.feed_rtp(rtp(96, 10, 90_000, 1, &[0x65, 0x88, 0x80]));
        s.feed_rtp(rtp(96, 11, 93_600, 1, &[0x41, 0x9A]));
        // Unknown payload type is ignored.
        s.feed_rtp(rtp(120, 1, 0, 9, &[0]));

        let packets = sink.packets.lock();
        assert_eq!(*sink.rtp.lock(), 2);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload_type, AvPacketPt::Avc);
        assert_eq!(packets[0].timestamp, 1000);
        assert_eq!(&packets[0].payload[..], &[0, 0, 0, 3, 0x65, 0x88, 0x80]);
        assert_eq!(packets[1].timestamp, 1040);
    }

    #[test]
    fn aligner_rebases_to_zero() {
        let s = session();
        let sink = Arc::new(Recorder::default());
        s.set_sink(sink.clone());
        s.init_with_sdp(SdpLogicContext::parse(FFMPEG_SDP).unwrap());
        s.enable_aligner();

        s.feed_rtp(rtp(96, 1, 900_000, 1, &[0x65, 0x01]));
        let mut aac = vec![0x00, 0x10, 0x00, 0x08];
        aac.push(0x21);
        s.feed_rtp(rtp(97, 1, 441_000, 2, &aac));
        s.feed_rtp(rtp(96, 2, 903_600, 1, &[0x41, 0x01]));

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.timestamp == 0));
        assert!(packets[0].is_video());
        assert!(packets[1].is_audio());
    }

    #[derive(Default)]
    struct Timeline(Mutex<Vec<i64>>);

    impl AvPacketSink for Timeline {
        fn on_av_packet(&self, pkt: AvPacket) {
            // Widen the window between unlocking and delivering.
            std::thread::yield_now();
            self.0.lock().push(pkt.timestamp);
        }
    }

    #[test]
    fn concurrent_readers_keep_aligned_order() {
        let s = Arc::new(session());
        let sink = Arc::new(Timeline::default());
        s.set_sink(sink.clone());
        s.init_with_sdp(SdpLogicContext::parse(FFMPEG_SDP).unwrap());
        s.enable_aligner();

        let video = {
            let s = s.clone();
            std::thread::spawn(move || {
                for i in 0..500u16 {
                    s.feed_rtp(rtp(96, i, u32::from(i) * 3600, 1, &[0x41, 0x01]));
                }
            })
        };
        let audio = {
            let s = s.clone();
            std::thread::spawn(move || {
                for i in 0..900u16 {
                    let aac = [0x00, 0x10, 0x00, 0x08, 0x21];
                    s.feed_rtp(rtp(97, i, u32::from(i) * 1024, 2, &aac));
                }
            })
        };
        video.join().unwrap();
        audio.join().unwrap();

        let ts = sink.0.lock();
        assert!(ts.len() > 1000);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]), "out of order delivery");
    }

    #[tokio::test]
    async fn sender_report_is_answered_on_the_same_channel() {
        let s = session();
        s.init_with_sdp(SdpLogicContext::parse(FFMPEG_SDP).unwrap());
        let (tx, mut rx) = mpsc::channel(8);
        s.set_channel(
            false,
            MediaChannel::Interleaved {
                writer: tx,
                rtp_channel: 2,
                rtcp_channel: 3,
            },
        );
        s.feed_rtp(rtp(96, 7, 0, 0xABCD, &[0x65, 0x01]));

        let sr = SenderReport {
            sender_ssrc: 0xABCD,
            ntp_msw: 1,
            ntp_lsw: 2,
            rtp_timestamp: 0,
            packet_count: 1,
            octet_count: 2,
        };
        s.feed_rtcp(sr.pack());
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame[1], 3);
        assert_eq!(frame[4 + 1], crate::media::rtcp::RTCP_PACKET_TYPE_RR);

        // Unknown SSRC: no answer.
        let other = SenderReport {
            sender_ssrc: 0x1111,
            ..sr
        };
        s.feed_rtcp(other.pack());
        assert!(rx.try_recv().is_err());
    }
}
