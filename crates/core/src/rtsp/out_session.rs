use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::channel::MediaChannel;
use crate::avpacket::AvPacket;
use crate::config::Runtime;
use crate::error::Result;
use crate::media::rtp::RTP_FIXED_HEADER_LENGTH;
use crate::media::{RtpPacker, RtpPacket, new_packer};
use crate::sdp::SdpLogicContext;
use crate::session::{Closer, SessionStat};

/// Zero-filled datagram sent to each remote UDP port once SETUP completes
/// so NATs open the return path.
const NAT_PUNCH: [u8; RTP_FIXED_HEADER_LENGTH] = [0; RTP_FIXED_HEADER_LENGTH];

#[derive(Default)]
struct OutTrack {
    packer: Option<RtpPacker>,
    channel: Option<MediaChannel>,
}

#[derive(Default)]
struct OutState {
    audio: OutTrack,
    video: OutTrack,
}

/// Sending half shared by the server sub session and the push client.
///
/// Writes never block: UDP datagrams go out with `try_send` and
/// interleaved frames join the command connection's write queue.
pub struct BaseOutSession {
    unique_key: String,
    runtime: Runtime,
    sdp: RwLock<Option<Arc<SdpLogicContext>>>,
    state: Mutex<OutState>,
    stat: Arc<SessionStat>,
    closer: Arc<Closer>,
}

impl BaseOutSession {
    pub fn new(unique_key: &str, runtime: Runtime, stat: Arc<SessionStat>, closer: Arc<Closer>) -> Self {
        Self {
            unique_key: unique_key.to_string(),
            runtime,
            sdp: RwLock::new(None),
            state: Mutex::new(OutState::default()),
            stat,
            closer,
        }
    }

    /// Build one packer per medium described by `sdp`.
    pub fn init_with_sdp(&self, sdp: SdpLogicContext) {
        let max = self.runtime.config.rtp_max_payload_size;
        {
            let mut state = self.state.lock();
            if let Some(audio) = &sdp.audio {
                state.audio.packer =
                    new_packer(audio.payload_type, audio.rtp_payload_type, audio.clock_rate, max);
            }
            if let Some(video) = &sdp.video {
                state.video.packer =
                    new_packer(video.payload_type, video.rtp_payload_type, video.clock_rate, max);
            }
        }
        *self.sdp.write() = Some(Arc::new(sdp));
    }

    pub fn sdp(&self) -> Option<Arc<SdpLogicContext>> {
        self.sdp.read().clone()
    }

    pub fn set_channel(&self, is_audio: bool, channel: MediaChannel) {
        if channel.is_udp()
            && let Err(e) = channel
                .send_rtp(&NAT_PUNCH)
                .and_then(|_| channel.send_rtcp(&NAT_PUNCH))
        {
            tracing::debug!(session = %self.unique_key, error = %e, "nat punch not sent");
        }
        let mut state = self.state.lock();
        let track = if is_audio { &mut state.audio } else { &mut state.video };
        track.channel = Some(channel);
    }

    /// Drain the UDP sockets so peer RTCP does not pile up; ends with the
    /// session.
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
            for conn in [rtp, rtcp] {
                let this = self.clone();
                tokio::spawn(async move {
                    let closer = this.closer.clone();
                    let stat = this.stat.clone();
                    let _ = conn
                        .read_loop(&closer, None, |data, _| {
                            stat.add_read_bytes(data.len());
                        })
                        .await;
                });
            }
        }
    }

    /// Send an RTP packet on the channel of the medium its payload type
    /// belongs to. Packets of media that were not set up are dropped.
    pub fn write_rtp_packet(&self, pkt: &RtpPacket) -> Result<()> {
        let Some(sdp) = self.sdp() else {
            return Ok(());
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
        let channel = {
            let state = self.state.lock();
            let track = if is_audio { &state.audio } else { &state.video };
            track.channel.clone()
        };
        let Some(channel) = channel else {
            return Ok(());
        };
        channel.send_rtp(&pkt.raw)?;
        self.stat.add_wrote_bytes(pkt.raw.len());
        Ok(())
    }

    /// Packetize and send one frame.
    pub fn write_av_packet(&self, pkt: &AvPacket) -> Result<()> {
        let (packets, channel) = {
            let mut state = self.state.lock();
            let track = if pkt.is_audio() {
                &mut state.audio
            } else {
                &mut state.video
            };
            let (Some(packer), Some(channel)) = (track.packer.as_mut(), track.channel.clone()) else {
                return Ok(());
            };
            (packer.pack(pkt), channel)
        };
        for p in &packets {
            channel.send_rtp(&p.raw)?;
            self.stat.add_wrote_bytes(p.raw.len());
        }
        Ok(())
    }

    pub fn dispose(&self) {
        self.closer.close();
        let mut state = self.state.lock();
        state.audio.channel = None;
        state.video.channel = None;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::avpacket::AvPacketPt;
    use crate::media::RtpHeader;
    use crate::sdp::tests::FFMPEG_SDP;
    use crate::session::{Protocol, SessionRole};

    fn session() -> BaseOutSession {
        let stat = Arc::new(SessionStat::new("RTSPSUB1".into(), Protocol::Rtsp, SessionRole::Sub));
        let s = BaseOutSession::new("RTSPSUB1", Runtime::default(), stat, Arc::new(Closer::new()));
        s.init_with_sdp(SdpLogicContext::parse(FFMPEG_SDP).unwrap());
        s
    }

    fn interleaved(rtp_channel: u8) -> (MediaChannel, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        (
            MediaChannel::Interleaved {
                writer: tx,
                rtp_channel,
                rtcp_channel: rtp_channel + 1,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn rtp_is_routed_by_payload_type() {
        let s = session();
        let (audio, mut audio_rx) = interleaved(0);
        let (video, mut video_rx) = interleaved(2);
        s.set_channel(true, audio);
        s.set_channel(false, video);

        let header = RtpHeader {
            payload_type: 97,
            ..RtpHeader::default()
        };
        s.write_rtp_packet(&RtpPacket::new(header, b"aac")).unwrap();
        let header = RtpHeader {
            payload_type: 96,
            ..RtpHeader::default()
        };
        s.write_rtp_packet(&RtpPacket::new(header, b"h264")).unwrap();

        assert_eq!(audio_rx.recv().await.unwrap()[1], 0);
        assert_eq!(video_rx.recv().await.unwrap()[1], 2);
        assert!(audio_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn av_packets_are_packetized() {
        let s = session();
        let (video, mut rx) = interleaved(2);
        s.set_channel(false, video);

        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.extend(std::iter::repeat_n(0x11, 3000));
        s.write_av_packet(&AvPacket::new(AvPacketPt::Avc, 40, Bytes::from(frame)))
            .unwrap();

        let mut count = 0;
        let mut last_marker = false;
        while let Ok(f) = rx.try_recv() {
            let pkt = RtpPacket::parse(f.slice(4..)).unwrap();
            assert_eq!(pkt.header.payload_type, 96);
            assert_eq!(pkt.header.timestamp, 40 * 90);
            last_marker = pkt.header.marker;
            count += 1;
        }
        assert!(count >= 3);
        assert!(last_marker);

        // Audio was never set up.
        s.write_av_packet(&AvPacket::new(AvPacketPt::Aac, 0, Bytes::from_static(b"x")))
            .unwrap();
    }

    #[tokio::test]
    async fn udp_channel_sends_nat_punch() {
        use crate::transport::UdpConnection;

        let peer_rtp = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        let peer_rtcp = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        let rtp = Arc::new(UdpConnection::bind("127.0.0.1:0").await.unwrap());
        let rtcp = Arc::new(UdpConnection::bind("127.0.0.1:0").await.unwrap());
        rtp.set_remote(format!("127.0.0.1:{}", peer_rtp.local_port()).parse().unwrap());
        rtcp.set_remote(format!("127.0.0.1:{}", peer_rtcp.local_port()).parse().unwrap());

        let s = session();
        s.set_channel(false, MediaChannel::Udp { rtp, rtcp });

        let closer = Closer::new();
        let mut got = None;
        peer_rtp
            .read_loop(&closer, Some(std::time::Duration::from_secs(2)), |b, _| {
                got = Some(b);
                closer.close();
            })
            .await
            .unwrap();
        assert_eq!(got.unwrap().len(), RTP_FIXED_HEADER_LENGTH);
    }
}
