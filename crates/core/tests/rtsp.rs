//! RTSP announce/record into the server, then describe/play out of it,
//! over UDP and over TCP interleaved; plus digest authentication.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use streamcore::codec::avc;
use streamcore::media::RtpPacket;
use streamcore::rtsp::{PubSession, PullSession, PushSession, RtspServer, RtspServerObserver, SubSession};
use streamcore::sdp::{SdpSession, pack_sdp};
use streamcore::{AvConfig, AvPacket, AvPacketPt, AvPacketSink, Config, Error, Result, Runtime};

use common::{ASC, PPS, SPS, wait_until};

type Subs = Arc<Mutex<Vec<Arc<SubSession>>>>;

#[derive(Default)]
struct Router {
    sdp: Mutex<Option<String>>,
    subs: Subs,
}

struct RtpFanout(Subs);

impl AvPacketSink for RtpFanout {
    fn on_rtp_packet(&self, pkt: &RtpPacket) {
        for sub in self.0.lock().iter() {
            let _ = sub.write_rtp_packet(pkt);
        }
    }
}

impl RtspServerObserver for Router {
    fn on_new_rtsp_pub_session(&self, session: &Arc<PubSession>) -> Result<()> {
        *self.sdp.lock() = Some(session.raw_sdp());
        session.set_sink(Arc::new(RtpFanout(self.subs.clone())));
        Ok(())
    }

    fn on_new_rtsp_sub_session_describe(&self, _session: &Arc<SubSession>) -> Option<String> {
        self.sdp.lock().clone()
    }

    fn on_new_rtsp_sub_session_play(&self, session: &Arc<SubSession>) -> Result<()> {
        self.subs.lock().push(session.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    config: Mutex<Option<AvConfig>>,
    packets: Mutex<Vec<AvPacket>>,
}

impl AvPacketSink for Recorder {
    fn on_av_config(&self, config: &AvConfig) {
        *self.config.lock() = Some(config.clone());
    }

    fn on_av_packet(&self, pkt: AvPacket) {
        self.packets.lock().push(pkt);
    }
}

fn stream_sdp() -> String {
    let av = AvConfig {
        asc: Some(Bytes::from_static(ASC)),
        vps: None,
        sps: Some(Bytes::from_static(SPS)),
        pps: Some(Bytes::from_static(PPS)),
    };
    pack_sdp(&av, &SdpSession::new(&Config::default())).unwrap()
}

async fn start_server(runtime: &Runtime, router: Arc<Router>, auth: bool) -> (Arc<RtspServer>, String) {
    let mut server = RtspServer::new("127.0.0.1:0", router, runtime.clone());
    if auth {
        server = server.with_digest_auth("streamcore", "admin", "secret");
    }
    let server = Arc::new(server);
    let addr = server.listen().await.unwrap();
    tokio::spawn({
        let s = server.clone();
        async move { s.run_loop().await }
    });
    (server, addr.to_string())
}

async fn publish_then_play(over_tcp: bool) {
    let runtime = Runtime::default();
    let router = Arc::new(Router::default());
    let (server, addr) = start_server(&runtime, router.clone(), false).await;
    let url = format!("rtsp://{addr}/live/test");

    let push = PushSession::new(&runtime, over_tcp);
    push.push(&url, &stream_sdp()).await.unwrap();
    assert!(router.sdp.lock().is_some());

    let recorder = Arc::new(Recorder::default());
    let pull = PullSession::new(&runtime, over_tcp);
    pull.set_sink(recorder.clone());
    pull.pull(&url).await.unwrap();
    assert!(pull.sdp().unwrap().video.is_some());
    wait_until(|| router.subs.lock().len() == 1).await;

    let config = recorder.config.lock().clone().unwrap();
    assert_eq!(config.sps.as_deref(), Some(SPS));
    assert_eq!(config.asc.as_deref(), Some(ASC));

    // One small frame and one that needs fragmentation.
    let frames: Vec<Bytes> = (0..6u8)
        .map(|i| {
            let mut nalu = vec![if i == 0 { 0x65 } else { 0x41 }];
            nalu.extend(std::iter::repeat_n(i, if i % 2 == 0 { 100 } else { 3000 }));
            avc::join_avcc([&nalu[..]])
        })
        .collect();
    for (i, frame) in frames.iter().enumerate() {
        let pkt = AvPacket::new(AvPacketPt::Avc, i as i64 * 40, frame.clone());
        push.write_av_packet(&pkt).unwrap();
    }

    wait_until(|| recorder.packets.lock().iter().filter(|p| p.is_video()).count() >= frames.len() - 1).await;
    let got: Vec<AvPacket> = recorder.packets.lock().iter().filter(|p| p.is_video()).cloned().collect();
    assert_eq!(got[0].payload, frames[0]);
    assert_eq!(got[1].payload, frames[1]);
    assert_eq!(got[1].timestamp - got[0].timestamp, 40);

    pull.dispose();
    push.dispose();
    server.dispose();
}

#[tokio::test]
async fn publish_then_play_over_udp() {
    publish_then_play(false).await;
}

#[tokio::test]
async fn publish_then_play_interleaved() {
    publish_then_play(true).await;
}

#[tokio::test]
async fn describe_unknown_stream_is_not_found() {
    let runtime = Runtime::default();
    let (server, addr) = start_server(&runtime, Arc::new(Router::default()), false).await;

    let pull = PullSession::new(&runtime, true);
    let err = pull.pull(&format!("rtsp://{addr}/live/missing")).await.unwrap_err();
    assert!(matches!(err, Error::Status { code: 404, .. }), "{err}");
    server.dispose();
}

#[tokio::test]
async fn digest_auth() {
    let runtime = Runtime::default();
    let (server, addr) = start_server(&runtime, Arc::new(Router::default()), true).await;
    let sdp = stream_sdp();

    let anonymous = PushSession::new(&runtime, true);
    let err = anonymous.push(&format!("rtsp://{addr}/live/a"), &sdp).await.unwrap_err();
    assert!(matches!(err, Error::AuthRequired), "{err}");

    let wrong = PushSession::new(&runtime, true);
    let err = wrong
        .push(&format!("rtsp://admin:nope@{addr}/live/b"), &sdp)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthFailed), "{err}");

    let good = PushSession::new(&runtime, true);
    good.push(&format!("rtsp://admin:secret@{addr}/live/c"), &sdp).await.unwrap();
    good.dispose();
    server.dispose();
}

fn short_read_timeout() -> Runtime {
    Runtime::new(Config {
        read_av_timeout: Duration::from_millis(400),
        ..Config::default()
    })
}

#[tokio::test]
async fn silent_interleaved_pull_times_out() {
    let runtime = short_read_timeout();
    let router = Arc::new(Router::default());
    let (server, addr) = start_server(&runtime, router.clone(), false).await;
    let url = format!("rtsp://{addr}/live/quiet");

    let push = PushSession::new(&runtime, true);
    push.push(&url, &stream_sdp()).await.unwrap();

    let pull = PullSession::new(&runtime, true);
    pull.pull(&url).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), pull.wait()).await.unwrap();
    assert!(matches!(err, Error::Timeout(_)), "{err}");

    push.dispose();
    server.dispose();
}

#[tokio::test]
async fn silent_interleaved_publisher_is_dropped() {
    let runtime = short_read_timeout();
    let (server, addr) = start_server(&runtime, Arc::new(Router::default()), false).await;

    let push = PushSession::new(&runtime, true);
    push.push(&format!("rtsp://{addr}/live/quiet"), &stream_sdp()).await.unwrap();
    // The server hangs up; the pusher itself has no media deadline.
    let err = tokio::time::timeout(Duration::from_secs(5), push.wait()).await.unwrap();
    assert!(matches!(err, Error::TransportClosed | Error::Io(_)), "{err}");

    server.dispose();
}
