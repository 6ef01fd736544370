//! `relay`: pull from one URL and push to another, converting between
//! RTMP and RTSP where the two sides differ.
//!
//! | from | to   | path |
//! |------|------|------|
//! | rtmp | rtmp | messages forwarded as they are |
//! | rtmp | rtsp | [`RtmpToRtsp`]: SDP from the sequence headers, then RTP |
//! | rtsp | rtmp | aligned [`AvPacket`]s through [`AvPacketToRtmp`] |
//! | rtsp | rtsp | RTP forwarded as it is, announced with the source SDP |

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use streamcore::error::ProtocolErrorKind;
use streamcore::media::RtpPacket;
use streamcore::remux::{AvPacketToRtmp, RtmpToRtsp, RtmpToRtspObserver};
use streamcore::rtmp::{self, RtmpMessage, RtmpMessageSink};
use streamcore::rtsp;
use streamcore::{AvConfig, AvPacket, AvPacketSink, Error, Result, Runtime};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Rtmp,
    Rtsp,
}

impl Scheme {
    fn of(url: &str) -> Result<Self> {
        if url.starts_with("rtmp://") || url.starts_with("rtmps://") {
            Ok(Self::Rtmp)
        } else if url.starts_with("rtsp://") {
            Ok(Self::Rtsp)
        } else {
            Err(Error::invalid(ProtocolErrorKind::InvalidUrl(url.to_string())))
        }
    }
}

pub async fn run(runtime: Runtime, from: &str, to: &str, over_tcp: bool) -> Result<()> {
    tracing::info!(%from, %to, tcp = over_tcp, "relay");
    match (Scheme::of(from)?, Scheme::of(to)?) {
        (Scheme::Rtmp, Scheme::Rtmp) => rtmp_to_rtmp(&runtime, from, to).await,
        (Scheme::Rtmp, Scheme::Rtsp) => rtmp_to_rtsp(&runtime, from, to, over_tcp).await,
        (Scheme::Rtsp, Scheme::Rtmp) => rtsp_to_rtmp(&runtime, from, to, over_tcp).await,
        (Scheme::Rtsp, Scheme::Rtsp) => rtsp_to_rtsp(&runtime, from, to, over_tcp).await,
    }
}

/// Run until either side ends or Ctrl-C.
async fn until_done(input: impl Future<Output = Error>, output: impl Future<Output = Error>) {
    tokio::select! {
        e = input => tracing::info!(error = %e, "input ended"),
        e = output => tracing::info!(error = %e, "output ended"),
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
}

struct RtmpForward(Arc<rtmp::PushSession>);

impl RtmpMessageSink for RtmpForward {
    fn on_rtmp_message(&self, msg: &RtmpMessage) {
        if let Err(e) = self.0.write_message(msg) {
            tracing::debug!(error = %e, "message dropped");
        }
    }
}

async fn rtmp_to_rtmp(runtime: &Runtime, from: &str, to: &str) -> Result<()> {
    let push = Arc::new(rtmp::PushSession::new(runtime));
    push.push(to).await?;

    let pull = rtmp::PullSession::new(runtime);
    pull.set_sink(Arc::new(RtmpForward(push.clone())));
    if let Err(e) = pull.pull(from).await {
        push.dispose();
        return Err(e);
    }
    until_done(pull.wait(), push.wait()).await;
    pull.dispose();
    push.dispose();
    Ok(())
}

struct AvToRtmp {
    remuxer: Mutex<AvPacketToRtmp>,
    push: Arc<rtmp::PushSession>,
}

impl AvToRtmp {
    fn write_all(&self, msgs: Result<Vec<RtmpMessage>>) {
        match msgs {
            Ok(msgs) => {
                for msg in &msgs {
                    if let Err(e) = self.push.write_message(msg) {
                        tracing::debug!(error = %e, "message dropped");
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "remux failed"),
        }
    }
}

impl AvPacketSink for AvToRtmp {
    fn on_av_config(&self, config: &AvConfig) {
        let msgs = self.remuxer.lock().feed_av_config(config);
        self.write_all(msgs);
    }

    fn on_av_packet(&self, pkt: AvPacket) {
        let msgs = self.remuxer.lock().feed_av_packet(&pkt);
        self.write_all(msgs);
    }
}

async fn rtsp_to_rtmp(runtime: &Runtime, from: &str, to: &str, over_tcp: bool) -> Result<()> {
    let push = Arc::new(rtmp::PushSession::new(runtime));
    push.push(to).await?;

    let pull = rtsp::PullSession::new(runtime, over_tcp);
    pull.enable_aligner();
    pull.set_sink(Arc::new(AvToRtmp {
        remuxer: Mutex::new(AvPacketToRtmp::new()),
        push: push.clone(),
    }));
    if let Err(e) = pull.pull(from).await {
        push.dispose();
        return Err(e);
    }
    until_done(pull.wait(), push.wait()).await;
    pull.dispose();
    push.dispose();
    Ok(())
}

/// Forwards raw RTP once the output is negotiated; earlier packets are
/// dropped.
#[derive(Default)]
struct RtpForward {
    push: RwLock<Option<Arc<rtsp::PushSession>>>,
}

impl AvPacketSink for RtpForward {
    fn on_rtp_packet(&self, pkt: &RtpPacket) {
        let push = self.push.read().clone();
        if let Some(push) = push
            && let Err(e) = push.write_rtp_packet(pkt)
        {
            tracing::debug!(error = %e, "rtp dropped");
        }
    }
}

async fn rtsp_to_rtsp(runtime: &Runtime, from: &str, to: &str, over_tcp: bool) -> Result<()> {
    let forward = Arc::new(RtpForward::default());
    let pull = rtsp::PullSession::new(runtime, over_tcp);
    pull.set_sink(forward.clone());
    pull.pull(from).await?;
    let raw_sdp = match pull.sdp() {
        Some(sdp) => sdp.raw_sdp.clone(),
        None => {
            pull.dispose();
            return Err(Error::invalid(ProtocolErrorKind::InvalidSdp("source has no sdp")));
        }
    };

    let push = Arc::new(rtsp::PushSession::new(runtime, over_tcp));
    if let Err(e) = push.push(to, &raw_sdp).await {
        pull.dispose();
        return Err(e);
    }
    *forward.push.write() = Some(push.clone());
    until_done(pull.wait(), push.wait()).await;
    pull.dispose();
    push.dispose();
    Ok(())
}

enum RtspEvent {
    Sdp(String),
    Rtp(RtpPacket),
}

/// Hands remuxer output to the task that owns the RTSP push session.
struct RtspFeed(mpsc::Sender<RtspEvent>);

impl RtmpToRtspObserver for RtspFeed {
    fn on_sdp(&self, raw_sdp: &str) {
        if self.0.try_send(RtspEvent::Sdp(raw_sdp.to_string())).is_err() {
            tracing::warn!("sdp dropped");
        }
    }

    fn on_rtp_packet(&self, pkt: &RtpPacket) {
        if self.0.try_send(RtspEvent::Rtp(pkt.clone())).is_err() {
            tracing::debug!("rtp dropped");
        }
    }
}

struct RtmpRemux(Mutex<RtmpToRtsp>);

impl RtmpMessageSink for RtmpRemux {
    fn on_rtmp_message(&self, msg: &RtmpMessage) {
        if let Err(e) = self.0.lock().feed_rtmp_message(msg) {
            tracing::debug!(error = %e, "remux failed");
        }
    }
}

async fn rtmp_to_rtsp(runtime: &Runtime, from: &str, to: &str, over_tcp: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(runtime.config.write_channel_capacity);
    let remuxer = RtmpToRtsp::new(&runtime.config, Arc::new(RtspFeed(tx)));
    let pull = rtmp::PullSession::new(runtime);
    pull.set_sink(Arc::new(RtmpRemux(Mutex::new(remuxer))));
    pull.pull(from).await?;

    let raw_sdp = loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(RtspEvent::Sdp(sdp)) => break sdp,
                Some(RtspEvent::Rtp(_)) => continue,
                None => return Err(Error::TransportClosed),
            },
            e = pull.wait() => return Err(e),
        }
    };

    let push = rtsp::PushSession::new(runtime, over_tcp);
    if let Err(e) = push.push(to, &raw_sdp).await {
        pull.dispose();
        return Err(e);
    }
    let forward = async {
        while let Some(ev) = rx.recv().await {
            if let RtspEvent::Rtp(pkt) = ev
                && let Err(e) = push.write_rtp_packet(&pkt)
            {
                tracing::debug!(error = %e, "rtp dropped");
            }
        }
        Error::TransportClosed
    };
    until_done(
        async {
            tokio::select! {
                e = pull.wait() => e,
                e = forward => e,
            }
        },
        push.wait(),
    )
    .await;
    pull.dispose();
    push.dispose();
    Ok(())
}
