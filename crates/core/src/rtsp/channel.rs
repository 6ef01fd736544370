use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::reader::pack_interleaved;
use crate::error::{Error, Result};
use crate::transport::UdpConnection;

/// Where one medium's RTP and RTCP go after SETUP.
///
/// The interleaved variant only holds the sending half of the command
/// connection's write queue, so data sessions never reference the command
/// session itself.
#[derive(Debug, Clone)]
pub enum MediaChannel {
    Udp {
        rtp: Arc<UdpConnection>,
        rtcp: Arc<UdpConnection>,
    },
    Interleaved {
        writer: mpsc::Sender<Bytes>,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl MediaChannel {
    pub fn is_udp(&self) -> bool {
        matches!(self, Self::Udp { .. })
    }

    pub fn send_rtp(&self, data: &[u8]) -> Result<()> {
        match self {
            Self::Udp { rtp, .. } => rtp.try_send(data).map(|_| ()),
            Self::Interleaved {
                writer, rtp_channel, ..
            } => queue(writer, *rtp_channel, data),
        }
    }

    pub fn send_rtcp(&self, data: &[u8]) -> Result<()> {
        match self {
            Self::Udp { rtcp, .. } => rtcp.try_send(data).map(|_| ()),
            Self::Interleaved {
                writer,
                rtcp_channel,
                ..
            } => queue(writer, *rtcp_channel, data),
        }
    }
}

fn queue(writer: &mpsc::Sender<Bytes>, channel: u8, data: &[u8]) -> Result<()> {
    match writer.try_send(pack_interleaved(channel, data)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(Error::ResourceExhausted(format!(
            "interleaved write queue full, channel {channel}"
        ))),
        Err(TrySendError::Closed(_)) => Err(Error::TransportClosed),
    }
}
