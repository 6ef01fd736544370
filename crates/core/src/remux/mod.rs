//! Conversions between the RTMP message form, protocol-neutral
//! [`AvPacket`](crate::avpacket::AvPacket)s and RTP.

mod av2rtmp;
mod rtmp2av;
mod rtmp2rtsp;

pub use av2rtmp::AvPacketToRtmp;
pub use rtmp2av::{RtmpAvEvent, RtmpToAv};
pub use rtmp2rtsp::{RtmpToRtsp, RtmpToRtspObserver};
