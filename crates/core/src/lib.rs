pub mod aligner;
pub mod amf0;
pub mod avpacket;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod httpflv;
pub mod media;
pub mod remux;
pub mod rtmp;
pub mod rtsp;
pub mod sdp;
pub mod session;
pub mod transport;
pub mod url;

pub use aligner::AvPacketQueue;
pub use avpacket::{AvConfig, AvPacket, AvPacketPt, AvPacketSink};
pub use config::{Config, Runtime};
pub use error::{Error, ProtocolErrorKind, Result};
pub use session::{Session, SessionRole, StatSnapshot};
