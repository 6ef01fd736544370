//! RTP/RTCP and codec payload formats.
//!
//! ## Receiving
//!
//! An [`unpacker::RtpUnpacker`] keeps incoming packets of one stream in an
//! [`list::RtpPacketList`] ordered by wrap-aware sequence number and asks a
//! codec-specific [`unpacker::UnpackerProtocol`] to turn the head of the list
//! into [`AvPacket`](crate::avpacket::AvPacket)s.
//!
//! ## Sending
//!
//! An [`packer::RtpPacker`] splits each frame with a codec-specific
//! [`packer::PayloadPacker`], then stamps sequence number, timestamp and the
//! marker bit (set on the last packet of a frame, RFC 3550 §5.1).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) |
//! | AAC   | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) |
//! | G.711 / Opus | [`pcm`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) |

pub mod aac;
pub mod h264;
pub mod h265;
pub mod list;
pub mod packer;
pub mod pcm;
pub mod rtcp;
pub mod rtp;
pub mod unpacker;
pub mod video;

pub use packer::{PayloadPacker, RtpPacker, new_packer};
pub use rtp::{RtpHeader, RtpPacket, compare_seq, sub_seq};
pub use unpacker::{RtpUnpacker, UnpackerProtocol, new_unpacker};
