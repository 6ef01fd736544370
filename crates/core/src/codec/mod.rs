//! Codec bitstream helpers shared by the RTP, RTMP and FLV layers.
//!
//! | Codec | Module | Reference |
//! |-------|--------|-----------|
//! | H.264 | [`avc`] | ISO 14496-10, ISO 14496-15 §5.3 |
//! | H.265 | [`hevc`] | ISO 23008-2, ISO 14496-15 §8.3 |
//! | AAC   | [`aac`] | ISO 14496-3 §1.6 |

pub mod aac;
pub mod avc;
pub mod hevc;
