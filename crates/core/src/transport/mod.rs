//! Socket plumbing shared by all protocols.
//!
//! - **UDP** ([`udp`]): RTP/RTCP sockets bound from an even/odd port pool.
//!   Each RTSP track owns one pair; ports go back to the pool when both
//!   sockets of the pair are dropped.
//!
//! - **Merged writes** ([`merge_writer`]): TCP sessions queue outbound
//!   blocks on a channel; a single writer task coalesces them into
//!   vectored writes.

pub mod merge_writer;
pub mod udp;

pub use merge_writer::{MergeWriter, spawn_write_loop};
pub use udp::{UdpConnection, UdpPortPool};
