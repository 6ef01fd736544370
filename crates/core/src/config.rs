//! Library-wide configuration and the shared runtime handle.
//!
//! Everything that used to be a process-wide mutable global (library
//! strings, default chunk sizes, timeouts, the UDP port pool and the
//! session-id generator) hangs off a [`Runtime`]. Sessions receive a
//! `Runtime` at construction time; [`Runtime::global`] exists for callers
//! that do not care to build their own.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::session::IdGenerator;
use crate::transport::udp::UdpPortPool;

/// Tunables shared by every session created from the same [`Runtime`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Short library name, used in `Server`/`User-Agent` headers, SDP
    /// `a=tool` and the RTMP handshake watermark.
    pub library_name: String,
    pub library_version: String,

    /// Outbound RTMP chunk size announced with SetChunkSize.
    pub rtmp_chunk_size: u32,
    /// Window acknowledgement size announced to RTMP peers.
    pub rtmp_window_ack_size: u32,
    /// Peer bandwidth announced to RTMP peers (limit type dynamic).
    pub rtmp_peer_bandwidth: u32,

    /// Deadline for the RTMP handshake and TCP connect.
    pub handshake_timeout: Duration,
    /// Deadline for each RTSP request/response and RTMP command stage.
    pub command_timeout: Duration,
    /// A session that receives no media for this long is torn down.
    pub read_av_timeout: Duration,

    /// Inclusive UDP port range for RTP/RTCP pairs.
    pub udp_port_min: u16,
    pub udp_port_max: u16,

    /// Maximum RTP payload size produced by the packers.
    pub rtp_max_payload_size: usize,
    /// Reorder window of each RTP unpacker, in packets.
    pub rtp_unpacker_capacity: usize,

    /// Per-medium capacity of the audio/video aligner.
    pub aligner_queue_capacity: usize,
    /// Whether a backward timestamp jump resets both aligner queues.
    pub aligner_rebase_on_backward_jump: bool,

    /// Interval between RTSP client keepalive requests.
    pub rtsp_keepalive_interval: Duration,

    /// Capacity of the per-connection outbound queue.
    pub write_channel_capacity: usize,
    /// Pending bytes at which the merge writer flushes on its own.
    pub merge_write_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_name: "streamcore".to_string(),
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            rtmp_chunk_size: 4096,
            rtmp_window_ack_size: 5_000_000,
            rtmp_peer_bandwidth: 5_000_000,
            handshake_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            read_av_timeout: Duration::from_secs(120),
            udp_port_min: 30000,
            udp_port_max: 60000,
            rtp_max_payload_size: 1400,
            rtp_unpacker_capacity: 256,
            aligner_queue_capacity: 128,
            aligner_rebase_on_backward_jump: true,
            rtsp_keepalive_interval: Duration::from_secs(10),
            write_channel_capacity: 1024,
            merge_write_threshold: 16 * 1024,
        }
    }
}

impl Config {
    /// `name/version`, as it appears in `Server` and `User-Agent` headers.
    pub fn library_tag(&self) -> String {
        format!("{}/{}", self.library_name, self.library_version)
    }
}

/// Shared handle that sessions and servers are built from.
///
/// Cloning is cheap; clones share the same port pool and id generator.
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<Config>,
    pub ports: Arc<UdpPortPool>,
    pub ids: Arc<IdGenerator>,
}

static GLOBAL: LazyLock<Runtime> = LazyLock::new(|| Runtime::new(Config::default()));

impl Runtime {
    pub fn new(config: Config) -> Self {
        let ports = UdpPortPool::new(config.udp_port_min, config.udp_port_max);
        tracing::debug!(
            library = %config.library_tag(),
            udp_min = config.udp_port_min,
            udp_max = config.udp_port_max,
            "runtime created"
        );
        Self {
            config: Arc::new(config),
            ports: Arc::new(ports),
            ids: Arc::new(IdGenerator::default()),
        }
    }

    /// Process-wide runtime with default configuration.
    pub fn global() -> &'static Runtime {
        &GLOBAL
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_tag_joins_name_and_version() {
        let cfg = Config {
            library_name: "lib".into(),
            library_version: "1.2.3".into(),
            ..Config::default()
        };
        assert_eq!(cfg.library_tag(), "lib/1.2.3");
    }

    #[test]
    fn runtime_clones_share_state() {
        let rt = Runtime::default();
        let cloned = rt.clone();
        assert!(Arc::ptr_eq(&rt.ports, &cloned.ports));
        assert!(Arc::ptr_eq(&rt.ids, &cloned.ids));
    }

    #[test]
    fn global_runtime_uses_defaults() {
        assert_eq!(Runtime::global().config.rtmp_chunk_size, 4096);
        assert_eq!(Runtime::global().config.udp_port_min, 30000);
    }
}
