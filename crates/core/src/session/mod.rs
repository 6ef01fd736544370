//! Per-session bookkeeping shared by every protocol.
//!
//! Each RTMP, RTSP or HTTP-FLV session owns a [`SessionInfo`]: a unique key
//! such as `RTMPPUBSUB1`, the URL it serves, byte counters and bitrates.
//! The [`Session`] trait exposes that state uniformly so an outer layer can
//! poll statistics and liveness without knowing the protocol.

pub mod closer;
pub mod stat;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::url::UrlContext;
pub use closer::Closer;
pub use stat::{Protocol, SessionRole, SessionStat, StatSnapshot};

/// Unique-key prefixes, one per session flavour.
pub mod prefix {
    pub const RTMP_SERVER: &str = "RTMPPUBSUB";
    pub const RTMP_PUSH: &str = "RTMPPUSH";
    pub const RTMP_PULL: &str = "RTMPPULL";
    pub const RTSP_SERVER_COMMAND: &str = "RTSPSRVCMD";
    pub const RTSP_PUB: &str = "RTSPPUB";
    pub const RTSP_SUB: &str = "RTSPSUB";
    pub const RTSP_PUSH: &str = "RTSPPUSH";
    pub const RTSP_PULL: &str = "RTSPPULL";
    pub const HTTPFLV_SUB: &str = "FLVSUB";
}

/// Hands out `<PREFIX><n>` keys with an independent counter per prefix.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl IdGenerator {
    pub fn next(&self, prefix: &'static str) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(prefix).or_insert(0);
        *counter += 1;
        format!("{prefix}{counter}")
    }
}

/// Identity, URL and counters of one session.
#[derive(Debug)]
pub struct SessionInfo {
    unique_key: String,
    stat: Arc<SessionStat>,
    url: RwLock<Option<UrlContext>>,
}

impl SessionInfo {
    pub fn new(unique_key: String, protocol: Protocol, role: SessionRole) -> Self {
        let stat = Arc::new(SessionStat::new(unique_key.clone(), protocol, role));
        Self {
            unique_key,
            stat,
            url: RwLock::new(None),
        }
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    /// Shared handle to the byte counters, for reader and writer tasks.
    pub fn stat(&self) -> &Arc<SessionStat> {
        &self.stat
    }

    pub fn set_url(&self, url: UrlContext) {
        *self.url.write() = Some(url);
    }

    pub fn url_context(&self) -> Option<UrlContext> {
        self.url.read().clone()
    }

    fn url_field(&self, f: impl FnOnce(&UrlContext) -> &str) -> String {
        self.url.read().as_ref().map(|u| f(u).to_string()).unwrap_or_default()
    }
}

/// Uniform read-only surface over any session.
///
/// Implementors only provide [`info`](Self::info); everything else is
/// derived from it.
pub trait Session {
    fn info(&self) -> &SessionInfo;

    fn unique_key(&self) -> &str {
        self.info().unique_key()
    }

    fn url(&self) -> String {
        self.info().url_field(|u| &u.raw_url)
    }

    fn app_name(&self) -> String {
        self.info().url_field(|u| &u.path_without_last_item)
    }

    fn stream_name(&self) -> String {
        self.info().url_field(|u| &u.last_item_of_path)
    }

    fn raw_query(&self) -> String {
        self.info().url_field(|u| &u.raw_query)
    }

    fn get_stat(&self) -> StatSnapshot {
        self.info().stat().snapshot()
    }

    /// Recompute bitrates over the last `interval_sec` seconds.
    fn update_stat(&self, interval_sec: u32) {
        self.info().stat().update(interval_sec)
    }

    /// `(read_alive, write_alive)`: whether each counter moved since the
    /// previous call.
    fn is_alive(&self) -> (bool, bool) {
        self.info().stat().is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::parse_rtmp_url;

    #[test]
    fn ids_count_per_prefix() {
        let ids = IdGenerator::default();
        assert_eq!(ids.next(prefix::RTMP_PUSH), "RTMPPUSH1");
        assert_eq!(ids.next(prefix::RTMP_PUSH), "RTMPPUSH2");
        assert_eq!(ids.next(prefix::RTSP_PULL), "RTSPPULL1");
    }

    struct Dummy(SessionInfo);

    impl Session for Dummy {
        fn info(&self) -> &SessionInfo {
            &self.0
        }
    }

    #[test]
    fn surface_reads_url_fields() {
        let s = Dummy(SessionInfo::new(
            "RTMPPULL1".into(),
            Protocol::Rtmp,
            SessionRole::Pull,
        ));
        assert_eq!(s.stream_name(), "");

        s.0.set_url(parse_rtmp_url("rtmp://127.0.0.1/live/test?token=1").unwrap());
        assert_eq!(s.unique_key(), "RTMPPULL1");
        assert_eq!(s.app_name(), "live");
        assert_eq!(s.stream_name(), "test");
        assert_eq!(s.raw_query(), "token=1");
        assert_eq!(s.url(), "rtmp://127.0.0.1/live/test?token=1");
    }
}
