use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rtmp,
    Rtsp,
    HttpFlv,
}

/// What the session does with media, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Remote peer publishes to us.
    Pub,
    /// Remote peer plays from us.
    Sub,
    /// We publish to a remote server.
    Push,
    /// We play from a remote server.
    Pull,
    /// Server-side RTMP session before publish/play is known.
    PubSub,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtmp => write!(f, "RTMP"),
            Self::Rtsp => write!(f, "RTSP"),
            Self::HttpFlv => write!(f, "FLV"),
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pub => write!(f, "PUB"),
            Self::Sub => write!(f, "SUB"),
            Self::Push => write!(f, "PUSH"),
            Self::Pull => write!(f, "PULL"),
            Self::PubSub => write!(f, "PUBSUB"),
        }
    }
}

/// Point-in-time copy of a session's statistics.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    pub session_id: String,
    pub protocol: Protocol,
    pub role: SessionRole,
    pub remote_addr: String,
    pub start_time: SystemTime,
    pub read_bytes_sum: u64,
    pub wrote_bytes_sum: u64,
    /// kbit/s over the last [`SessionStat::update`] interval.
    pub read_bitrate_kbits: u32,
    pub write_bitrate_kbits: u32,
    /// The direction that carries media for this role.
    pub bitrate_kbits: u32,
}

#[derive(Debug, Default)]
struct Rates {
    prev_read: u64,
    prev_wrote: u64,
    read_kbits: u32,
    write_kbits: u32,
}

/// Lock-free byte counters plus the derived bitrate state.
///
/// The counters are bumped from reader/writer tasks; `update` and
/// `is_alive` are expected to be driven by a periodic outer timer.
#[derive(Debug)]
pub struct SessionStat {
    session_id: String,
    protocol: Protocol,
    role: Mutex<SessionRole>,
    remote_addr: Mutex<String>,
    start_time: SystemTime,
    read_bytes: AtomicU64,
    wrote_bytes: AtomicU64,
    rates: Mutex<Rates>,
    stale: Mutex<(u64, u64)>,
}

impl SessionStat {
    pub fn new(session_id: String, protocol: Protocol, role: SessionRole) -> Self {
        Self {
            session_id,
            protocol,
            role: Mutex::new(role),
            remote_addr: Mutex::new(String::new()),
            start_time: SystemTime::now(),
            read_bytes: AtomicU64::new(0),
            wrote_bytes: AtomicU64::new(0),
            rates: Mutex::new(Rates::default()),
            stale: Mutex::new((0, 0)),
        }
    }

    pub fn add_read_bytes(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_wrote_bytes(&self, n: usize) {
        self.wrote_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn wrote_bytes(&self) -> u64 {
        self.wrote_bytes.load(Ordering::Relaxed)
    }

    pub fn set_role(&self, role: SessionRole) {
        *self.role.lock() = role;
    }

    pub fn role(&self) -> SessionRole {
        *self.role.lock()
    }

    pub fn set_remote_addr(&self, addr: String) {
        *self.remote_addr.lock() = addr;
    }

    /// Bitrate = delta bytes * 8 / 1024 / interval.
    pub fn update(&self, interval_sec: u32) {
        let interval = u64::from(interval_sec.max(1));
        let read = self.read_bytes();
        let wrote = self.wrote_bytes();

        let mut rates = self.rates.lock();
        rates.read_kbits = (read.saturating_sub(rates.prev_read) * 8 / 1024 / interval) as u32;
        rates.write_kbits = (wrote.saturating_sub(rates.prev_wrote) * 8 / 1024 / interval) as u32;
        rates.prev_read = read;
        rates.prev_wrote = wrote;
    }

    /// Compares against a snapshot older than the one `update` keeps, so
    /// liveness polling and bitrate polling can run at different periods.
    pub fn is_alive(&self) -> (bool, bool) {
        let read = self.read_bytes();
        let wrote = self.wrote_bytes();
        let mut stale = self.stale.lock();
        let alive = (read != stale.0, wrote != stale.1);
        *stale = (read, wrote);
        alive
    }

    pub fn snapshot(&self) -> StatSnapshot {
        let role = self.role();
        let (read_kbits, write_kbits) = {
            let rates = self.rates.lock();
            (rates.read_kbits, rates.write_kbits)
        };
        let bitrate_kbits = match role {
            SessionRole::Pub | SessionRole::Pull | SessionRole::PubSub => read_kbits,
            SessionRole::Sub | SessionRole::Push => write_kbits,
        };
        StatSnapshot {
            session_id: self.session_id.clone(),
            protocol: self.protocol,
            role,
            remote_addr: self.remote_addr.lock().clone(),
            start_time: self.start_time,
            read_bytes_sum: self.read_bytes(),
            wrote_bytes_sum: self.wrote_bytes(),
            read_bitrate_kbits: read_kbits,
            write_bitrate_kbits: write_kbits,
            bitrate_kbits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> SessionStat {
        SessionStat::new("RTSPPUB1".into(), Protocol::Rtsp, SessionRole::Pub)
    }

    #[test]
    fn bitrate_is_kbits_per_second() {
        let s = stat();
        s.add_read_bytes(128 * 1024);
        s.update(2);
        let snap = s.snapshot();
        assert_eq!(snap.read_bitrate_kbits, 512);
        assert_eq!(snap.bitrate_kbits, 512);
        assert_eq!(snap.write_bitrate_kbits, 0);

        s.update(2);
        assert_eq!(s.snapshot().read_bitrate_kbits, 0, "no new bytes, no bitrate");
    }

    #[test]
    fn zero_interval_does_not_divide_by_zero() {
        let s = stat();
        s.add_wrote_bytes(1024);
        s.update(0);
        assert_eq!(s.snapshot().write_bitrate_kbits, 8);
    }

    #[test]
    fn liveness_tracks_counter_movement() {
        let s = stat();
        assert_eq!(s.is_alive(), (false, false));
        s.add_read_bytes(10);
        assert_eq!(s.is_alive(), (true, false));
        assert_eq!(s.is_alive(), (false, false));
        s.add_wrote_bytes(1);
        assert_eq!(s.is_alive(), (false, true));
    }

    #[test]
    fn liveness_is_independent_of_bitrate_updates() {
        let s = stat();
        s.add_read_bytes(10);
        s.update(1);
        assert_eq!(s.is_alive(), (true, false));
    }

    #[test]
    fn bitrate_direction_follows_role() {
        let s = SessionStat::new("RTMPPUSH1".into(), Protocol::Rtmp, SessionRole::Push);
        s.add_wrote_bytes(1024);
        s.add_read_bytes(10 * 1024);
        s.update(1);
        assert_eq!(s.snapshot().bitrate_kbits, 8);
    }
}
