use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::session::Closer;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// Hands out (even, even + 1) port pairs for RTP/RTCP (RFC 3550 §11).
///
/// A pair stays reserved until both [`UdpConnection`]s built on it are
/// dropped. Ports that are taken by another process are skipped.
#[derive(Debug)]
pub struct UdpPortPool {
    min: u16,
    max: u16,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    next: u16,
    in_use: HashSet<u16>,
}

/// Reservation of one port pair; releases it on drop.
#[derive(Debug)]
struct PortLease {
    pool: Arc<UdpPortPool>,
    rtp_port: u16,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.rtp_port);
    }
}

impl UdpPortPool {
    pub fn new(min: u16, max: u16) -> Self {
        let min = min.saturating_add(min % 2);
        Self {
            min,
            max,
            state: Mutex::new(PoolState {
                next: min,
                in_use: HashSet::new(),
            }),
        }
    }

    fn pair_count(&self) -> usize {
        if self.max <= self.min {
            return 0;
        }
        (usize::from(self.max - self.min) + 1) / 2
    }

    fn reserve_candidate(&self) -> Option<u16> {
        let mut state = self.state.lock();
        for _ in 0..self.pair_count() {
            let mut port = state.next;
            if port < self.min || port >= self.max {
                port = self.min;
            }
            state.next = port.saturating_add(2);
            if !state.in_use.contains(&port) {
                state.in_use.insert(port);
                return Some(port);
            }
        }
        None
    }

    fn release(&self, rtp_port: u16) {
        self.state.lock().in_use.remove(&rtp_port);
        tracing::trace!(rtp_port, "released udp port pair");
    }

    /// Bind an RTP socket on an even port and an RTCP socket on the next
    /// port, both on all interfaces.
    pub async fn acquire_pair(self: &Arc<Self>) -> Result<(UdpConnection, UdpConnection)> {
        for _ in 0..self.pair_count() {
            let Some(rtp_port) = self.reserve_candidate() else {
                break;
            };
            let lease = Arc::new(PortLease {
                pool: self.clone(),
                rtp_port,
            });

            let rtp = match UdpSocket::bind(("0.0.0.0", rtp_port)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(rtp_port, error = %e, "rtp port busy, trying next pair");
                    continue;
                }
            };
            let rtcp = match UdpSocket::bind(("0.0.0.0", rtp_port + 1)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(rtcp_port = rtp_port + 1, error = %e, "rtcp port busy, trying next pair");
                    continue;
                }
            };

            tracing::debug!(rtp_port, rtcp_port = rtp_port + 1, "acquired udp port pair");
            return Ok((
                UdpConnection::new(rtp, rtp_port, Some(lease.clone())),
                UdpConnection::new(rtcp, rtp_port + 1, Some(lease)),
            ));
        }
        Err(Error::ResourceExhausted(format!(
            "no free udp port pair in {}-{}",
            self.min, self.max
        )))
    }
}

/// One bound UDP socket with an optional fixed remote peer.
#[derive(Debug)]
pub struct UdpConnection {
    socket: UdpSocket,
    local_port: u16,
    remote: Mutex<Option<SocketAddr>>,
    _lease: Option<Arc<PortLease>>,
}

impl UdpConnection {
    fn new(socket: UdpSocket, local_port: u16, lease: Option<Arc<PortLease>>) -> Self {
        Self {
            socket,
            local_port,
            remote: Mutex::new(None),
            _lease: lease,
        }
    }

    /// Bind outside the pool, e.g. `127.0.0.1:0`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_port = socket.local_addr()?.port();
        Ok(Self::new(socket, local_port, None))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn set_remote(&self, addr: SocketAddr) {
        *self.remote.lock() = Some(addr);
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    /// Send to the configured remote. Without one, the datagram is dropped.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        match self.remote() {
            Some(addr) => Ok(self.socket.send_to(data, addr).await?),
            None => {
                tracing::trace!(port = self.local_port, "no remote yet, dropping datagram");
                Ok(0)
            }
        }
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(data, addr).await?)
    }

    /// Non-blocking send to the configured remote. A full socket buffer
    /// drops the datagram, as a congested network would.
    pub fn try_send(&self, data: &[u8]) -> Result<usize> {
        let Some(addr) = self.remote() else {
            return Ok(0);
        };
        match self.socket.try_send_to(data, addr) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::trace!(port = self.local_port, "udp send buffer full, dropping datagram");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receive datagrams until `closer` fires, `idle_timeout` elapses with
    /// nothing received, or the socket fails.
    ///
    /// Closing yields `Ok(())`; a timeout yields [`Error::Timeout`].
    pub async fn read_loop<F>(
        &self,
        closer: &Closer,
        idle_timeout: Option<Duration>,
        mut on_datagram: F,
    ) -> Result<()>
    where
        F: FnMut(Bytes, SocketAddr),
    {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let recv = async {
                match idle_timeout {
                    Some(t) => tokio::time::timeout(t, self.socket.recv_from(&mut buf))
                        .await
                        .map_err(|_| Error::Timeout("udp read"))?
                        .map_err(Error::from),
                    None => self.socket.recv_from(&mut buf).await.map_err(Error::from),
                }
            };
            let (n, from) = tokio::select! {
                _ = closer.closed() => return Ok(()),
                r = recv => r?,
            };
            on_datagram(Bytes::copy_from_slice(&buf[..n]), from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pairs_are_even_and_adjacent() {
        let pool = Arc::new(UdpPortPool::new(41001, 41100));
        let (rtp, rtcp) = pool.acquire_pair().await.unwrap();
        assert_eq!(rtp.local_port() % 2, 0);
        assert_eq!(rtcp.local_port(), rtp.local_port() + 1);
    }

    #[tokio::test]
    async fn live_pairs_are_never_handed_out_twice() {
        let pool = Arc::new(UdpPortPool::new(41200, 41203));
        let (a_rtp, _a_rtcp) = pool.acquire_pair().await.unwrap();
        let (b_rtp, _b_rtcp) = pool.acquire_pair().await.unwrap();
        assert_ne!(a_rtp.local_port(), b_rtp.local_port());

        let err = pool.acquire_pair().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn last_pair_below_odd_max_is_used() {
        let pool = Arc::new(UdpPortPool::new(41400, 41405));
        let mut ports = Vec::new();
        let mut held = Vec::new();
        for _ in 0..3 {
            let (rtp, rtcp) = pool.acquire_pair().await.unwrap();
            ports.push(rtp.local_port());
            held.push((rtp, rtcp));
        }
        ports.sort_unstable();
        assert_eq!(ports, vec![41400, 41402, 41404]);
        assert!(pool.acquire_pair().await.is_err());
    }

    #[tokio::test]
    async fn pair_returns_to_pool_after_both_sockets_drop() {
        let pool = Arc::new(UdpPortPool::new(41300, 41301));
        let (rtp, rtcp) = pool.acquire_pair().await.unwrap();
        let port = rtp.local_port();

        drop(rtp);
        assert!(pool.acquire_pair().await.is_err(), "rtcp still holds the lease");

        drop(rtcp);
        let (again, _) = pool.acquire_pair().await.unwrap();
        assert_eq!(again.local_port(), port);
    }

    #[tokio::test]
    async fn send_without_remote_is_dropped() {
        let conn = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(conn.send(b"x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn try_send_reaches_remote() {
        let rx = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        let tx = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(tx.try_send(b"x").unwrap(), 0);
        tx.set_remote(format!("127.0.0.1:{}", rx.local_port()).parse().unwrap());
        assert_eq!(tx.try_send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        let (n, _) = rx.socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn read_loop_delivers_then_stops_on_close() {
        let rx = Arc::new(UdpConnection::bind("127.0.0.1:0").await.unwrap());
        let tx = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        tx.set_remote(format!("127.0.0.1:{}", rx.local_port()).parse().unwrap());

        let closer = Arc::new(Closer::new());
        let task = {
            let (rx, closer) = (rx.clone(), closer.clone());
            tokio::spawn(async move {
                let mut got = Vec::new();
                let res = rx
                    .read_loop(&closer, None, |b, _| {
                        got.push(b);
                        closer.close();
                    })
                    .await;
                (res, got)
            })
        };

        tx.send(b"hello").await.unwrap();
        let (res, got) = task.await.unwrap();
        assert!(res.is_ok());
        assert_eq!(got, vec![Bytes::from_static(b"hello")]);
    }

    #[tokio::test]
    async fn read_loop_times_out_when_idle() {
        let conn = UdpConnection::bind("127.0.0.1:0").await.unwrap();
        let closer = Closer::new();
        let err = conn
            .read_loop(&closer, Some(Duration::from_millis(20)), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }
}
