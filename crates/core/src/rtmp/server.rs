use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::server_session::ServerSession;
use crate::amf0::Amf0Object;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::session::{Closer, Session};

/// Hooks through which an embedder routes RTMP sessions by stream name.
pub trait RtmpServerObserver: Send + Sync {
    /// `connect` arrived with this command object.
    fn on_rtmp_connect(&self, _session: &Arc<ServerSession>, _object: &Amf0Object) {}

    /// `publish`. Returning an error ends the session, e.g. when the
    /// stream name is already taken.
    fn on_new_rtmp_pub_session(&self, _session: &Arc<ServerSession>) -> Result<()> {
        Ok(())
    }

    fn on_del_rtmp_pub_session(&self, _session: &Arc<ServerSession>) {}

    /// `play` was answered with `NetStream.Play.Start`.
    fn on_new_rtmp_sub_session(&self, _session: &Arc<ServerSession>) -> Result<()> {
        Ok(())
    }

    fn on_del_rtmp_sub_session(&self, _session: &Arc<ServerSession>) {}
}

pub struct RtmpServer {
    addr: String,
    runtime: Runtime,
    observer: Arc<dyn RtmpServerObserver>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    connections: Arc<Mutex<HashMap<String, Arc<Closer>>>>,
    closer: Arc<Closer>,
}

impl RtmpServer {
    pub fn new(addr: &str, observer: Arc<dyn RtmpServerObserver>, runtime: Runtime) -> Self {
        Self {
            addr: addr.to_string(),
            runtime,
            observer,
            listener: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            closer: Arc::new(Closer::new()),
        }
    }

    pub async fn listen(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?;
        *self.listener.lock() = Some(Arc::new(listener));
        tracing::info!(addr = %local, "rtmp server listening");
        Ok(local)
    }

    pub async fn run_loop(&self) -> Result<()> {
        let existing = self.listener.lock().clone();
        let listener = match existing {
            Some(l) => l,
            None => {
                self.listen().await?;
                self.listener.lock().clone().ok_or(Error::TransportClosed)?
            }
        };

        loop {
            let (stream, remote) = tokio::select! {
                _ = self.closer.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "rtmp accept error");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "set_nodelay failed");
            }

            let runtime = self.runtime.clone();
            let observer = self.observer.clone();
            let connections = self.connections.clone();
            let server_closer = self.closer.clone();
            tokio::spawn(async move {
                let (session, reader) = match ServerSession::accept(stream, remote, runtime, observer).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "rtmp handshake failed");
                        return;
                    }
                };
                let key = session.unique_key().to_string();
                connections.lock().insert(key.clone(), session.closer());
                if server_closer.is_closed() {
                    session.dispose();
                }
                let _ = session.run_loop(reader).await;
                connections.lock().remove(&key);
            });
        }
        tracing::info!(addr = %self.addr, "rtmp server stopped");
        Ok(())
    }

    pub fn dispose(&self) {
        if !self.closer.close() {
            return;
        }
        let closers: Vec<Arc<Closer>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for c in closers {
            c.close();
        }
    }
}
