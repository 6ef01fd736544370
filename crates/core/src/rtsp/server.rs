use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::auth::DigestAuthenticator;
use super::pub_session::PubSession;
use super::server_command_session::ServerCommandSession;
use super::sub_session::SubSession;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::session::{Closer, Session};

/// Hooks through which an embedder routes RTSP sessions.
///
/// The server does not know which publisher feeds which player; the
/// observer decides. Every method has a permissive or empty default.
pub trait RtspServerObserver: Send + Sync {
    /// A TCP connection was accepted.
    fn on_new_rtsp_session_connect(&self, _session_key: &str, _remote: SocketAddr) {}

    /// ANNOUNCE succeeded. Returning an error answers 406 and drops the
    /// session.
    fn on_new_rtsp_pub_session(&self, _session: &Arc<PubSession>) -> Result<()> {
        Ok(())
    }

    fn on_del_rtsp_pub_session(&self, _session: &Arc<PubSession>) {}

    /// DESCRIBE for the session's URL. Return the SDP to serve, or `None`
    /// for 404.
    fn on_new_rtsp_sub_session_describe(&self, _session: &Arc<SubSession>) -> Option<String> {
        None
    }

    /// PLAY was answered; media may flow from now on. An error closes the
    /// connection.
    fn on_new_rtsp_sub_session_play(&self, _session: &Arc<SubSession>) -> Result<()> {
        Ok(())
    }

    fn on_del_rtsp_sub_session(&self, _session: &Arc<SubSession>) {}
}

/// RTSP listener.
///
/// Each accepted connection runs as its own task; [`dispose`](Self::dispose)
/// stops accepting and closes every live connection.
pub struct RtspServer {
    addr: String,
    runtime: Runtime,
    observer: Arc<dyn RtspServerObserver>,
    auth: Option<Arc<DigestAuthenticator>>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    connections: Arc<Mutex<HashMap<String, Arc<Closer>>>>,
    closer: Closer,
}

impl RtspServer {
    pub fn new(addr: &str, observer: Arc<dyn RtspServerObserver>, runtime: Runtime) -> Self {
        Self {
            addr: addr.to_string(),
            runtime,
            observer,
            auth: None,
            listener: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            closer: Closer::new(),
        }
    }

    /// Require Digest credentials for every method but OPTIONS.
    pub fn with_digest_auth(mut self, realm: &str, username: &str, password: &str) -> Self {
        self.auth = Some(Arc::new(DigestAuthenticator::new(realm, username, password)));
        self
    }

    /// Bind the listening socket; returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?;
        *self.listener.lock() = Some(Arc::new(listener));
        tracing::info!(addr = %local, "rtsp server listening");
        Ok(local)
    }

    /// Accept connections until [`dispose`](Self::dispose). Binds first if
    /// [`listen`](Self::listen) was not called.
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
                        tracing::warn!(error = %e, "rtsp accept error");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "set_nodelay failed");
            }

            let session = ServerCommandSession::new(
                stream,
                remote,
                self.runtime.clone(),
                self.observer.clone(),
                self.auth.clone(),
            );
            let key = session.unique_key().to_string();
            self.connections.lock().insert(key.clone(), session.closer());

            let connections = self.connections.clone();
            tokio::spawn(async move {
                if let Err(e) = session.run_loop().await {
                    tracing::debug!(session = %key, error = %e, "rtsp connection ended with error");
                }
                connections.lock().remove(&key);
            });
        }
        tracing::info!(addr = %self.addr, "rtsp server stopped");
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
