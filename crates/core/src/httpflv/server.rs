use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::sub_session::SubSession;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::session::{Closer, Session};

pub trait HttpFlvServerObserver: Send + Sync {
    /// A player asked for `/app/stream.flv`. Returning an error answers
    /// 404 and closes the connection.
    fn on_new_http_flv_sub_session(&self, _session: &Arc<SubSession>) -> Result<()> {
        Ok(())
    }

    fn on_del_http_flv_sub_session(&self, _session: &Arc<SubSession>) {}
}

pub struct HttpFlvServer {
    addr: String,
    runtime: Runtime,
    observer: Arc<dyn HttpFlvServerObserver>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    connections: Arc<Mutex<HashMap<String, Arc<Closer>>>>,
    closer: Arc<Closer>,
}

impl HttpFlvServer {
    pub fn new(addr: &str, observer: Arc<dyn HttpFlvServerObserver>, runtime: Runtime) -> Self {
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
        tracing::info!(addr = %local, "http-flv server listening");
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
                        tracing::warn!(error = %e, "http-flv accept error");
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
                let (session, reader) = match SubSession::accept(stream, remote, runtime).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(%remote, error = %e, "http-flv request rejected");
                        return;
                    }
                };
                if let Err(e) = observer.on_new_http_flv_sub_session(&session) {
                    tracing::info!(session = %session.unique_key(), error = %e, "http-flv stream refused");
                    session.write_not_found();
                    session.dispose();
                    return;
                }
                if let Err(e) = session.write_response_header() {
                    tracing::warn!(session = %session.unique_key(), error = %e, "http-flv response not queued");
                }

                let key = session.unique_key().to_string();
                connections.lock().insert(key.clone(), session.closer());
                if server_closer.is_closed() {
                    session.dispose();
                }
                let _ = session.run_loop(reader).await;
                connections.lock().remove(&key);
                observer.on_del_http_flv_sub_session(&session);
            });
        }
        tracing::info!(addr = %self.addr, "http-flv server stopped");
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
