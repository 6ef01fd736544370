use std::sync::Arc;

use parking_lot::RwLock;

use super::RtmpMessageSink;
use super::client_session::ClientSession;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::url::parse_rtmp_url;

/// Plays a stream from a remote RTMP server and hands every audio, video
/// and metadata message to the sink.
pub struct PullSession {
    info: SessionInfo,
    runtime: Runtime,
    sink: RwLock<Option<Arc<dyn RtmpMessageSink>>>,
    closer: Arc<Closer>,
}

impl PullSession {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            info: SessionInfo::new(runtime.ids.next(prefix::RTMP_PULL), Protocol::Rtmp, SessionRole::Pull),
            runtime: runtime.clone(),
            sink: RwLock::new(None),
            closer: Arc::new(Closer::new()),
        }
    }

    /// Must be called before [`pull`](Self::pull).
    pub fn set_sink(&self, sink: Arc<dyn RtmpMessageSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Returns once the server answered `play` with
    /// `NetStream.Play.Start`. Media then flows to the sink until
    /// [`dispose`](Self::dispose), an error, or `read_av_timeout` without
    /// data.
    pub async fn pull(&self, raw_url: &str) -> Result<()> {
        let url = parse_rtmp_url(raw_url)?;
        self.info.set_url(url.clone());
        tracing::info!(session = %self.unique_key(), url = %raw_url, "rtmp pull");

        let result = async {
            let mut client = ClientSession::connect(
                self.unique_key(),
                self.runtime.clone(),
                url,
                self.info.stat().clone(),
                self.closer.clone(),
            )
            .await?;
            client.start(false).await?;
            Ok::<_, Error>(client)
        }
        .await;

        match result {
            Ok(client) => {
                let sink = self.sink.read().clone();
                client.spawn_run_loop(sink, Some(self.runtime.config.read_av_timeout));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), error = %e, "rtmp pull failed");
                self.closer.finish(Error::TransportClosed);
                Err(e)
            }
        }
    }

    pub async fn wait(&self) -> Error {
        self.closer.wait().await
    }

    pub fn dispose(&self) {
        if !self.closer.is_closed() {
            tracing::info!(session = %self.unique_key(), "rtmp pull session disposed");
        }
        self.closer.finish(Error::TransportClosed);
    }
}

impl Session for PullSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
