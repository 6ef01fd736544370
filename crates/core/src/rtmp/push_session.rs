use std::sync::Arc;

use parking_lot::Mutex;

use super::RtmpMessage;
use super::client_session::{ClientSession, ClientWriter};
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::url::parse_rtmp_url;

/// Publishes to a remote RTMP server.
///
/// ```text
/// connect -> _result -> releaseStream, FCPublish -> createStream
///   -> _result(stream id) -> publish -> onStatus(NetStream.Publish.Start)
/// ```
pub struct PushSession {
    info: SessionInfo,
    runtime: Runtime,
    writer: Mutex<Option<ClientWriter>>,
    closer: Arc<Closer>,
}

impl PushSession {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            info: SessionInfo::new(runtime.ids.next(prefix::RTMP_PUSH), Protocol::Rtmp, SessionRole::Push),
            runtime: runtime.clone(),
            writer: Mutex::new(None),
            closer: Arc::new(Closer::new()),
        }
    }

    /// Returns once the server accepted `publish`.
    pub async fn push(&self, raw_url: &str) -> Result<()> {
        let url = parse_rtmp_url(raw_url)?;
        self.info.set_url(url.clone());
        tracing::info!(session = %self.unique_key(), url = %raw_url, "rtmp push");

        let result = async {
            let mut client = ClientSession::connect(
                self.unique_key(),
                self.runtime.clone(),
                url,
                self.info.stat().clone(),
                self.closer.clone(),
            )
            .await?;
            client.start(true).await?;
            Ok::<_, Error>(client)
        }
        .await;

        match result {
            Ok(client) => {
                *self.writer.lock() = Some(client.writer());
                client.spawn_run_loop(None, None);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %self.unique_key(), error = %e, "rtmp push failed");
                self.closer.finish(Error::TransportClosed);
                Err(e)
            }
        }
    }

    /// Queue an audio, video or metadata message. Messages written before
    /// [`push`](Self::push) succeeded are dropped.
    pub fn write_message(&self, msg: &RtmpMessage) -> Result<()> {
        let writer = self.writer.lock().clone();
        match writer {
            Some(w) => w.write_media(msg),
            None => Ok(()),
        }
    }

    pub async fn wait(&self) -> Error {
        self.closer.wait().await
    }

    pub fn dispose(&self) {
        let writer = self.writer.lock().take();
        if let Some(w) = writer {
            w.send_delete_stream();
        }
        if !self.closer.is_closed() {
            tracing::info!(session = %self.unique_key(), "rtmp push session disposed");
        }
        self.closer.finish(Error::TransportClosed);
    }
}

impl Session for PushSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
