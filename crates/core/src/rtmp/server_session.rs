use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use super::handshake::server_handshake;
use super::message::{self, Command};
use super::server::RtmpServerObserver;
use super::stream::{MessageReader, queue_media_message};
use super::{DEFAULT_CHUNK_SIZE, RtmpMessage, RtmpMessageSink, pack_message, type_id};
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::session::{Closer, Protocol, Session, SessionInfo, SessionRole, prefix};
use crate::transport::spawn_write_loop;
use crate::url::parse_rtmp_url;

/// Message stream id handed out by `createStream`.
const STREAM_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSessionStage {
    AwaitingConnect,
    AwaitingCreateStream,
    AwaitingPublishOrPlay,
    Publishing,
    Playing,
    Disposed,
}

#[derive(Debug)]
struct ServerState {
    stage: ServerSessionStage,
    app_name: String,
    tc_url: String,
}

/// One accepted RTMP connection. It starts as neither publisher nor
/// player; `publish` or `play` decides which, and the observer is told.
pub struct ServerSession {
    info: SessionInfo,
    runtime: Runtime,
    observer: Arc<dyn RtmpServerObserver>,
    writer: mpsc::Sender<Bytes>,
    out_chunk_size: AtomicU32,
    state: Mutex<ServerState>,
    sink: RwLock<Option<Arc<dyn RtmpMessageSink>>>,
    closer: Arc<Closer>,
}

impl ServerSession {
    /// Run the handshake on `stream`, then split it into the session and
    /// the reader its [`run_loop`](Self::run_loop) consumes.
    pub(crate) async fn accept(
        mut stream: TcpStream,
        remote: SocketAddr,
        runtime: Runtime,
        observer: Arc<dyn RtmpServerObserver>,
    ) -> Result<(Arc<Self>, MessageReader<OwnedReadHalf>)> {
        let config = runtime.config.clone();
        let unique_key = runtime.ids.next(prefix::RTMP_SERVER);
        tokio::time::timeout(
            config.handshake_timeout,
            server_handshake(&mut stream, &config.library_tag()),
        )
        .await
        .map_err(|_| Error::Timeout("rtmp handshake"))??;

        let info = SessionInfo::new(unique_key, Protocol::Rtmp, SessionRole::PubSub);
        info.stat().set_remote_addr(remote.to_string());
        let closer = Arc::new(Closer::new());
        let (read_half, write_half) = stream.into_split();
        let writer = spawn_write_loop(
            write_half,
            config.merge_write_threshold,
            config.write_channel_capacity,
            info.stat().clone(),
            closer.clone(),
        );
        let reader = MessageReader::new(read_half, info.stat().clone(), writer.clone());
        tracing::info!(session = %info.unique_key(), %remote, "rtmp handshake done");

        let session = Arc::new(Self {
            info,
            runtime,
            observer,
            writer,
            out_chunk_size: AtomicU32::new(DEFAULT_CHUNK_SIZE),
            state: Mutex::new(ServerState {
                stage: ServerSessionStage::AwaitingConnect,
                app_name: String::new(),
                tc_url: String::new(),
            }),
            sink: RwLock::new(None),
            closer,
        });
        Ok((session, reader))
    }

    pub fn stage(&self) -> ServerSessionStage {
        self.state.lock().stage
    }

    /// Receiver of what a publisher sends. Usually set from
    /// [`RtmpServerObserver::on_new_rtmp_pub_session`].
    pub fn set_sink(&self, sink: Arc<dyn RtmpMessageSink>) {
        *self.sink.write() = Some(sink);
    }

    pub(crate) fn closer(&self) -> Arc<Closer> {
        self.closer.clone()
    }

    /// Read and dispatch messages until the peer leaves, an error occurs or
    /// [`dispose`](Self::dispose) is called.
    pub async fn run_loop(self: &Arc<Self>, mut reader: MessageReader<OwnedReadHalf>) -> Result<()> {
        reader.set_idle_timeout(self.runtime.config.read_av_timeout);
        let result: Result<()> = async {
            loop {
                let msg = tokio::select! {
                    _ = self.closer.closed() => return Ok(()),
                    r = reader.read_message() => r?,
                };
                self.handle_message(msg).await?;
            }
        }
        .await;

        let stage = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.stage, ServerSessionStage::Disposed)
        };
        match stage {
            ServerSessionStage::Publishing => self.observer.on_del_rtmp_pub_session(self),
            ServerSessionStage::Playing => self.observer.on_del_rtmp_sub_session(self),
            _ => {}
        }
        match &result {
            Ok(()) | Err(Error::TransportClosed) => {
                tracing::info!(session = %self.unique_key(), "rtmp session closed");
            }
            Err(e) => tracing::warn!(session = %self.unique_key(), error = %e, "rtmp session ended"),
        }
        self.closer.close();
        result
    }

    async fn handle_message(self: &Arc<Self>, msg: RtmpMessage) -> Result<()> {
        match msg.header.msg_type_id {
            type_id::COMMAND_AMF0 | type_id::COMMAND_AMF3 => {
                let cmd = Command::parse(&msg)?;
                self.handle_command(cmd, msg.header.msg_stream_id).await
            }
            type_id::AUDIO | type_id::VIDEO => {
                self.forward(&msg);
                Ok(())
            }
            type_id::DATA_AMF0 => {
                let payload = message::strip_set_data_frame(&msg.payload);
                let mut meta = msg;
                meta.header.msg_len = payload.len() as u32;
                meta.payload = payload;
                self.forward(&meta);
                Ok(())
            }
            other => {
                tracing::trace!(session = %self.unique_key(), type_id = other, "ignoring message");
                Ok(())
            }
        }
    }

    fn forward(&self, msg: &RtmpMessage) {
        if self.stage() != ServerSessionStage::Publishing {
            tracing::trace!(session = %self.unique_key(), "media from a non-publisher dropped");
            return;
        }
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_rtmp_message(msg);
        }
    }

    async fn handle_command(self: &Arc<Self>, cmd: Command, stream_id: u32) -> Result<()> {
        tracing::debug!(session = %self.unique_key(), name = %cmd.name, tid = cmd.transaction_id, stream_id, "command");
        let stage = self.stage();
        let in_order = match cmd.name.as_str() {
            message::CMD_CONNECT => stage == ServerSessionStage::AwaitingConnect,
            message::CMD_CREATE_STREAM => matches!(
                stage,
                ServerSessionStage::AwaitingCreateStream | ServerSessionStage::AwaitingPublishOrPlay
            ),
            message::CMD_PUBLISH | message::CMD_PLAY => stage == ServerSessionStage::AwaitingPublishOrPlay,
            _ => true,
        };
        if !in_order {
            tracing::warn!(session = %self.unique_key(), name = %cmd.name, ?stage, "command out of order");
            return Err(Error::invalid(ProtocolErrorKind::UnexpectedCommand(format!(
                "{} while {stage:?}",
                cmd.name
            ))));
        }

        match cmd.name.as_str() {
            message::CMD_CONNECT => self.on_connect(cmd).await,
            message::CMD_CREATE_STREAM => {
                self.send(&message::create_stream_result(cmd.transaction_id, STREAM_ID)?).await?;
                self.set_stage(ServerSessionStage::AwaitingPublishOrPlay);
                Ok(())
            }
            message::CMD_PUBLISH => self.on_publish_or_play(cmd, true).await,
            message::CMD_PLAY => self.on_publish_or_play(cmd, false).await,
            message::CMD_DELETE_STREAM | message::CMD_CLOSE_STREAM | message::CMD_FC_UNPUBLISH => {
                Err(Error::TransportClosed)
            }
            _ => Ok(()),
        }
    }

    async fn on_connect(self: &Arc<Self>, cmd: Command) -> Result<()> {
        let object = cmd.object.unwrap_or_default();
        {
            let mut state = self.state.lock();
            state.app_name = object.get_str("app").unwrap_or_default().to_string();
            state.tc_url = object.get_str("tcUrl").unwrap_or_default().to_string();
        }
        self.observer.on_rtmp_connect(self, &object);

        let config = &self.runtime.config;
        self.send(&message::window_ack_size(config.rtmp_window_ack_size)).await?;
        self.send(&message::set_peer_bandwidth(
            config.rtmp_peer_bandwidth,
            message::PEER_BANDWIDTH_DYNAMIC,
        ))
        .await?;
        self.send(&message::set_chunk_size(config.rtmp_chunk_size)).await?;
        self.out_chunk_size.store(config.rtmp_chunk_size, Ordering::Relaxed);
        self.send(&message::connect_result(cmd.transaction_id, &config.library_tag())?)
            .await?;
        self.set_stage(ServerSessionStage::AwaitingCreateStream);
        Ok(())
    }

    async fn on_publish_or_play(self: &Arc<Self>, cmd: Command, is_publish: bool) -> Result<()> {
        let name = cmd.arg_str(0).unwrap_or_default().to_string();
        let (app_name, tc_url) = {
            let state = self.state.lock();
            (state.app_name.clone(), state.tc_url.clone())
        };
        let base = if tc_url.is_empty() {
            format!("rtmp://127.0.0.1/{app_name}")
        } else {
            tc_url
        };
        let url = parse_rtmp_url(&format!("{}/{}", base.trim_end_matches('/'), name))?;
        self.info.set_url(url);

        if is_publish {
            self.info.stat().set_role(SessionRole::Pub);
            tracing::info!(session = %self.unique_key(), stream = %self.stream_name(), "rtmp publish");
            self.observer.on_new_rtmp_pub_session(self)?;
            self.set_stage(ServerSessionStage::Publishing);
            self.send(&message::on_status(STREAM_ID, message::CODE_PUBLISH_START, "Start publishing")?)
                .await?;
        } else {
            self.info.stat().set_role(SessionRole::Sub);
            tracing::info!(session = %self.unique_key(), stream = %self.stream_name(), "rtmp play");
            self.send(&message::stream_begin(STREAM_ID)).await?;
            self.send(&message::on_status(STREAM_ID, message::CODE_PLAY_START, "Start live")?)
                .await?;
            self.set_stage(ServerSessionStage::Playing);
            self.observer.on_new_rtmp_sub_session(self)?;
        }
        Ok(())
    }

    fn set_stage(&self, stage: ServerSessionStage) {
        self.state.lock().stage = stage;
    }

    async fn send(&self, msg: &RtmpMessage) -> Result<()> {
        let chunk_size = self.out_chunk_size.load(Ordering::Relaxed);
        self.writer
            .send(pack_message(msg, chunk_size))
            .await
            .map_err(|_| Error::TransportClosed)
    }

    /// Queue an audio, video or metadata message for a player. Never
    /// blocks: a full queue is [`Error::ResourceExhausted`].
    pub fn write_message(&self, msg: &RtmpMessage) -> Result<()> {
        queue_media_message(&self.writer, msg, STREAM_ID, self.out_chunk_size.load(Ordering::Relaxed))
    }

    pub fn dispose(&self) {
        if self.closer.close() {
            tracing::info!(session = %self.unique_key(), "rtmp session disposed");
        }
    }
}

impl Session for ServerSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }
}
