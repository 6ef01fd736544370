//! Connection core shared by the RTMP push and pull sessions.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use super::handshake::client_handshake;
use super::message::{self, Command};
use super::stream::MessageReader;
use super::{DEFAULT_CHUNK_SIZE, RtmpMessage, RtmpMessageSink, pack_message, type_id};
use crate::config::Runtime;
use crate::error::{Error, ProtocolErrorKind, Result};
use crate::session::{Closer, SessionStat};
use crate::transport::spawn_write_loop;
use crate::url::UrlContext;

const TID_CONNECT: u32 = 1;
const TID_CREATE_STREAM: u32 = 2;
const TID_PUBLISH_OR_PLAY: u32 = 3;

/// What a running client session needs to queue messages.
#[derive(Clone)]
pub(crate) struct ClientWriter {
    pub writer: mpsc::Sender<Bytes>,
    pub stream_id: u32,
    pub chunk_size: u32,
}

impl ClientWriter {
    pub fn write_media(&self, msg: &RtmpMessage) -> Result<()> {
        super::stream::queue_media_message(&self.writer, msg, self.stream_id, self.chunk_size)
    }

    /// Queue `deleteStream` without waiting.
    pub fn send_delete_stream(&self) {
        if let Ok(msg) = message::delete_stream(0, self.stream_id)
            && self.writer.try_send(pack_message(&msg, self.chunk_size)).is_err()
        {
            tracing::debug!("deleteStream not queued");
        }
    }
}

pub(crate) struct ClientSession {
    unique_key: String,
    runtime: Runtime,
    url: UrlContext,
    reader: MessageReader<OwnedReadHalf>,
    writer: mpsc::Sender<Bytes>,
    out_chunk_size: u32,
    stream_id: u32,
    closer: Arc<Closer>,
}

impl ClientSession {
    /// Connect and complete the handshake.
    pub async fn connect(
        unique_key: &str,
        runtime: Runtime,
        url: UrlContext,
        stat: Arc<SessionStat>,
        closer: Arc<Closer>,
    ) -> Result<Self> {
        let config = runtime.config.clone();
        let stream = tokio::time::timeout(config.handshake_timeout, async {
            let mut stream = TcpStream::connect((url.host.as_str(), url.port)).await?;
            stream.set_nodelay(true)?;
            client_handshake(&mut stream, &config.library_tag()).await?;
            Ok::<_, Error>(stream)
        })
        .await
        .map_err(|_| Error::Timeout("rtmp handshake"))??;
        let remote = stream.peer_addr()?;
        stat.set_remote_addr(remote.to_string());
        tracing::info!(session = %unique_key, %remote, "rtmp handshake done");

        let (read_half, write_half) = stream.into_split();
        let writer = spawn_write_loop(
            write_half,
            config.merge_write_threshold,
            config.write_channel_capacity,
            stat.clone(),
            closer.clone(),
        );
        Ok(Self {
            unique_key: unique_key.to_string(),
            reader: MessageReader::new(read_half, stat, writer.clone()),
            writer,
            runtime,
            url,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            stream_id: 0,
            closer,
        })
    }

    /// connect, createStream, then publish or play; returns once the
    /// server confirms the last one.
    pub async fn start(&mut self, is_push: bool) -> Result<()> {
        let chunk_size = self.runtime.config.rtmp_chunk_size;
        self.send(&message::set_chunk_size(chunk_size)).await?;
        self.out_chunk_size = chunk_size;

        let app = self.url.path_without_last_item.trim_start_matches('/').to_string();
        let tc_url = format!("{}://{}/{}", self.url.scheme, self.url.host_with_port, app);
        let flash_ver = format!("FMLE/3.0 (compatible; {})", self.runtime.config.library_tag());
        self.send(&message::connect(TID_CONNECT, &app, &tc_url, &flash_ver, is_push)?)
            .await?;
        let result = self.wait_result(TID_CONNECT).await?;
        if result.status_code() != Some(message::CODE_CONNECT_SUCCESS) {
            return Err(unexpected(&result));
        }

        let stream_name = if self.url.raw_query.is_empty() {
            self.url.last_item_of_path.clone()
        } else {
            format!("{}?{}", self.url.last_item_of_path, self.url.raw_query)
        };
        if is_push {
            for name in [message::CMD_RELEASE_STREAM, message::CMD_FC_PUBLISH] {
                self.send(&message::stream_name_command(name, 0, &stream_name)?).await?;
            }
        }

        self.send(&message::create_stream(TID_CREATE_STREAM)?).await?;
        let result = self.wait_result(TID_CREATE_STREAM).await?;
        self.stream_id = result
            .arg_number(0)
            .map(|n| n as u32)
            .ok_or_else(|| unexpected(&result))?;

        if is_push {
            self.send(&message::publish(TID_PUBLISH_OR_PLAY, self.stream_id, &stream_name)?)
                .await?;
            self.wait_status(message::CODE_PUBLISH_START).await?;
        } else {
            self.send(&message::play(TID_PUBLISH_OR_PLAY, self.stream_id, &stream_name)?)
                .await?;
            self.send(&message::set_buffer_length(self.stream_id, 1000)).await?;
            self.wait_status(message::CODE_PLAY_START).await?;
        }
        tracing::info!(session = %self.unique_key, stream_id = self.stream_id, push = is_push, "rtmp stream started");
        Ok(())
    }

    pub fn writer(&self) -> ClientWriter {
        ClientWriter {
            writer: self.writer.clone(),
            stream_id: self.stream_id,
            chunk_size: self.out_chunk_size,
        }
    }

    async fn send(&self, msg: &RtmpMessage) -> Result<()> {
        self.writer
            .send(pack_message(msg, self.out_chunk_size))
            .await
            .map_err(|_| Error::TransportClosed)
    }

    async fn wait_result(&mut self, tid: u32) -> Result<Command> {
        self.wait_command(|cmd| {
            (cmd.name == message::CMD_RESULT || cmd.name == message::CMD_ERROR)
                && cmd.transaction_id as u32 == tid
        })
        .await
        .and_then(|cmd| {
            if cmd.name == message::CMD_ERROR {
                Err(unexpected(&cmd))
            } else {
                Ok(cmd)
            }
        })
    }

    async fn wait_status(&mut self, code: &str) -> Result<Command> {
        let cmd = self.wait_command(|cmd| cmd.name == message::CMD_ON_STATUS).await?;
        if cmd.status_code() == Some(code) {
            Ok(cmd)
        } else {
            Err(unexpected(&cmd))
        }
    }

    async fn wait_command(&mut self, mut accept: impl FnMut(&Command) -> bool) -> Result<Command> {
        let timeout = self.runtime.config.command_timeout;
        let closer = self.closer.clone();
        let wait = async {
            loop {
                let msg = self.reader.read_message().await?;
                if !matches!(msg.header.msg_type_id, type_id::COMMAND_AMF0 | type_id::COMMAND_AMF3) {
                    tracing::trace!(session = %self.unique_key, type_id = msg.header.msg_type_id, "message before start dropped");
                    continue;
                }
                let cmd = Command::parse(&msg)?;
                tracing::debug!(session = %self.unique_key, name = %cmd.name, tid = cmd.transaction_id, "command");
                if accept(&cmd) {
                    return Ok::<_, Error>(cmd);
                }
            }
        };
        tokio::select! {
            _ = closer.closed() => Err(Error::TransportClosed),
            r = tokio::time::timeout(timeout, wait) => r.map_err(|_| Error::Timeout("rtmp command"))?,
        }
    }

    /// Hand the connection to a background task that feeds `sink` until the
    /// session ends; the end finishes `closer`. `idle_timeout` bounds how
    /// long the connection may stay silent.
    pub fn spawn_run_loop(mut self, sink: Option<Arc<dyn RtmpMessageSink>>, idle_timeout: Option<Duration>) {
        tokio::spawn(async move {
            let closer = self.closer.clone();
            let result = self.run_loop(sink, idle_timeout).await;
            match result {
                Ok(()) => closer.finish(Error::TransportClosed),
                Err(e) => {
                    tracing::warn!(session = %self.unique_key, error = %e, "rtmp client session ended");
                    closer.finish(e);
                }
            }
        });
    }

    async fn run_loop(&mut self, sink: Option<Arc<dyn RtmpMessageSink>>, idle_timeout: Option<Duration>) -> Result<()> {
        let closer = self.closer.clone();
        if let Some(t) = idle_timeout {
            self.reader.set_idle_timeout(t);
        }
        loop {
            let msg = tokio::select! {
                _ = closer.closed() => return Ok(()),
                r = self.reader.read_message() => r?,
            };
            match msg.header.msg_type_id {
                type_id::AUDIO | type_id::VIDEO | type_id::DATA_AMF0 => {
                    if let Some(sink) = &sink {
                        sink.on_rtmp_message(&msg);
                    }
                }
                type_id::COMMAND_AMF0 | type_id::COMMAND_AMF3 => {
                    let cmd = Command::parse(&msg)?;
                    tracing::debug!(session = %self.unique_key, name = %cmd.name, code = ?cmd.status_code(), "command");
                }
                other => tracing::trace!(session = %self.unique_key, type_id = other, "ignoring message"),
            }
        }
    }
}

fn unexpected(cmd: &Command) -> Error {
    let detail = match cmd.status_code() {
        Some(code) => format!("{} {}", cmd.name, code),
        None => cmd.name.clone(),
    };
    Error::invalid(ProtocolErrorKind::UnexpectedCommand(detail))
}
