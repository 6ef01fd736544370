use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::session::{Closer, SessionStat};

/// Coalesces small writes into vectored writes.
///
/// Blocks are queued without copying until the queued size reaches the
/// threshold, then handed to the sink together. Blocks are never split,
/// so a block larger than the threshold goes out as-is.
#[derive(Debug)]
pub struct MergeWriter<W> {
    inner: W,
    pending: VecDeque<Bytes>,
    pending_len: usize,
    threshold: usize,
}

impl<W: AsyncWrite + Unpin> MergeWriter<W> {
    pub fn new(inner: W, threshold: usize) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            pending_len: 0,
            threshold,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    pub async fn write(&mut self, block: Bytes) -> io::Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        self.pending_len += block.len();
        self.pending.push_back(block);
        if self.pending_len >= self.threshold {
            self.write_pending().await?;
        }
        Ok(())
    }

    /// Emit everything queued and flush the sink.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.write_pending().await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.inner.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn write_pending(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            let mut n = {
                let slices: Vec<IoSlice<'_>> =
                    self.pending.iter().map(|b| IoSlice::new(b)).collect();
                self.inner.write_vectored(&slices).await?
            };
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.pending_len -= n;
            while n > 0 {
                let Some(front) = self.pending.front_mut() else {
                    break;
                };
                if front.len() <= n {
                    n -= front.len();
                    self.pending.pop_front();
                } else {
                    front.advance(n);
                    n = 0;
                }
            }
        }
        Ok(())
    }
}

/// Spawn the single writer task of a TCP session.
///
/// Blocks sent on the returned channel are written through a
/// [`MergeWriter`]; the sink is flushed whenever the queue runs dry. The
/// task ends when every sender is dropped or `closer` fires; blocks that are
/// already queued at that point are still written. A write error finishes
/// `closer` with that error.
pub fn spawn_write_loop<W>(
    writer: W,
    threshold: usize,
    capacity: usize,
    stat: Arc<SessionStat>,
    closer: Arc<Closer>,
) -> mpsc::Sender<Bytes>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
    tokio::spawn(async move {
        let mut w = MergeWriter::new(writer, threshold);
        let result: Result<()> = async {
            loop {
                let block = tokio::select! {
                    _ = closer.closed() => break,
                    block = rx.recv() => block,
                };
                let Some(block) = block else { break };
                stat.add_wrote_bytes(block.len());
                w.write(block).await?;
                while let Ok(block) = rx.try_recv() {
                    stat.add_wrote_bytes(block.len());
                    w.write(block).await?;
                }
                w.flush().await?;
            }
            while let Ok(block) = rx.try_recv() {
                stat.add_wrote_bytes(block.len());
                w.write(block).await?;
            }
            w.shutdown().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "write loop ended");
            closer.finish(e);
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Protocol, SessionRole};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// In-memory sink recording how each vectored write was issued.
    #[derive(Debug, Default)]
    struct RecordingSink {
        data: Vec<u8>,
        vectored_calls: Vec<usize>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.data.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_write_vectored(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            let mut n = 0;
            for b in bufs {
                self.data.extend_from_slice(b);
                n += b.len();
            }
            self.vectored_calls.push(bufs.len());
            Poll::Ready(Ok(n))
        }

        fn is_write_vectored(&self) -> bool {
            true
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn small_blocks_are_merged_into_one_vectored_write() {
        let mut w = MergeWriter::new(RecordingSink::default(), 10);
        for _ in 0..3 {
            w.write(Bytes::from_static(b"abc")).await.unwrap();
        }
        assert_eq!(w.pending_len(), 9);
        assert!(w.inner.vectored_calls.is_empty());

        w.write(Bytes::from_static(b"def")).await.unwrap();
        assert_eq!(w.pending_len(), 0);
        assert_eq!(w.inner.vectored_calls, vec![4]);
        assert_eq!(w.inner.data, b"abcabcabcdef");
    }

    #[tokio::test]
    async fn oversized_block_is_not_split() {
        let mut w = MergeWriter::new(RecordingSink::default(), 4);
        w.write(Bytes::from(vec![7u8; 100])).await.unwrap();
        assert_eq!(w.inner.vectored_calls, vec![1]);
        assert_eq!(w.inner.data.len(), 100);
    }

    #[tokio::test]
    async fn flush_emits_remainder() {
        let mut w = MergeWriter::new(RecordingSink::default(), 1024);
        w.write(Bytes::from_static(b"x")).await.unwrap();
        w.write(Bytes::new()).await.unwrap();
        w.write(Bytes::from_static(b"y")).await.unwrap();
        w.flush().await.unwrap();
        let sink = w.into_inner();
        assert_eq!(sink.vectored_calls, vec![2]);
        assert_eq!(sink.data, b"xy");
    }

    #[tokio::test]
    async fn write_loop_counts_bytes_and_drains_on_close() {
        let (client, mut server) = tokio::io::duplex(4096);
        let stat = Arc::new(SessionStat::new(
            "T1".into(),
            Protocol::Rtmp,
            SessionRole::Push,
        ));
        let closer = Arc::new(Closer::new());
        let tx = spawn_write_loop(client, 1024, 8, stat.clone(), closer.clone());

        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(stat.wrote_bytes(), 11);
    }
}
