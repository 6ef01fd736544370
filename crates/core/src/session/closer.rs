use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::error::Error;

/// Shutdown signal plus the one-shot completion channel behind `wait()`.
///
/// `close` may be called any number of times from any task; only the first
/// call has an effect. `finish` records the error that ended the session;
/// the first recorded error is what `wait` resolves to.
#[derive(Debug)]
pub struct Closer {
    closed: watch::Sender<bool>,
    done_tx: Mutex<Option<oneshot::Sender<Error>>>,
    done_rx: Mutex<Option<oneshot::Receiver<Error>>>,
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl Closer {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            closed,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    /// Returns `true` on the first call.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot be dropped here.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Record the terminating error and close. Later calls are ignored.
    pub fn finish(&self, err: Error) {
        if let Some(tx) = self.done_tx.lock().take() {
            let _ = tx.send(err);
        }
        self.close();
    }

    /// Resolves with the error passed to the first [`finish`](Self::finish).
    ///
    /// Only the first caller receives the error; later callers get
    /// [`Error::TransportClosed`] immediately.
    pub async fn wait(&self) -> Error {
        let rx = self.done_rx.lock().take();
        match rx {
            Some(rx) => rx.await.unwrap_or(Error::TransportClosed),
            None => Error::TransportClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn close_reports_first_call_only() {
        let c = Closer::new();
        assert!(!c.is_closed());
        assert!(c.close());
        assert!(!c.close());
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn wait_resolves_with_first_error() {
        let c = Closer::new();
        c.finish(Error::Timeout("read"));
        c.finish(Error::AuthFailed);
        assert_eq!(c.wait().await.kind(), ErrorKind::Timeout);
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let c = std::sync::Arc::new(Closer::new());
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.closed().await })
        };
        c.close();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn second_wait_returns_immediately() {
        let c = Closer::new();
        c.finish(Error::TransportClosed);
        let _ = c.wait().await;
        assert_eq!(c.wait().await.kind(), ErrorKind::TransportClosed);
    }
}
