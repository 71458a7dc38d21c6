use std::future::Future;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Caller-supplied cancellation signal, threaded through every backend call.
///
/// Wraps the same `watch` channel the daemon uses for its shutdown signal:
/// once the sender publishes `true`, any in-flight or subsequent call made
/// through [`CancelSignal::run`] resolves to [`Error::Cancelled`].
#[derive(Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn from_watch(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run a backend call, mapping its failure to [`Error::Upstream`] and
    /// racing it against cancellation.
    pub async fn run<T, F>(&self, call: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let Some(rx) = &self.rx else {
            return fut.await.map_err(|e| Error::upstream(call, e));
        };

        if *rx.borrow() {
            return Err(Error::Cancelled(call));
        }

        let mut rx = rx.clone();
        tokio::select! {
            res = fut => res.map_err(|e| Error::upstream(call, e)),
            _ = cancelled(&mut rx) => Err(Error::Cancelled(call)),
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: nothing can fire any more.
            std::future::pending::<()>().await;
        }
    }
}
