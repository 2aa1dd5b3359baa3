use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancellation signal carried by one scheduler invocation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Trigger side of a cancellable [`RequestContext`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl RequestContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: None,
            cancel: Some(rx),
        };
        (ctx, CancelHandle(tx))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Drive `fut` until it finishes, the deadline passes or the request is
    /// cancelled. On the latter two `fut` is dropped, releasing whatever it
    /// held.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let cancelled = Self::wait_cancelled(self.cancel.clone());
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => Err(Error::Cancelled),
            () = deadline => Err(Error::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    async fn wait_cancelled(rx: Option<watch::Receiver<bool>>) {
        if let Some(mut rx) = rx {
            let cancelled = rx.wait_for(|cancelled| *cancelled).await.is_ok();
            if cancelled {
                return;
            }
        }
        // No signal, or the sender went away without cancelling.
        std::future::pending::<()>().await;
    }
}
