//! Cancellable background tasks
//!
//! Every periodic probe loop runs under a [`Watchdog`] handle. `stop()` has
//! join semantics: it returns only after the loop has observed the
//! cancellation, so a stopped watchdog can never issue another send.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to a cancellable background loop
#[derive(Debug)]
pub struct Watchdog {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Spawn a loop. The closure receives the cancellation token and must
    /// observe it at every iteration boundary (`tokio::select!` against
    /// `token.cancelled()`).
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let fut = f(cancel.clone());
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            debug!("watchdog finished: {}", task_name);
        });
        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop already ran to completion (self-cancelling probes)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        debug!("watchdog stopped: {}", self.name);
    }
}
