use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::debug;

type Callback = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Every live (started, not yet fired or cancelled) timer task, so an
/// interrupt can cancel all pending deletions before the process exits.
static LIVE: LazyLock<DashMap<u64, AbortHandle>> = LazyLock::new(DashMap::new);
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A one-shot cancellable delayed callback. Creation does not start the
/// timer; `start` is explicit. Once the delay has elapsed the callback runs
/// to completion and can no longer be cancelled.
pub struct GraceTimer {
    id: u64,
    delay: Duration,
    callback: Mutex<Option<Callback>>,
}

impl GraceTimer {
    pub fn new(delay: Duration, callback: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            delay,
            callback: Mutex::new(Some(Box::pin(callback))),
        }
    }

    /// Arm the timer. A second call is a no-op.
    pub fn start(&self) {
        let Some(callback) = self.callback.lock().unwrap().take() else {
            return;
        };
        let id = self.id;
        let delay = self.delay;
        // the task must not race past registration: a zero delay could
        // otherwise elapse before the abort handle lands in the table
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            tokio::time::sleep(delay).await;
            // Deregister before running: from here on a cancel is a no-op
            // and the callback runs to completion.
            if LIVE.remove(&id).is_none() {
                return;
            }
            callback.await;
        });
        LIVE.insert(id, handle.abort_handle());
        let _ = registered_tx.send(());
    }

    /// Cancel the timer. Idempotent, and safe on a not-yet-started or
    /// already-fired timer.
    pub fn cancel(&self) {
        self.callback.lock().unwrap().take();
        if let Some((_, handle)) = LIVE.remove(&self.id) {
            handle.abort();
        }
    }
}

/// Cancel every live timer. Called from the interrupt path.
pub fn cancel_all() {
    let count = LIVE.len();
    if count > 0 {
        debug!("cancelling {count} pending timers");
    }
    LIVE.retain(|_, handle| {
        handle.abort();
        false
    });
}

/// Number of armed timers across the process.
pub fn live_count() -> usize {
    LIVE.len()
}
