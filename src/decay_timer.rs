//! Cancellable one-shot timeouts for online-decay
//!
//! `cancel` only raises a flag; the firing task is expected to consult
//! [`TimeoutHandle::is_cancelled`] before acting, so a fire that races a
//! cancellation becomes a no-op. `abort` additionally kills the sleeping
//! task and is reserved for shutdown, where the callback must never run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle passed into the firing task
pub struct TimeoutHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimeoutHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// An armed one-shot timeout
pub struct DecayTimeout {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl DecayTimeout {
    /// Mark the timeout cancelled. The callback still runs at expiry but
    /// observes the flag and returns without side effects.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel and kill the sleeping task. Only safe where a mid-callback
    /// abort is acceptable, i.e. shutdown.
    pub fn abort(&self) {
        self.cancel();
        self.task.abort();
    }
}

/// Arm a one-shot timeout. After `delay` the task runs with a
/// [`TimeoutHandle`] it must check before mutating any state.
pub fn schedule<F, Fut>(delay: Duration, task: F) -> DecayTimeout
where
    F: FnOnce(TimeoutHandle) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task(TimeoutHandle { cancelled: flag }).await;
    });
    DecayTimeout {
        cancelled,
        task: handle,
    }
}
