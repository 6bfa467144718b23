//! Cancellable repeating task.
//!
//! The tick callback runs on its own tokio task every `period`, first one
//! period after start. Ticks never overlap: a slow tick delays the next one
//! instead of queueing a burst. Cancelling stops the loop at the next await
//! point, including mid-tick.

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handle to a running periodic task. Dropping the handle cancels the task.
///
/// # Examples
///
/// ```
/// use netpulse::schedule::ScheduledTask;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let ticks = Arc::new(AtomicUsize::new(0));
/// let counter = ticks.clone();
/// let task = ScheduledTask::start(Duration::from_millis(10), move || {
///     let counter = counter.clone();
///     async move {
///         counter.fetch_add(1, Ordering::SeqCst);
///     }
/// });
///
/// tokio::time::sleep(Duration::from_millis(35)).await;
/// task.cancel();
/// task.join().await;
/// assert!(ticks.load(Ordering::SeqCst) >= 1);
/// # }
/// ```
pub struct ScheduledTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Spawns the loop. Must be called from within a tokio runtime.
    pub fn start<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick() => {}
                }
            }
            debug!("Scheduled task stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Requests the loop to stop. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .handle
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
    }

    /// Waits for the loop to exit. Call [`cancel`](Self::cancel) first or
    /// this waits forever.
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
