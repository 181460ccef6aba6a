//! Cancellable periodic background task.
//!
//! Each component that needs periodic maintenance (cache sweep, bucket
//! cleanup, writer flush timer) owns one [`BackgroundTask`]. The spawned loop
//! holds only a `Weak` reference to its owner and exits when the owner is
//! dropped or when [`BackgroundTask::stop`] broadcasts the shutdown signal.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How long `join` waits for the loop to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to one periodic maintenance loop.
pub struct BackgroundTask {
    name: String,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Create an idle task handle.
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `tick` every `interval` until stopped or until `owner` is dropped.
    ///
    /// Returns `false` if the loop is already running or no tokio runtime is
    /// available on the calling thread.
    pub fn spawn_periodic<T, F, Fut>(&self, owner: &Arc<T>, interval: Duration, tick: F) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn_inner(owner, interval, None, tick)
    }

    /// Like [`spawn_periodic`](Self::spawn_periodic), but `wake` also triggers
    /// an immediate tick.
    pub fn spawn_periodic_or_notified<T, F, Fut>(
        &self,
        owner: &Arc<T>,
        interval: Duration,
        wake: Arc<Notify>,
        tick: F,
    ) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn_inner(owner, interval, Some(wake), tick)
    }

    fn spawn_inner<T, F, Fut>(
        &self,
        owner: &Arc<T>,
        interval: Duration,
        wake: Option<Arc<Notify>>,
        tick: F,
    ) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(task = %self.name, "Background task already running");
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(task = %self.name, "No tokio runtime, background task not started");
                return false;
            }
        };

        let owner: Weak<T> = Arc::downgrade(owner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let name = self.name.clone();

        let handle = runtime.spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = notified(wake.as_deref()) => {}
                    _ = shutdown_rx.recv() => {
                        debug!(task = %name, "Background task received shutdown signal");
                        break;
                    }
                }

                let Some(owner) = owner.upgrade() else {
                    debug!(task = %name, "Owner dropped, background task exiting");
                    break;
                };
                tick(owner).await;
            }
        });

        *slot = Some(handle);
        info!(task = %self.name, interval_ms = interval.as_millis() as u64, "Background task started");
        true
    }

    /// Signal the loop to exit. Safe to call from any thread, idempotent.
    pub fn stop(&self) {
        if self.shutdown_tx.send(()).is_ok() {
            debug!(task = %self.name, "Background task stop requested");
        }
    }

    /// Wait for a stopped loop to finish.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                warn!(task = %self.name, "Background task did not exit in time");
            } else {
                info!(task = %self.name, "Background task stopped");
            }
        }
    }

    /// Whether the loop is alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn notified(wake: Option<&Notify>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counter {
        ticks: AtomicU64,
    }

    #[tokio::test]
    async fn test_periodic_ticks_and_stop() {
        let counter = Arc::new(Counter::default());
        let task = BackgroundTask::new("counter");

        assert!(task.spawn_periodic(&counter, Duration::from_millis(10), |c| async move {
            c.ticks.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.stop();
        task.join().await;

        let ticks = counter.ticks.load(Ordering::Relaxed);
        assert!(ticks >= 2, "expected several ticks, got {ticks}");
        assert!(!task.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.ticks.load(Ordering::Relaxed), ticks);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let counter = Arc::new(Counter::default());
        let task = BackgroundTask::new("counter");
        let tick = |_c: Arc<Counter>| async {};

        assert!(task.spawn_periodic(&counter, Duration::from_secs(60), tick));
        assert!(!task.spawn_periodic(&counter, Duration::from_secs(60), tick));

        task.stop();
        task.join().await;
        assert!(task.spawn_periodic(&counter, Duration::from_secs(60), tick));
        task.stop();
        task.join().await;
    }

    #[tokio::test]
    async fn test_notify_triggers_tick() {
        let counter = Arc::new(Counter::default());
        let wake = Arc::new(Notify::new());
        let task = BackgroundTask::new("notified");

        task.spawn_periodic_or_notified(
            &counter,
            Duration::from_secs(3600),
            Arc::clone(&wake),
            |c| async move {
                c.ticks.fetch_add(1, Ordering::Relaxed);
            },
        );

        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.ticks.load(Ordering::Relaxed), 1);

        task.stop();
        task.join().await;
    }

    #[tokio::test]
    async fn test_exits_when_owner_dropped() {
        let counter = Arc::new(Counter::default());
        let task = BackgroundTask::new("orphaned");
        task.spawn_periodic(&counter, Duration::from_millis(5), |_c| async {});

        drop(counter);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_running());
    }

    #[test]
    fn test_spawn_without_runtime() {
        let counter = Arc::new(Counter::default());
        let task = BackgroundTask::new("no-runtime");
        assert!(!task.spawn_periodic(&counter, Duration::from_millis(5), |_c| async {}));
        assert!(!task.is_running());
        task.stop();
    }
}
