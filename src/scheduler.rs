//! Timers with explicit, cancellable handles.
//!
//! Spawned tasks are detached: the runtime never waits on them at shutdown.
//! Owners that need a final run (the queue's last persist) cancel the timer
//! and do the work themselves.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs only the most recently scheduled task, `delay` after it was scheduled
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedule `task`, superseding any pending one.
    ///
    /// Outside a tokio runtime nothing is scheduled and `false` is returned.
    pub fn schedule<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, debounced task not scheduled");
            return false;
        };

        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let delay = self.delay;

        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == ticket {
                task().await;
            }
        });
        true
    }

    /// Drop the pending task, if any
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle to a periodic task; stopping (or dropping) it ends the loop
pub struct IntervalHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IntervalHandle {
    /// Call `tick` every `period`, first call after one full period
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { stop, task }
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for IntervalHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
