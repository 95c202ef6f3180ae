//! Scheduled tasks with explicit cancel handles.
//!
//! Heartbeats, eviction sweeps and edit debouncing all run on tokio timers, so
//! tests can drive them with a paused runtime clock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Owned handle to a spawned task. Cancelling or dropping it aborts the task.
#[derive(Debug)]
pub struct TaskHandle {
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `tick` every `period`, first firing one period from now.
///
/// The loop stops on its own when `tick` resolves to `false`.
pub fn every<F, Fut>(period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    TaskHandle::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !tick().await {
                break;
            }
        }
    })
}

/// Trailing-edge debouncer keyed by `K`.
///
/// Scheduling a key that already has a pending task cancels and replaces it,
/// so only the last action inside the window runs.
pub struct Debouncer<K> {
    window: Duration,
    pending: Mutex<HashMap<K, TaskHandle>>,
}

impl<K: Eq + Hash + Clone> Debouncer<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn schedule<F>(&self, key: K, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let task = TaskHandle::spawn(async move {
            tokio::time::sleep(window).await;
            action.await;
        });

        let mut pending = self.pending.lock();
        pending.retain(|_, handle| !handle.is_finished());
        // Replacing drops (and aborts) the previous handle.
        pending.insert(key, task);
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.pending.lock().remove(key) {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub fn cancel_all(&self) -> Vec<K> {
        self.pending
            .lock()
            .drain()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(key, _)| key)
            .collect()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending
            .lock()
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn every_fires_once_per_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let _task = every(Duration::from_secs(3), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(6_200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_stops_ticking() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut task = every(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        task.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_collapses_bursts() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let fired = fired.clone();
            debouncer.schedule("a.txt", async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(debouncer.is_pending(&"a.txt"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending(&"a.txt"));
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_cancel_drops_pending_action() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        debouncer.schedule(1u32, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(debouncer.cancel(&1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
