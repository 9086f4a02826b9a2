//! Fixed-period background tasks.
//!
//! Ticks run one after another inside a single task, so a slow tick delays
//! the next one instead of overlapping it. A failing tick is the callback's
//! business; the schedule keeps going. Periods shorter than
//! [`MIN_PERIOD`] are raised to it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Shortest period a background task or retry loop runs with.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Raise `period` to [`MIN_PERIOD`], logging when it had to.
pub(crate) fn at_least_min(name: &'static str, period: Duration) -> Duration {
    if period < MIN_PERIOD {
        warn!(
            task = name,
            requested_ms = period.as_millis() as u64,
            "period too short, using the minimum"
        );
        MIN_PERIOD
    } else {
        period
    }
}

#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`. With `immediate` the first tick fires
    /// right away, otherwise after one full period.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, immediate: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = at_least_min(name, period);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = tokio::spawn(async move {
            let start = if immediate {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut interval = time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                debug!(task = name, "periodic tick");
                tick().await;
            }
        });

        debug!(task = name, period_secs = period.as_secs(), immediate, "started periodic task");
        Self {
            name,
            running,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the task. Calling it again is a no-op.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "stopped periodic task");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() -> std::future::Ready<()> + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_task_fires_before_first_period() {
        let (count, tick) = counter();
        let mut task = PeriodicTask::spawn("test", Duration::from_secs(30), true, tick);

        tokio::task::yield_now().await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        task.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits_one_period() {
        let (count, tick) = counter();
        let _task = PeriodicTask::spawn("test", Duration::from_secs(30), false, tick);

        time::sleep(Duration::from_secs(29)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_runs_at_the_minimum() {
        let (count, tick) = counter();
        let task = PeriodicTask::spawn("test", Duration::ZERO, true, tick);

        tokio::task::yield_now().await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(task.is_running());

        time::sleep(MIN_PERIOD).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let (count, tick) = counter();
        let mut task = PeriodicTask::spawn("test", Duration::from_secs(1), false, tick);
        assert!(task.is_running());

        task.stop();
        task.stop();
        assert!(!task.is_running());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
