// crates/client/src/timer.rs
//! Cancellable periodic tick driving simulated progress.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

pub struct ProgressTimer {
    period: Duration,
    interval: Option<Interval>,
}

impl ProgressTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Start ticking one period from now. No-op if already running.
    pub fn start(&mut self) {
        if self.interval.is_none() {
            let mut interval = time::interval_at(Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.interval = Some(interval);
        }
    }

    /// Stop ticking. Returns whether the timer was running.
    pub fn stop(&mut self) -> bool {
        self.interval.take().is_some()
    }

    /// Start or stop so the timer matches `wanted`.
    pub fn sync(&mut self, wanted: bool) {
        if wanted {
            self.start();
        } else {
            self.stop();
        }
    }

    /// Resolves on the next tick; pending forever while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_one_period() {
        let mut timer = ProgressTimer::new(Duration::from_millis(500));
        timer.start();
        let started = Instant::now();
        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut timer = ProgressTimer::new(Duration::from_millis(500));
        timer.start();
        assert!(timer.stop());
        assert!(!timer.stop());
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let mut timer = ProgressTimer::new(Duration::from_millis(500));
        let fired = time::timeout(Duration::from_secs(10), timer.tick()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_schedule() {
        let mut timer = ProgressTimer::new(Duration::from_millis(500));
        timer.start();
        time::advance(Duration::from_millis(300)).await;
        timer.sync(true);
        let started = Instant::now();
        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }
}
