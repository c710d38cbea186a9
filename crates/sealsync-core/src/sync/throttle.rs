//! Trailing-edge throttle
//!
//! `schedule()` arms a timer unless one is already armed; when it fires, a
//! tick is sent on the channel handed out by [`Throttle::new`]. A burst of
//! calls inside one window therefore produces exactly one tick, at the end
//! of the window. The first call is never forwarded immediately.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Coalescing timer
pub struct Throttle {
    interval: Duration,
    tx: mpsc::UnboundedSender<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Throttle {
    /// Create a throttle and the receiver its ticks arrive on
    pub fn new(interval: Duration) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let throttle = Self {
            interval,
            tx,
            timer: Mutex::new(None),
        };
        (throttle, rx)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the timer, or coalesce into the one already armed
    pub fn schedule(&self) {
        let mut timer = self.timer.lock();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let tx = self.tx.clone();
        let interval = self.interval;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(());
        }));
    }

    /// Disarm the timer; returns whether a tick was pending
    pub fn cancel(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_trailing_tick() {
        let (throttle, mut ticks) = Throttle::new(WINDOW);

        for _ in 0..5 {
            throttle.schedule();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(ticks.try_recv().is_err());
        assert!(throttle.is_pending());

        tokio::time::sleep(WINDOW).await;
        assert!(ticks.try_recv().is_ok());
        assert!(ticks.try_recv().is_err());
        assert!(!throttle.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_waits_for_window() {
        let (throttle, mut ticks) = Throttle::new(WINDOW);

        throttle.schedule();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(ticks.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ticks.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_after_fire() {
        let (throttle, mut ticks) = Throttle::new(WINDOW);

        throttle.schedule();
        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        assert!(ticks.try_recv().is_ok());

        throttle.schedule();
        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        assert!(ticks.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_tick() {
        let (throttle, mut ticks) = Throttle::new(WINDOW);

        throttle.schedule();
        assert!(throttle.cancel());
        assert!(!throttle.cancel());

        tokio::time::sleep(WINDOW * 2).await;
        assert!(ticks.try_recv().is_err());
    }
}
