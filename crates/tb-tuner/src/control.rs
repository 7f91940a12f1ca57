use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared pause/stop switch for a tuning run.
///
/// Cloned handles observe the same flags. Pausing takes effect at the
/// next evaluation boundary; a paused run parks on [`wait_if_paused`]
/// without spinning until it is resumed or stopped.
///
/// [`wait_if_paused`]: RunControl::wait_if_paused
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug, Default)]
struct ControlInner {
    paused: AtomicBool,
    stopped: AtomicBool,
    notify: Notify,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns immediately when not paused, and
    /// also returns once the run is stopped so callers can unwind.
    pub async fn wait_if_paused(&self) {
        loop {
            if !self.is_paused() || self.is_stopped() {
                return;
            }
            // Register before re-checking so a resume between the check
            // and the await is not lost.
            let notified = self.inner.notify.notified();
            if !self.is_paused() || self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_unpaused_wait_returns_immediately() {
        let control = RunControl::new();
        timeout(Duration::from_millis(50), control.wait_if_paused())
            .await
            .expect("must not block while running");
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let control = RunControl::new();
        control.pause();
        assert!(control.is_paused());

        let waiter = control.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_if_paused().await;
        });

        // Still parked after a short while.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.resume();
        timeout(Duration::from_millis(200), handle)
            .await
            .expect("resume must wake the waiter")
            .unwrap();
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn test_stop_wakes_paused_waiter() {
        let control = RunControl::new();
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_if_paused().await;
        });

        control.stop();
        timeout(Duration::from_millis(200), handle)
            .await
            .expect("stop must wake the waiter")
            .unwrap();
        assert!(control.is_stopped());
    }

    #[tokio::test]
    async fn test_resume_before_wait_does_not_block() {
        let control = RunControl::new();
        control.pause();
        control.resume();
        timeout(Duration::from_millis(50), control.wait_if_paused())
            .await
            .expect("wait after resume must not block");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = RunControl::new();
        let b = a.clone();
        a.pause();
        assert!(b.is_paused());
        b.stop();
        assert!(a.is_stopped());
    }
}
