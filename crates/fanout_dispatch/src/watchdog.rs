use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A resettable deadline shared by every worker of a run.
///
/// Any worker making progress calls [WatchdogTimer::reset]; the timer only fires once no worker
/// has reset it for the whole timeout. This is a liveness check across the pool, not a
/// per-operation timeout: a single progressing worker keeps the whole run alive even if a sibling
/// is hung, so a hung device may only be noticed once the others run out of work.
#[derive(Debug)]
pub struct WatchdogTimer {
    timeout: Option<Duration>,
    last_reset: Mutex<Instant>,
}

impl WatchdogTimer {
    /// `None` never fires.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            last_reset: Mutex::new(Instant::now()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Pushes the deadline forward.
    pub fn reset(&self) {
        *self.last_reset.lock() = Instant::now();
    }

    pub fn is_timed_out(&self) -> bool {
        match self.timeout {
            Some(timeout) => self.last_reset.lock().elapsed() > timeout,
            None => false,
        }
    }

    /// Time left until the timer fires, or `None` if it never does.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.last_reset.lock().elapsed()))
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::WatchdogTimer;

    #[test]
    fn no_timeout_never_fires() {
        let watchdog = WatchdogTimer::new(None);
        assert!(!watchdog.is_timed_out());
        assert_eq!(watchdog.remaining(), None);
    }

    #[test]
    fn fires_without_reset() {
        let watchdog = WatchdogTimer::new(Some(Duration::from_millis(5)));
        thread::sleep(Duration::from_millis(20));
        assert!(watchdog.is_timed_out());
        assert_eq!(watchdog.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn reset_pushes_deadline() {
        let watchdog = WatchdogTimer::new(Some(Duration::from_millis(200)));
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(60));
            watchdog.reset();
        }
        assert!(!watchdog.is_timed_out());
    }
}
