use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Throttles page writes during flushes.
pub trait IoLimiter: Send + Sync {
    /// Called after `pages` pages were written; may sleep to hold a rate.
    fn on_pages_written(&self, pages: usize);
}

/// Never throttles.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl IoLimiter for Unlimited {
    fn on_pages_written(&self, _pages: usize) {}
}

/// Caps flush throughput at a fixed number of pages per second.
pub struct PagesPerSecond {
    rate: u32,
    window: Mutex<(Instant, u64)>,
}

impl PagesPerSecond {
    /// Creates a limiter allowing `rate` pages per second. A rate of zero
    /// disables throttling.
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    fn delay_for(&self, started: Instant, written: u64) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        let budget = Duration::from_secs_f64(written as f64 / self.rate as f64);
        budget.checked_sub(started.elapsed())
    }
}

impl IoLimiter for PagesPerSecond {
    fn on_pages_written(&self, pages: usize) {
        let delay = {
            let mut window = self.window.lock();
            if window.0.elapsed() > Duration::from_secs(1) {
                *window = (Instant::now(), 0);
            }
            window.1 += pages as u64;
            self.delay_for(window.0, window.1)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_never_sleeps() {
        let limiter = PagesPerSecond::new(0);
        let start = Instant::now();
        limiter.on_pages_written(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn rate_spreads_writes() {
        let limiter = PagesPerSecond::new(100);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.on_pages_written(1);
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
