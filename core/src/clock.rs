/// Wall clock that never goes backwards and never repeats a reading
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epoch milliseconds, strictly greater than the previous reading.
    /// Bursts faster than 1/ms run slightly ahead of the wall clock.
    pub fn now_millis(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Never hand out a time earlier than `floor` (e.g. restored from disk)
    pub fn observe(&self, floor: i64) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now_millis();
        for _ in 0..1000 {
            let now = clock.now_millis();
            assert!(now > prev);
            prev = now;
        }
    }

    #[test]
    fn test_observe_future_floor() {
        let clock = MonotonicClock::new();
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        clock.observe(future);
        assert!(clock.now_millis() >= future);
    }
}
