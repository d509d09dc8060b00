use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time, in nanoseconds since the UNIX epoch.
///
/// Metrics that decay or align against wall time take a `TimeSource` so
/// tests can drive time explicitly with [`Mock`].
pub trait TimeSource: Send + Sync {
    fn now(&self) -> u64;
}

/// System wall clock.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> u64 {
        // Pre-epoch system clocks are not a supported configuration.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// A controllable time source for tests.
pub struct Mock {
    offset: AtomicU64,
}

impl Mock {
    pub fn new(offset: u64) -> Mock {
        Mock {
            offset: AtomicU64::new(offset),
        }
    }

    /// Advances the mock clock by `amount` nanoseconds.
    pub fn advance(&self, amount: u64) {
        self.offset.fetch_add(amount, Ordering::Release);
    }
}

impl TimeSource for Mock {
    fn now(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{Mock, SystemClock, TimeSource};

    #[test]
    fn test_mock_advance() {
        let clock = Mock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
