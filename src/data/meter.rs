use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{SystemClock, TimeSource};
use crate::data::ewma::{Ewma, Ticker};

const TICK_INTERVAL: Duration = Duration::from_secs(5);

struct Rates {
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl Rates {
    fn tick(&self) {
        self.m1.tick();
        self.m5.tick();
        self.m15.tick();
    }
}

/// A composite of 1-, 5-, and 15-minute EWMAs plus a mean rate since start.
///
/// One shared ticker drives all three windows so they advance together.
pub struct Meter {
    count: AtomicU64,
    rates: Arc<Rates>,
    start_time: u64,
    clock: Arc<dyn TimeSource>,
    ticker: Mutex<Option<Ticker>>,
}

impl Meter {
    pub fn new() -> Meter {
        Meter::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Meter {
        Meter {
            count: AtomicU64::new(0),
            rates: Arc::new(Rates {
                m1: Ewma::one_minute(),
                m5: Ewma::five_minute(),
                m15: Ewma::fifteen_minute(),
            }),
            start_time: clock.now(),
            clock,
            ticker: Mutex::new(None),
        }
    }

    /// Adds `delta` events to the meter.
    pub fn update(&self, delta: u64) {
        self.count.fetch_add(delta, Ordering::Relaxed);
        self.rates.m1.update(delta);
        self.rates.m5.update(delta);
        self.rates.m15.update(delta);
    }

    /// Advances all three windows. Single-writer, like [`Ewma::tick`].
    pub fn tick(&self) {
        self.rates.tick();
    }

    /// Starts the shared background ticker. A no-op when already running.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_none() {
            let rates = Arc::clone(&self.rates);
            *ticker = Some(Ticker::spawn(TICK_INTERVAL, move || rates.tick()));
        }
    }

    /// Stops and joins the background ticker, if any.
    pub fn stop(&self) {
        let ticker = self.ticker.lock().unwrap().take();
        if let Some(t) = ticker {
            t.stop();
        }
    }

    /// Total number of events recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average rate since construction, in events per second.
    pub fn mean_rate(&self) -> f64 {
        let elapsed_ns = self.clock.now().saturating_sub(self.start_time);
        if elapsed_ns == 0 {
            return 0.0;
        }
        self.count() as f64 / (elapsed_ns as f64 / 1e9)
    }

    pub fn one_minute_rate(&self) -> f64 {
        self.rates.m1.rate()
    }

    pub fn five_minute_rate(&self) -> f64 {
        self.rates.m5.rate()
    }

    pub fn fifteen_minute_rate(&self) -> f64 {
        self.rates.m15.rate()
    }
}

impl Default for Meter {
    fn default() -> Meter {
        Meter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Meter;
    use crate::clock::Mock;
    use std::sync::Arc;

    #[test]
    fn test_meter_count_and_windows() {
        let meter = Meter::new();
        meter.update(3);
        meter.update(2);
        assert_eq!(meter.count(), 5);

        meter.tick();
        // One tick folds 5 events over a 5 second interval into every window.
        assert_eq!(meter.one_minute_rate(), 1.0);
        assert_eq!(meter.five_minute_rate(), 1.0);
        assert_eq!(meter.fifteen_minute_rate(), 1.0);
    }

    #[test]
    fn test_meter_mean_rate_uses_elapsed_time() {
        let clock = Arc::new(Mock::new(0));
        let meter = Meter::with_clock(clock.clone());
        meter.update(100);
        clock.advance(10_000_000_000); // 10 seconds
        assert_eq!(meter.mean_rate(), 10.0);
    }

    #[test]
    fn test_meter_steady_rate_converges() {
        // 1000 updates/sec for 5 minutes of simulated 5-second ticks.
        let meter = Meter::new();
        for _ in 0..60 {
            meter.update(5000);
            meter.tick();
        }
        let rate = meter.five_minute_rate();
        assert!(
            (rate - 1000.0).abs() / 1000.0 < 0.05,
            "five minute rate {rate} not within 5% of 1000"
        );
    }

    #[test]
    fn test_meter_ticker_lifecycle() {
        let meter = Meter::new();
        meter.start();
        meter.start();
        meter.stop();
        meter.start();
        meter.stop();
    }
}
