use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

/// Smoothing constant for a 1-minute window at a 5-second tick.
pub fn m1_alpha() -> f64 {
    1.0 - (-5.0f64 / 60.0).exp()
}

/// Smoothing constant for a 5-minute window at a 5-second tick.
pub fn m5_alpha() -> f64 {
    1.0 - (-5.0f64 / 60.0 / 5.0).exp()
}

/// Smoothing constant for a 15-minute window at a 5-second tick.
pub fn m15_alpha() -> f64 {
    1.0 - (-5.0f64 / 60.0 / 15.0).exp()
}

/// Handle for a background thread driving periodic ticks.
pub(crate) struct Ticker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawns a thread that invokes `f` every `interval` until stopped.
    pub(crate) fn spawn<F>(interval: Duration, f: F) -> Ticker
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::spawn(move || {
            let ticks = tick(interval);
            loop {
                select! {
                    recv(ticks) -> _ => f(),
                    recv(stop_rx) -> _ => return,
                }
            }
        });
        Ticker { stop_tx, handle }
    }

    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

// The tickable state, shared between the handle and its ticker thread.
struct Core {
    interval: Duration,
    alpha: f64,
    rate: AtomicU64,
    uncounted: AtomicU64,
    initialized: AtomicBool,
}

impl Core {
    fn rate(&self) -> f64 {
        f64::from_bits(self.rate.load(Ordering::Acquire))
    }

    fn tick(&self) {
        let count = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = count as f64 / self.interval.as_secs_f64();
        let rate = if self.initialized.load(Ordering::Relaxed) {
            let rate = self.rate();
            rate + self.alpha * (instant_rate - rate)
        } else {
            self.initialized.store(true, Ordering::Relaxed);
            instant_rate
        };
        self.rate.store(rate.to_bits(), Ordering::Release);
    }
}

/// An exponentially-weighted moving average rate estimator.
///
/// `update` accumulates into an atomic cell; `tick` folds the accumulated
/// count into the rate. The rate itself is a float published through an
/// integer cell so `rate()` is lock-free. `tick` must not be called
/// concurrently with itself; `update` may be called from any thread.
pub struct Ewma {
    core: Arc<Core>,
    ticker: Mutex<Option<Ticker>>,
}

impl Ewma {
    pub fn new(interval: Duration, alpha: f64) -> Ewma {
        Ewma {
            core: Arc::new(Core {
                interval,
                alpha,
                rate: AtomicU64::new(0f64.to_bits()),
                uncounted: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// One-minute window EWMA at the canonical 5-second tick.
    pub fn one_minute() -> Ewma {
        Ewma::new(Duration::from_secs(5), m1_alpha())
    }

    /// Five-minute window EWMA at the canonical 5-second tick.
    pub fn five_minute() -> Ewma {
        Ewma::new(Duration::from_secs(5), m5_alpha())
    }

    /// Fifteen-minute window EWMA at the canonical 5-second tick.
    pub fn fifteen_minute() -> Ewma {
        Ewma::new(Duration::from_secs(5), m15_alpha())
    }

    /// Adds `value` to the count folded in at the next tick.
    pub fn update(&self, value: u64) {
        self.core.uncounted.fetch_add(value, Ordering::Relaxed);
    }

    /// The current smoothed rate, in events per second.
    pub fn rate(&self) -> f64 {
        self.core.rate()
    }

    /// Folds the uncounted updates into the rate.
    ///
    /// Single-writer: drive from one thread (or the owned ticker) only.
    pub fn tick(&self) {
        self.core.tick();
    }

    /// Starts the background ticker. A no-op when already running.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_none() {
            let core = Arc::clone(&self.core);
            *ticker = Some(Ticker::spawn(core.interval, move || core.tick()));
        }
    }

    /// Stops and joins the background ticker, if any. Restart is permitted.
    pub fn stop(&self) {
        let ticker = self.ticker.lock().unwrap().take();
        if let Some(t) = ticker {
            t.stop();
        }
    }
}

struct GaugeCore {
    alpha: f64,
    mean: AtomicU64,
    initialized: AtomicBool,
    f: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl GaugeCore {
    fn mean(&self) -> f64 {
        f64::from_bits(self.mean.load(Ordering::Acquire))
    }

    fn tick(&self) {
        let value = (self.f)();
        let mean = if self.initialized.load(Ordering::Relaxed) {
            let mean = self.mean();
            mean + self.alpha * (value - mean)
        } else {
            self.initialized.store(true, Ordering::Relaxed);
            value
        };
        self.mean.store(mean.to_bits(), Ordering::Release);
    }
}

/// EWMA smoothing over a sampled gauge function.
///
/// Each tick samples the function and folds the observation into a running
/// mean: `mean += alpha * (value - mean)`.
pub struct EwmaGauge {
    interval: Duration,
    core: Arc<GaugeCore>,
    ticker: Mutex<Option<Ticker>>,
}

impl EwmaGauge {
    pub fn new<F>(interval: Duration, alpha: f64, f: F) -> EwmaGauge
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        EwmaGauge {
            interval,
            core: Arc::new(GaugeCore {
                alpha,
                mean: AtomicU64::new(0f64.to_bits()),
                initialized: AtomicBool::new(false),
                f: Box::new(f),
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn mean(&self) -> f64 {
        self.core.mean()
    }

    /// Samples the gauge function and folds it into the mean.
    pub fn tick(&self) {
        self.core.tick();
    }

    /// Starts the background ticker. A no-op when already running.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_none() {
            let core = Arc::clone(&self.core);
            *ticker = Some(Ticker::spawn(self.interval, move || core.tick()));
        }
    }

    /// Stops and joins the background ticker, if any.
    pub fn stop(&self) {
        let ticker = self.ticker.lock().unwrap().take();
        if let Some(t) = ticker {
            t.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{m15_alpha, m1_alpha, m5_alpha, Ewma, EwmaGauge};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn almost_equal(a: f64, b: f64, diff: f64) -> bool {
        (a - b).abs() < diff
    }

    // Expected decay of a single update(3) after M minutes of idle ticks at
    // a 5-second interval; the classic load-average table.
    fn decay_cases() -> Vec<(f64, u32, f64)> {
        vec![
            (m1_alpha(), 0, 0.60000000),
            (m1_alpha(), 1, 0.22072766),
            (m1_alpha(), 5, 0.00404277),
            (m1_alpha(), 15, 0.00000018),
            (m5_alpha(), 0, 0.60000000),
            (m5_alpha(), 1, 0.49123845),
            (m5_alpha(), 5, 0.22072766),
            (m5_alpha(), 15, 0.02987224),
            (m15_alpha(), 0, 0.60000000),
            (m15_alpha(), 1, 0.56130419),
            (m15_alpha(), 5, 0.42991879),
            (m15_alpha(), 15, 0.22072766),
        ]
    }

    #[test]
    fn test_ewma_decay_table() {
        for (alpha, minutes, expected) in decay_cases() {
            let e = Ewma::new(Duration::from_secs(5), alpha);
            e.update(3);
            e.tick();
            for _ in 0..(minutes * 60 / 5) {
                e.tick();
            }
            assert!(
                almost_equal(e.rate(), expected, 1e-8),
                "alpha={alpha:.8} minutes={minutes} expected={expected:.8} got={:.8}",
                e.rate()
            );
        }
    }

    #[test]
    fn test_ewma_concurrent_update() {
        let e = Arc::new(Ewma::one_minute());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let e = Arc::clone(&e);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    e.update(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        e.tick();
        // 4000 updates over a 5 second interval.
        assert!(almost_equal(e.rate(), 800.0, 1e-9));
    }

    #[test]
    fn test_ewma_ticker_start_stop() {
        let e = Ewma::new(Duration::from_millis(10), m1_alpha());
        e.update(100);
        e.start();
        e.start(); // idempotent
        thread::sleep(Duration::from_millis(100));
        e.stop();
        assert!(e.rate() > 0.0);
        // Restart after stop is allowed.
        e.start();
        e.stop();
    }

    #[test]
    fn test_ewma_gauge_smooths_samples() {
        let cell = Arc::new(AtomicU64::new(10));
        let inner = Arc::clone(&cell);
        let g = EwmaGauge::new(Duration::from_secs(5), 0.5, move || {
            inner.load(Ordering::Relaxed) as f64
        });
        g.tick();
        assert_eq!(g.mean(), 10.0);
        cell.store(20, Ordering::Relaxed);
        g.tick();
        assert_eq!(g.mean(), 15.0);
    }
}
