use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{after, bounded, select, tick, Sender};
use log::warn;

use crate::registry::MetricSource;
use crate::snapshot::RegistrySnapshot;

pub mod cloudwatch;
pub mod graphite;
pub mod influxdb;
pub mod librato;
pub mod stathat;
pub mod writer;

pub use self::cloudwatch::CloudWatchReporter;
pub use self::graphite::GraphiteReporter;
pub use self::influxdb::InfluxDbReporter;
pub use self::librato::LibratoReporter;
pub use self::stathat::StatHatReporter;
pub use self::writer::WriterReporter;

/// A sink for registry snapshots.
///
/// Implementations log their own failures; a failed report attempt is
/// abandoned and the next tick retries without backoff.
pub trait Reporter: Send {
    fn report(&mut self, snapshot: &RegistrySnapshot);
}

/// Nanoseconds until the next wall-clock multiple of `interval`.
pub fn ns_to_next_interval(t: SystemTime, interval: Duration) -> Duration {
    let interval_ns = interval.as_nanos();
    let now_ns = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Duration::from_nanos((interval_ns - (now_ns % interval_ns)) as u64)
}

struct Shared {
    snapshot: RegistrySnapshot,
    reporter: Box<dyn Reporter>,
}

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Drives a reporter from a fresh registry snapshot at a fixed interval.
///
/// With `align_interval`, the first tick waits until the beginning of the
/// next even interval, which gives a better chance that different sources
/// for the same metric will fall on the same timestamp. The latched flag
/// selects the snapshot mode (see [`RegistrySnapshot`]). `start` is
/// idempotent and `stop` joins the loop; a stopped reporter may be started
/// again, keeping its delta cache.
pub struct PeriodicReporter {
    source: Arc<dyn MetricSource>,
    interval: Duration,
    align_interval: bool,
    shared: Arc<Mutex<Shared>>,
    running: Mutex<Option<Running>>,
}

impl PeriodicReporter {
    pub fn new(
        source: Arc<dyn MetricSource>,
        interval: Duration,
        align_interval: bool,
        latched: bool,
        reporter: Box<dyn Reporter>,
    ) -> PeriodicReporter {
        PeriodicReporter {
            source,
            interval,
            align_interval,
            shared: Arc::new(Mutex::new(Shared {
                snapshot: RegistrySnapshot::new(latched),
                reporter,
            })),
            running: Mutex::new(None),
        }
    }

    /// Starts the background loop. A no-op when already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let source = Arc::clone(&self.source);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let align = self.align_interval;

        let handle = thread::spawn(move || {
            if align {
                let delay = ns_to_next_interval(SystemTime::now(), interval);
                select! {
                    recv(after(delay)) -> _ => {}
                    recv(stop_rx) -> _ => return,
                }
            }
            let ticks = tick(interval);
            loop {
                select! {
                    recv(ticks) -> _ => {
                        match shared.lock() {
                            Ok(mut shared) => {
                                let shared = &mut *shared;
                                shared.snapshot.snapshot(&*source);
                                shared.reporter.report(&shared.snapshot);
                            }
                            Err(e) => warn!("skipping report, state poisoned: {}", e),
                        }
                    }
                    recv(stop_rx) -> _ => return,
                }
            }
        });

        *running = Some(Running { stop_tx, handle });
    }

    /// Signals the loop to exit and joins it. A no-op when not running.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(r) = running {
            let _ = r.stop_tx.send(());
            let _ = r.handle.join();
        }
    }

    /// Takes one snapshot and reports it immediately, outside the schedule.
    pub fn report_now(&self) {
        let mut shared = self.shared.lock().unwrap();
        let shared = &mut *shared;
        shared.snapshot.snapshot(&*self.source);
        shared.reporter.report(&shared.snapshot);
    }
}

impl Drop for PeriodicReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{ns_to_next_interval, PeriodicReporter, Reporter};
    use crate::data::{Counter, Metric};
    use crate::registry::Registry;
    use crate::snapshot::RegistrySnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_ns_to_next_interval() {
        // 2012-12-01 12:10:19.999999800 UTC.
        let secs = 1354363819u64;
        let t = UNIX_EPOCH + Duration::new(secs, 999_999_800);
        let ns = ns_to_next_interval(t, Duration::from_secs(60));
        assert_eq!(ns, Duration::new(40, 200));
    }

    #[test]
    fn test_ns_to_next_interval_on_boundary() {
        let t = UNIX_EPOCH + Duration::from_secs(1354363800);
        let ns = ns_to_next_interval(t, Duration::from_secs(60));
        assert_eq!(ns, Duration::from_secs(60));
    }

    struct CountingReporter {
        reports: Arc<AtomicUsize>,
    }

    impl Reporter for CountingReporter {
        fn report(&mut self, _snapshot: &RegistrySnapshot) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_periodic_reporter_ticks_and_stops() {
        let registry = Registry::new();
        registry.add("c", Metric::Counter(Arc::new(Counter::new())));

        let reports = Arc::new(AtomicUsize::new(0));
        let reporter = PeriodicReporter::new(
            Arc::new(registry),
            Duration::from_millis(10),
            false,
            false,
            Box::new(CountingReporter {
                reports: Arc::clone(&reports),
            }),
        );

        reporter.start();
        reporter.start(); // idempotent
        std::thread::sleep(Duration::from_millis(100));
        reporter.stop();
        let seen = reports.load(Ordering::SeqCst);
        assert!(seen > 0, "no reports after 100ms at a 10ms interval");

        // No further reports arrive once stopped.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reports.load(Ordering::SeqCst), seen);

        // Restart after stop is permitted.
        reporter.start();
        std::thread::sleep(Duration::from_millis(30));
        reporter.stop();
        assert!(reports.load(Ordering::SeqCst) > seen);
    }

    #[test]
    fn test_report_now_snapshots_once() {
        let registry = Registry::new();
        let counter = Arc::new(Counter::new());
        counter.inc(2);
        registry.add("req", Metric::Counter(Arc::clone(&counter)));

        let reports = Arc::new(AtomicUsize::new(0));
        let reporter = PeriodicReporter::new(
            Arc::new(registry),
            Duration::from_secs(3600),
            false,
            true,
            Box::new(CountingReporter {
                reports: Arc::clone(&reports),
            }),
        );
        reporter.report_now();
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert_eq!(counter.count(), 0); // latched snapshot reset it
    }
}
