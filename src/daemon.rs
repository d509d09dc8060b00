use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Sender};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use log::{debug, info};

use crate::data::{Counter, Histogram, Meter, Metric, SampledHistogram};
use crate::registry::Registry;
use crate::reporter::Reporter;
use crate::snapshot::{NamedDistribution, NamedValue, RegistrySnapshot, ValueKind};

/// Counter packet type tag.
pub const PACKET_COUNTER: u8 = b'c';
/// Timing/histogram sample packet type tag.
pub const PACKET_TIMING: u8 = b't';

/// How often the aggregator reports, unless overridden.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

type CounterMap = HashMap<String, i64, FnvBuildHasher>;
type HistogramMap = HashMap<String, Arc<SampledHistogram>, FnvBuildHasher>;

struct AggState {
    counters: CounterMap,
    histograms: HistogramMap,
}

impl AggState {
    fn empty() -> AggState {
        AggState {
            counters: CounterMap::default(),
            histograms: HistogramMap::default(),
        }
    }
}

struct Sink {
    name: String,
    reporter: Box<dyn Reporter>,
    latency_us: Arc<SampledHistogram>,
}

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    state: Mutex<AggState>,
    percentiles: Vec<f64>,
    percentile_names: Vec<String>,
    requests: Arc<Counter>,
    request_rate: Arc<Meter>,
    sinks: Mutex<Vec<Sink>>,
    registry: Registry,
}

/// Aggregates UDP-delivered counter and timing samples and periodically
/// fans them out to the configured sinks.
///
/// The counter and histogram maps sit behind a single mutex; a report swaps
/// in fresh empty maps under the lock and carries the previous window out,
/// so updates issued after the swap land in the next window. The aggregator
/// also monitors itself: a request counter, a request-rate meter, and one
/// latency histogram per sink, all exposed through [`Aggregator::registry`].
pub struct Aggregator {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl Aggregator {
    /// `percentiles` pairs a label with a fraction in `[0, 1]`, e.g.
    /// `("p99", 0.99)`; the labels suffix histogram names in reports.
    pub fn new(percentiles: Vec<(String, f64)>) -> Aggregator {
        let registry = Registry::new();
        let requests = Arc::new(Counter::new());
        let request_rate = Arc::new(Meter::new());
        registry.add("requests", Metric::Counter(Arc::clone(&requests)));
        registry.add("requests_per_sec", Metric::Meter(Arc::clone(&request_rate)));

        let (percentile_names, percentiles) = percentiles.into_iter().unzip();
        Aggregator {
            inner: Arc::new(Inner {
                state: Mutex::new(AggState::empty()),
                percentiles,
                percentile_names,
                requests,
                request_rate,
                sinks: Mutex::new(Vec::new()),
                registry,
            }),
            running: Mutex::new(None),
        }
    }

    /// The self-monitoring registry (request counters and sink latencies).
    pub fn registry(&self) -> Registry {
        self.inner.registry.clone()
    }

    /// Registers a sink; its report latency is tracked under
    /// `<name>_latency_us`.
    pub fn add_sink(&self, name: &str, reporter: Box<dyn Reporter>) {
        let latency_us = Arc::new(SampledHistogram::biased());
        self.inner.registry.add(
            &format!("{}_latency_us", name),
            Metric::Histogram(Arc::clone(&latency_us) as Arc<dyn Histogram>),
        );
        self.inner.sinks.lock().unwrap().push(Sink {
            name: name.to_string(),
            reporter,
            latency_us,
        });
    }

    pub fn sink_count(&self) -> usize {
        self.inner.sinks.lock().unwrap().len()
    }

    /// Ingests one datagram.
    ///
    /// Wire format: a one-byte type tag (`'c'` counter, `'t'` timing), a
    /// big-endian signed 64-bit value, and the metric name as the remainder.
    /// Short packets and unknown tags are dropped silently; every datagram
    /// still counts toward the request statistics.
    pub fn record_packet(&self, buf: &[u8]) {
        self.inner.record_packet(buf);
    }

    /// Atomically hands the current window out and installs fresh maps.
    pub fn swap(&self) -> (CounterMap, HistogramMap) {
        self.inner.swap()
    }

    /// Swaps the current window and reports it through every sink, timing
    /// each sink call into its latency histogram. Empty windows are skipped.
    pub fn report_once(&self) {
        self.inner.report_once();
    }

    /// Starts the reporting loop at `interval`. A no-op when already running.
    pub fn start(&self, interval: Duration) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return;
        }
        self.inner.request_rate.start();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || {
            info!("reporting every {:?}", interval);
            let ticks = tick(interval);
            loop {
                select! {
                    recv(ticks) -> _ => inner.report_once(),
                    recv(stop_rx) -> _ => return,
                }
            }
        });
        *running = Some(Running { stop_tx, handle });
    }

    /// Signals the reporting loop to exit and joins it.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(r) = running {
            let _ = r.stop_tx.send(());
            let _ = r.handle.join();
        }
        self.inner.request_rate.stop();
    }
}

impl Inner {
    fn record_packet(&self, buf: &[u8]) {
        self.requests.inc(1);
        self.request_rate.update(1);

        if buf.len() < 10 {
            return;
        }
        let tag = buf[0];
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[1..9]);
        let value = i64::from_be_bytes(raw);
        let name = String::from_utf8_lossy(&buf[9..]);

        match tag {
            PACKET_COUNTER => self.update_counter(&name, value),
            PACKET_TIMING => self.update_histogram(&name, value),
            _ => debug!("dropping packet with unknown type tag {:#x}", tag),
        }
    }

    fn update_counter(&self, name: &str, value: i64) {
        let mut state = self.state.lock().unwrap();
        *state.counters.entry_ref(name).or_insert(0) += value;
    }

    fn update_histogram(&self, name: &str, value: i64) {
        let mut state = self.state.lock().unwrap();
        let hist = state
            .histograms
            .entry_ref(name)
            .or_insert_with(|| Arc::new(SampledHistogram::unbiased()));
        hist.update(value);
    }

    fn swap(&self) -> (CounterMap, HistogramMap) {
        let mut state = self.state.lock().unwrap();
        let old = std::mem::replace(&mut *state, AggState::empty());
        (old.counters, old.histograms)
    }

    /// Projects a swapped window into a snapshot: counters as per-window
    /// deltas, histograms as distributions plus per-percentile values.
    fn window_snapshot(&self, counters: CounterMap, histograms: HistogramMap) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::new(false);
        for (name, value) in counters {
            snapshot.values.push(NamedValue {
                name,
                value: value as f64,
                kind: ValueKind::Counter,
            });
        }
        for (name, hist) in histograms {
            if hist.count() == 0 {
                continue;
            }
            let perc = hist.percentiles(&self.percentiles);
            snapshot.distributions.push(NamedDistribution {
                name: name.clone(),
                value: hist.distribution(),
            });
            for (pname, p) in self.percentile_names.iter().zip(perc.iter()) {
                snapshot.values.push(NamedValue {
                    name: format!("{}/{}", name, pname),
                    value: *p as f64,
                    kind: ValueKind::Gauge,
                });
            }
        }
        snapshot
    }

    fn report_once(&self) {
        let (counters, histograms) = self.swap();
        if counters.is_empty() && histograms.is_empty() {
            return;
        }
        let snapshot = self.window_snapshot(counters, histograms);

        let mut sinks = self.sinks.lock().unwrap();
        for sink in sinks.iter_mut() {
            let start = Instant::now();
            sink.reporter.report(&snapshot);
            let elapsed_us = start.elapsed().as_micros() as i64;
            sink.latency_us.update(elapsed_us);
            debug!("reported to {} in {}us", sink.name, elapsed_us);
        }
    }
}

/// Builds a packet in the daemon wire format.
pub fn encode_packet(tag: u8, value: i64, name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + name.len());
    buf.push(tag);
    buf.extend_from_slice(&value.to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::{encode_packet, Aggregator, PACKET_COUNTER, PACKET_TIMING};
    use crate::data::Histogram;
    use crate::registry::MetricSource;
    use crate::reporter::Reporter;
    use crate::snapshot::{RegistrySnapshot, ValueKind};
    use std::sync::{Arc, Mutex};

    fn aggregator() -> Aggregator {
        Aggregator::new(vec![
            ("p90".to_string(), 0.90),
            ("p99".to_string(), 0.99),
            ("p999".to_string(), 0.999),
        ])
    }

    #[test]
    fn test_counter_packet_increments_by_value() {
        let agg = aggregator();
        agg.record_packet(&encode_packet(PACKET_COUNTER, 7, "hits"));
        let (counters, _) = agg.swap();
        assert_eq!(counters.get("hits"), Some(&7));
        assert_eq!(agg.inner.requests.count(), 1);
    }

    #[test]
    fn test_timing_packet_records_into_histogram() {
        let agg = aggregator();
        agg.record_packet(&encode_packet(PACKET_TIMING, 42, "lat"));
        let (_, histograms) = agg.swap();
        let hist = histograms.get("lat").unwrap();
        assert_eq!(hist.count(), 1);
        assert_eq!(hist.max(), 42);
    }

    #[test]
    fn test_short_packet_dropped_but_counted() {
        let agg = aggregator();
        // 9 bytes: tag + value but no name.
        let mut buf = encode_packet(PACKET_COUNTER, 7, "");
        assert_eq!(buf.len(), 9);
        agg.record_packet(&buf);
        buf.truncate(4);
        agg.record_packet(&buf);

        let (counters, histograms) = agg.swap();
        assert!(counters.is_empty());
        assert!(histograms.is_empty());
        assert_eq!(agg.inner.requests.count(), 2);
    }

    #[test]
    fn test_unknown_tag_dropped() {
        let agg = aggregator();
        agg.record_packet(&encode_packet(b'x', 1, "zap"));
        let (counters, histograms) = agg.swap();
        assert!(counters.is_empty());
        assert!(histograms.is_empty());
        assert_eq!(agg.inner.requests.count(), 1);
    }

    #[test]
    fn test_counters_accumulate_within_a_window() {
        let agg = aggregator();
        agg.record_packet(&encode_packet(PACKET_COUNTER, 2, "hits"));
        agg.record_packet(&encode_packet(PACKET_COUNTER, 3, "hits"));
        let (counters, _) = agg.swap();
        assert_eq!(counters.get("hits"), Some(&5));
    }

    #[test]
    fn test_swap_isolates_windows() {
        let agg = aggregator();
        agg.record_packet(&encode_packet(PACKET_COUNTER, 1, "a"));
        agg.record_packet(&encode_packet(PACKET_TIMING, 5, "t"));

        let (counters, histograms) = agg.swap();
        assert_eq!(counters.len(), 1);
        assert_eq!(histograms.len(), 1);

        // Updates issued strictly after the swap land in the fresh window.
        agg.record_packet(&encode_packet(PACKET_COUNTER, 9, "b"));
        let (counters, histograms) = agg.swap();
        assert_eq!(counters.get("b"), Some(&9));
        assert!(counters.get("a").is_none());
        assert!(histograms.is_empty());
    }

    #[derive(Clone, Default)]
    struct CapturingSink {
        seen: Arc<Mutex<Vec<(String, f64)>>>,
    }

    impl Reporter for CapturingSink {
        fn report(&mut self, snapshot: &RegistrySnapshot) {
            let mut seen = self.seen.lock().unwrap();
            for v in &snapshot.values {
                seen.push((v.name.clone(), v.value));
            }
        }
    }

    #[test]
    fn test_report_fans_out_to_all_sinks() {
        let agg = aggregator();
        let a = CapturingSink::default();
        let b = CapturingSink::default();
        agg.add_sink("a", Box::new(a.clone()));
        agg.add_sink("b", Box::new(b.clone()));
        assert_eq!(agg.sink_count(), 2);

        agg.record_packet(&encode_packet(PACKET_COUNTER, 1, "hit"));
        agg.report_once();

        for sink in [&a, &b] {
            let seen = sink.seen.lock().unwrap();
            assert_eq!(seen.as_slice(), &[("hit".to_string(), 1.0)]);
        }

        // The sink latency histograms picked up one observation each.
        let mut latencies = Vec::new();
        let _ = agg.registry().each(&mut |name, metric| {
            if name.ends_with("_latency_us") {
                if let crate::data::Metric::Histogram(h) = metric {
                    latencies.push((name.to_string(), h.count()));
                }
            }
            Ok(())
        });
        latencies.sort_unstable();
        assert_eq!(
            latencies,
            vec![("a_latency_us".to_string(), 1), ("b_latency_us".to_string(), 1)]
        );
    }

    #[test]
    fn test_empty_window_skips_sinks() {
        let agg = aggregator();
        let sink = CapturingSink::default();
        agg.add_sink("a", Box::new(sink.clone()));
        agg.report_once();
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_percentile_values_in_window_snapshot() {
        let agg = aggregator();
        let sink = CapturingSink::default();
        agg.add_sink("a", Box::new(sink.clone()));

        for i in 1..=100 {
            agg.record_packet(&encode_packet(PACKET_TIMING, i, "lat"));
        }
        agg.report_once();

        let seen = sink.seen.lock().unwrap();
        let names: Vec<&str> = seen.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"lat/p90"));
        assert!(names.contains(&"lat/p99"));
        assert!(names.contains(&"lat/p999"));
    }

    #[test]
    fn test_counter_kind_marks_window_counters() {
        let agg = aggregator();
        agg.record_packet(&encode_packet(PACKET_COUNTER, 4, "hits"));
        let (counters, histograms) = agg.swap();
        let snap = agg.inner.window_snapshot(counters, histograms);
        assert_eq!(snap.values[0].kind, ValueKind::Counter);
    }
}
