use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::reporter::Reporter;
use crate::snapshot::RegistrySnapshot;

/// Dumps each snapshot as plain `name: value` lines to any writer, one
/// timestamp header per report.
pub struct WriterReporter<W: Write + Send> {
    w: W,
}

impl<W: Write + Send> WriterReporter<W> {
    pub fn new(w: W) -> WriterReporter<W> {
        WriterReporter { w }
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write + Send> Reporter for WriterReporter<W> {
    fn report(&mut self, snapshot: &RegistrySnapshot) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Err(e) = writeln!(self.w, "-- {}", ts) {
            warn!("failed to write report header: {}", e);
            return;
        }
        for v in &snapshot.values {
            if let Err(e) = writeln!(self.w, "{}: {}", v.name, v.value) {
                warn!("failed to write {}: {}", v.name, e);
                return;
            }
        }
        for d in &snapshot.distributions {
            if let Err(e) = writeln!(
                self.w,
                "{}: count={} sum={} min={} max={} variance={}",
                d.name, d.value.count, d.value.sum, d.value.min, d.value.max, d.value.variance
            ) {
                warn!("failed to write {}: {}", d.name, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WriterReporter;
    use crate::data::{Counter, Histogram, Metric, SampledHistogram};
    use crate::registry::Registry;
    use crate::reporter::Reporter;
    use crate::snapshot::RegistrySnapshot;
    use std::sync::Arc;

    #[test]
    fn test_writer_reporter_output() {
        let registry = Registry::new();
        let counter = Arc::new(Counter::new());
        counter.inc(4);
        registry.add("hits", Metric::Counter(counter));
        let hist = Arc::new(SampledHistogram::unbiased());
        hist.update(7);
        registry.add("lat", Metric::Histogram(hist));

        let mut snap = RegistrySnapshot::new(false);
        snap.snapshot(&registry);

        let mut reporter = WriterReporter::new(Vec::new());
        reporter.report(&snap);
        let out = String::from_utf8(reporter.into_inner()).unwrap();

        assert!(out.starts_with("-- "));
        assert!(out.contains("hits: 4"));
        assert!(out.contains("lat/p50: 7"));
        assert!(out.contains("lat: count=1 sum=7 min=7 max=7 variance=0"));
    }
}
