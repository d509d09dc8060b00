use fnv::FnvHashMap;

use crate::data::{default_percentile_names, default_percentiles, DistributionValue, Metric};
use crate::registry::MetricSource;

/// How a scalar observation should be treated by sinks that distinguish
/// event counts from instantaneous readings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// A per-window event count (already a delta).
    Counter,
    /// An instantaneous reading: gauges, rates, percentiles.
    Gauge,
}

/// A named scalar observation.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedValue {
    pub name: String,
    pub value: f64,
    pub kind: ValueKind,
}

/// A named distribution observation.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedDistribution {
    pub name: String,
    pub value: DistributionValue,
}

/// Per-name memory of the last observed counter value, used to report
/// inter-snapshot deltas.
#[derive(Default)]
pub struct CounterDeltaCache {
    previous: FnvHashMap<String, u64>,
}

impl CounterDeltaCache {
    pub fn new() -> CounterDeltaCache {
        CounterDeltaCache::default()
    }

    /// Difference between `current` and the last value seen for `name`.
    ///
    /// The first call for a name returns `current`. A decrease is treated as
    /// a reset of the underlying counter and also returns the raw value.
    pub fn delta(&mut self, name: &str, current: u64) -> u64 {
        let previous = self.previous.insert(name.to_string(), current).unwrap_or(0);
        if current >= previous {
            current - previous
        } else {
            current
        }
    }
}

/// A typed projection of a registry, produced by walking it once.
///
/// In latched mode, counters are read with swap-to-zero and histograms are
/// cleared after their percentiles are taken, so each report window stands
/// alone. In cumulative mode the delta cache turns running counter values
/// into per-window deltas and nothing is cleared. The two modes are fixed
/// per snapshot instance.
pub struct RegistrySnapshot {
    pub values: Vec<NamedValue>,
    pub distributions: Vec<NamedDistribution>,
    latched: bool,
    counters: CounterDeltaCache,
}

impl RegistrySnapshot {
    pub fn new(latched: bool) -> RegistrySnapshot {
        RegistrySnapshot {
            values: Vec::new(),
            distributions: Vec::new(),
            latched,
            counters: CounterDeltaCache::new(),
        }
    }

    fn push_value(&mut self, name: String, value: f64) {
        self.values.push(NamedValue {
            name,
            value,
            kind: ValueKind::Gauge,
        });
    }

    fn push_counter(&mut self, name: String, value: f64) {
        self.values.push(NamedValue {
            name,
            value,
            kind: ValueKind::Counter,
        });
    }

    /// Replaces the snapshot contents with the current state of `source`.
    pub fn snapshot(&mut self, source: &dyn MetricSource) {
        self.values.clear();
        self.distributions.clear();

        let percentiles = default_percentiles();
        let percentile_names = default_percentile_names();

        // The visitor below is infallible, so the walk cannot error.
        let _ = source.each(&mut |name, metric| {
            match metric {
                Metric::Ewma(e) => self.push_value(name.to_string(), e.rate()),
                Metric::EwmaGauge(e) => self.push_value(name.to_string(), e.mean()),
                Metric::Meter(m) => {
                    self.push_value(format!("{}/1m", name), m.one_minute_rate());
                    self.push_value(format!("{}/5m", name), m.five_minute_rate());
                    self.push_value(format!("{}/15m", name), m.fifteen_minute_rate());
                }
                Metric::Histogram(h) => {
                    let value = h.distribution();
                    if value.count > 0 {
                        let perc = h.percentiles(&percentiles);
                        if self.latched {
                            h.clear();
                        }
                        self.distributions.push(NamedDistribution {
                            name: name.to_string(),
                            value,
                        });
                        for (pname, p) in percentile_names.iter().zip(perc.iter()) {
                            self.push_value(format!("{}/{}", name, pname), *p as f64);
                        }
                    }
                }
                Metric::Counter(c) => {
                    let value = if self.latched {
                        c.reset()
                    } else {
                        let current = c.count();
                        self.counters.delta(name, current)
                    };
                    self.push_counter(name.to_string(), value as f64);
                }
                Metric::CounterFn(c) => {
                    let current = c.count();
                    let delta = self.counters.delta(name, current);
                    self.push_counter(name.to_string(), delta as f64);
                }
                Metric::Gauge(g) => self.push_value(name.to_string(), g.value()),
                Metric::GaugeFn(g) => self.push_value(name.to_string(), g.value()),
                Metric::Distribution(d) => {
                    self.distributions.push(NamedDistribution {
                        name: name.to_string(),
                        value: d.value(),
                    });
                }
                // Collections are expanded by the registry walk itself.
                Metric::Collection(_) => {}
            }
            Ok(())
        });
    }
}
