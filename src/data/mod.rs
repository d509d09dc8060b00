use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

pub mod bucketed;
pub mod counter;
pub mod distribution;
pub mod ewma;
pub mod gauge;
pub mod histogram;
pub mod meter;
pub mod munro_paterson;
pub mod sample;

pub use self::bucketed::{make_buckets_for_error, BucketedHistogram};
pub use self::counter::{Counter, CounterFn};
pub use self::distribution::{Distribution, DistributionValue};
pub use self::ewma::{m15_alpha, m1_alpha, m5_alpha, Ewma, EwmaGauge};
pub use self::gauge::{GaugeFn, IntegerGauge};
pub use self::histogram::{
    default_percentile_names, default_percentiles, percentile_name, Histogram, SampledHistogram,
};
pub use self::meter::Meter;
pub use self::munro_paterson::{MunroPatersonHistogram, Precision};
pub use self::sample::{ExponentiallyDecayingSample, Sample, UniformSample};

/// A metric that expands into further named metrics during registry
/// iteration, each prefixed by the name it was registered under.
pub trait Collection: Send + Sync {
    fn metrics(&self) -> Vec<(String, Metric)>;
}

/// A registered metric handle.
///
/// All variants are `Arc`-backed, so `Metric` is cheap to clone and handles
/// stay live for callers that keep updating them after registration.
#[derive(Clone)]
pub enum Metric {
    Counter(Arc<Counter>),
    CounterFn(CounterFn),
    Gauge(Arc<IntegerGauge>),
    GaugeFn(GaugeFn),
    Distribution(Arc<Distribution>),
    Ewma(Arc<Ewma>),
    EwmaGauge(Arc<EwmaGauge>),
    Meter(Arc<Meter>),
    Histogram(Arc<dyn Histogram>),
    Collection(Arc<dyn Collection>),
}

impl From<Arc<Counter>> for Metric {
    fn from(c: Arc<Counter>) -> Metric {
        Metric::Counter(c)
    }
}

impl From<Arc<IntegerGauge>> for Metric {
    fn from(g: Arc<IntegerGauge>) -> Metric {
        Metric::Gauge(g)
    }
}

impl From<Arc<Distribution>> for Metric {
    fn from(d: Arc<Distribution>) -> Metric {
        Metric::Distribution(d)
    }
}

impl From<Arc<Ewma>> for Metric {
    fn from(e: Arc<Ewma>) -> Metric {
        Metric::Ewma(e)
    }
}

impl From<Arc<Meter>> for Metric {
    fn from(m: Arc<Meter>) -> Metric {
        Metric::Meter(m)
    }
}

impl Serialize for Metric {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Metric::Counter(c) => serializer.serialize_u64(c.count()),
            Metric::CounterFn(c) => serializer.serialize_u64(c.count()),
            Metric::Gauge(g) => serializer.serialize_i64(g.integer_value()),
            Metric::GaugeFn(g) => serializer.serialize_f64(g.value()),
            Metric::Distribution(d) => d.value().serialize(serializer),
            Metric::Ewma(e) => serializer.serialize_f64(e.rate()),
            Metric::EwmaGauge(e) => serializer.serialize_f64(e.mean()),
            Metric::Meter(m) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("1m", &m.one_minute_rate())?;
                map.serialize_entry("5m", &m.five_minute_rate())?;
                map.serialize_entry("15m", &m.fifteen_minute_rate())?;
                map.end()
            }
            Metric::Histogram(h) => {
                let percentiles = default_percentiles();
                let names = default_percentile_names();
                let values = h.percentiles(&percentiles);
                let mut map = serializer.serialize_map(Some(5 + values.len()))?;
                map.serialize_entry("count", &h.count())?;
                map.serialize_entry("sum", &h.sum())?;
                map.serialize_entry("min", &h.min())?;
                map.serialize_entry("max", &h.max())?;
                map.serialize_entry("mean", &h.mean())?;
                for (name, value) in names.iter().zip(values.iter()) {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
            Metric::Collection(c) => {
                let entries = c.metrics();
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (name, metric) in entries {
                    map.serialize_entry(&name, &metric)?;
                }
                map.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, Histogram, Metric, SampledHistogram};
    use std::sync::Arc;

    #[test]
    fn test_counter_serializes_as_number() {
        let c = Arc::new(Counter::new());
        c.inc(7);
        let json = serde_json::to_string(&Metric::Counter(c)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_histogram_serializes_summary() {
        let h = Arc::new(SampledHistogram::unbiased());
        h.update(10);
        h.update(20);
        let json = serde_json::to_value(Metric::Histogram(h)).unwrap();
        assert_eq!(json["count"], 2);
        assert_eq!(json["sum"], 30);
        assert_eq!(json["min"], 10);
        assert_eq!(json["max"], 20);
        assert_eq!(json["mean"], 15.0);
        assert!(json.get("p50").is_some());
    }
}
