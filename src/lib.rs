//! In-process metrics instrumentation with streaming summary structures,
//! periodic reporting, and a UDP aggregation daemon.
//!
//! Measurement sites update handles obtained from a [`Registry`]; a
//! [`PeriodicReporter`] takes consistent snapshots and drives one or more
//! sinks (Graphite, Librato, CloudWatch, StatHat, InfluxDB, plain writers)
//! from each. Counters are reported as deltas between snapshots, histograms
//! estimate quantiles with bounded memory, and meters track 1/5/15-minute
//! exponentially-weighted rates.

pub mod clock;
pub mod daemon;
pub mod data;
pub mod error;
pub mod http;
pub mod registry;
pub mod reporter;
pub mod snapshot;

pub use self::daemon::Aggregator;
pub use self::data::{
    default_percentile_names, default_percentiles, make_buckets_for_error, percentile_name,
    BucketedHistogram, Collection, Counter, CounterFn, Distribution, DistributionValue, Ewma,
    EwmaGauge, ExponentiallyDecayingSample, GaugeFn, Histogram, IntegerGauge, Meter, Metric,
    MunroPatersonHistogram, Precision, Sample, SampledHistogram, UniformSample,
};
pub use self::error::Error;
pub use self::http::RegistryServer;
pub use self::registry::{FilteredRegistry, MetricSource, Registry};
pub use self::reporter::{
    ns_to_next_interval, CloudWatchReporter, GraphiteReporter, InfluxDbReporter, LibratoReporter,
    PeriodicReporter, Reporter, StatHatReporter, WriterReporter,
};
pub use self::snapshot::{
    CounterDeltaCache, NamedDistribution, NamedValue, RegistrySnapshot, ValueKind,
};
