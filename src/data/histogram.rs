use std::sync::Mutex;

use crate::data::distribution::DistributionValue;
use crate::data::sample::{ExponentiallyDecayingSample, Sample, UniformSample};

/// Default percentiles recorded by snapshots and reporters.
pub fn default_percentiles() -> Vec<f64> {
    vec![0.5, 0.75, 0.9, 0.99, 0.999, 0.9999]
}

/// Labels matching [`default_percentiles`], in order.
pub fn default_percentile_names() -> Vec<String> {
    ["p50", "p75", "p90", "p99", "p999", "p9999"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Formats a percentile fraction as a label: `0.5 → p50`, `0.999 → p999`.
pub fn percentile_name(p: f64) -> String {
    let p = clamp_fraction(p);
    if p == 0.0 {
        return "p0".to_string();
    }
    if p == 1.0 {
        return "p100".to_string();
    }
    let raw = format!("{}", p);
    let mut digits = raw.trim_start_matches("0.").replace('.', "");
    if digits.len() < 2 {
        digits.push('0');
    }
    format!("p{}", digits)
}

/// Percentile inputs are fractions in `[0, 1]`; anything outside is clamped.
pub(crate) fn clamp_fraction(p: f64) -> f64 {
    p.clamp(0.0, 1.0)
}

/// Common read surface of the quantile-estimating histograms.
///
/// Quantile queries on an empty histogram return zeros; they are never
/// errors.
pub trait Histogram: Send + Sync {
    fn clear(&self);
    fn update(&self, value: i64);
    fn count(&self) -> u64;
    fn sum(&self) -> i64;
    fn min(&self) -> i64;
    fn max(&self) -> i64;
    fn mean(&self) -> f64;

    /// Estimated values at the given percentile fractions.
    fn percentiles(&self, percentiles: &[f64]) -> Vec<i64>;

    fn distribution(&self) -> DistributionValue {
        DistributionValue {
            count: self.count(),
            sum: self.sum() as f64,
            min: self.min() as f64,
            max: self.max() as f64,
            variance: 0.0,
        }
    }
}

struct Inner {
    sample: Box<dyn Sample>,
    min: i64,
    max: i64,
    sum: i64,
    count: u64,
}

/// A histogram that delegates value storage to a reservoir sample while
/// tracking count/sum/min/max exactly.
///
/// Percentile computation takes the instance lock for the whole sort and
/// interpolation pass, so readers never observe an in-progress sort.
pub struct SampledHistogram {
    inner: Mutex<Inner>,
}

impl SampledHistogram {
    pub fn new(sample: Box<dyn Sample>) -> SampledHistogram {
        SampledHistogram {
            inner: Mutex::new(Inner {
                sample,
                min: 0,
                max: 0,
                sum: 0,
                count: 0,
            }),
        }
    }

    /// A histogram over a uniform sample of 1028 elements, which offers a
    /// 99.9% confidence level with a 5% margin of error assuming a normal
    /// distribution.
    pub fn unbiased() -> SampledHistogram {
        SampledHistogram::new(Box::new(UniformSample::new(1028)))
    }

    /// A histogram over an exponentially-decaying sample of 1028 elements
    /// with alpha 0.015, heavily biased to the past five minutes of
    /// measurements.
    pub fn biased() -> SampledHistogram {
        SampledHistogram::new(Box::new(ExponentiallyDecayingSample::new(1028, 0.015)))
    }

    /// The current contents of the backing reservoir.
    pub fn sample_values(&self) -> Vec<i64> {
        self.inner.lock().unwrap().sample.values()
    }
}

impl Histogram for SampledHistogram {
    fn clear(&self) {
        let mut h = self.inner.lock().unwrap();
        h.sample.clear();
        h.min = 0;
        h.max = 0;
        h.sum = 0;
        h.count = 0;
    }

    fn update(&self, value: i64) {
        let mut h = self.inner.lock().unwrap();
        h.count += 1;
        h.sum += value;
        h.sample.update(value);
        if h.count == 1 {
            h.min = value;
            h.max = value;
        } else {
            if value < h.min {
                h.min = value;
            }
            if value > h.max {
                h.max = value;
            }
        }
    }

    fn count(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    fn sum(&self) -> i64 {
        self.inner.lock().unwrap().sum
    }

    fn min(&self) -> i64 {
        let h = self.inner.lock().unwrap();
        if h.count == 0 {
            0
        } else {
            h.min
        }
    }

    fn max(&self) -> i64 {
        let h = self.inner.lock().unwrap();
        if h.count == 0 {
            0
        } else {
            h.max
        }
    }

    fn mean(&self) -> f64 {
        let h = self.inner.lock().unwrap();
        if h.count > 0 {
            h.sum as f64 / h.count as f64
        } else {
            0.0
        }
    }

    fn percentiles(&self, percentiles: &[f64]) -> Vec<i64> {
        let mut scores = vec![0i64; percentiles.len()];
        let mut values = {
            let h = self.inner.lock().unwrap();
            h.sample.values()
        };
        if values.is_empty() {
            return scores;
        }
        values.sort_unstable();

        let n = values.len();
        for (i, &p) in percentiles.iter().enumerate() {
            let pos = clamp_fraction(p) * (n + 1) as f64;
            let ipos = pos as usize;
            scores[i] = if ipos < 1 {
                values[0]
            } else if ipos >= n {
                values[n - 1]
            } else {
                let lower = values[ipos - 1];
                let upper = values[ipos];
                lower + ((pos - pos.floor()) * (upper - lower) as f64) as i64
            };
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::{percentile_name, Histogram, SampledHistogram};
    use crate::data::sample::UniformSample;

    #[test]
    fn test_empty_histogram() {
        let h = SampledHistogram::new(Box::new(UniformSample::new(100)));
        assert_eq!(h.count(), 0);
        assert_eq!(h.sum(), 0);
        assert_eq!(h.min(), 0);
        assert_eq!(h.max(), 0);
        assert_eq!(h.mean(), 0.0);
        assert_eq!(h.percentiles(&[0.5, 0.75, 0.99]), vec![0, 0, 0]);
    }

    #[test]
    fn test_histogram_1_to_10000() {
        let h = SampledHistogram::new(Box::new(UniformSample::new(100_000)));
        for i in 1..=10_000 {
            h.update(i);
        }
        assert_eq!(h.count(), 10_000);
        assert_eq!(h.sum(), 50_005_000);
        assert_eq!(h.min(), 1);
        assert_eq!(h.max(), 10_000);
        assert_eq!(h.mean(), 5000.5);
        assert_eq!(h.percentiles(&[0.5, 0.75, 0.99]), vec![5000, 7500, 9900]);
    }

    #[test]
    fn test_histogram_clear() {
        let h = SampledHistogram::unbiased();
        h.update(42);
        assert_eq!(h.count(), 1);
        h.clear();
        assert_eq!(h.count(), 0);
        assert_eq!(h.percentiles(&[0.5]), vec![0]);
    }

    #[test]
    fn test_single_value_distribution() {
        let h = SampledHistogram::unbiased();
        h.update(2);
        let v = h.distribution();
        assert_eq!(v.count, 1);
        assert_eq!(v.sum, 2.0);
        assert_eq!(v.min, 2.0);
        assert_eq!(v.max, 2.0);
        assert_eq!(v.variance, 0.0);
        assert_eq!(h.percentiles(&[0.5, 0.75, 0.99]), vec![2, 2, 2]);
    }

    #[test]
    fn test_out_of_range_percentiles_are_clamped() {
        let h = SampledHistogram::unbiased();
        for i in 1..=100 {
            h.update(i);
        }
        assert_eq!(h.percentiles(&[-0.5]), h.percentiles(&[0.0]));
        assert_eq!(h.percentiles(&[50.0]), h.percentiles(&[1.0]));
    }

    #[test]
    fn test_percentile_names() {
        assert_eq!(percentile_name(0.5), "p50");
        assert_eq!(percentile_name(0.75), "p75");
        assert_eq!(percentile_name(0.99), "p99");
        assert_eq!(percentile_name(0.999), "p999");
        assert_eq!(percentile_name(0.9999), "p9999");
    }
}
