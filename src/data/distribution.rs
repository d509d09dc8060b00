use std::sync::Mutex;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// A point-in-time projection of a distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DistributionValue {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub variance: f64,
}

impl DistributionValue {
    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance.sqrt()
    }
}

impl Serialize for DistributionValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry("count", &self.count)?;
        map.serialize_entry("sum", &self.sum)?;
        map.serialize_entry("min", &self.min)?;
        map.serialize_entry("max", &self.max)?;
        map.serialize_entry("stddev", &self.stddev())?;
        map.end()
    }
}

struct Inner {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    // Welford running moments; meaningless until the first sample.
    m: f64,
    s: f64,
}

impl Inner {
    fn empty() -> Inner {
        Inner {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            m: 0.0,
            s: 0.0,
        }
    }
}

/// Single-pass count/sum/min/max plus Welford variance.
///
/// Updates are O(1) under a short mutex; readers copy the state out under
/// the same lock so a value projection is internally consistent.
pub struct Distribution {
    inner: Mutex<Inner>,
}

impl Default for Distribution {
    fn default() -> Distribution {
        Distribution::new()
    }
}

impl Distribution {
    pub fn new() -> Distribution {
        Distribution {
            inner: Mutex::new(Inner::empty()),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::empty();
    }

    pub fn update(&self, value: f64) {
        let mut d = self.inner.lock().unwrap();
        d.count += 1;
        d.sum += value;
        if value < d.min {
            d.min = value;
        }
        if value > d.max {
            d.max = value;
        }
        if d.count == 1 {
            d.m = value;
            d.s = 0.0;
        } else {
            let new_m = d.m + ((value - d.m) / d.count as f64);
            d.s += (value - d.m) * (value - new_m);
            d.m = new_m;
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    pub fn sum(&self) -> f64 {
        self.inner.lock().unwrap().sum
    }

    pub fn min(&self) -> f64 {
        let d = self.inner.lock().unwrap();
        if d.count == 0 {
            0.0
        } else {
            d.min
        }
    }

    pub fn max(&self) -> f64 {
        let d = self.inner.lock().unwrap();
        if d.count == 0 {
            0.0
        } else {
            d.max
        }
    }

    pub fn mean(&self) -> f64 {
        let d = self.inner.lock().unwrap();
        if d.count == 0 {
            0.0
        } else {
            d.sum / d.count as f64
        }
    }

    pub fn variance(&self) -> f64 {
        let d = self.inner.lock().unwrap();
        if d.count > 1 {
            d.s / (d.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn value(&self) -> DistributionValue {
        let d = self.inner.lock().unwrap();
        let mut v = DistributionValue {
            count: d.count,
            sum: d.sum,
            min: d.min,
            max: d.max,
            variance: 0.0,
        };
        if d.count > 1 {
            v.variance = d.s / (d.count - 1) as f64;
        }
        if d.count == 0 {
            v.min = 0.0;
            v.max = 0.0;
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::Distribution;

    fn almost_equal(a: f64, b: f64, diff: f64) -> bool {
        (a - b).abs() < diff
    }

    #[test]
    fn test_empty_distribution_is_all_zeros() {
        let d = Distribution::new();
        assert_eq!(d.count(), 0);
        assert_eq!(d.mean(), 0.0);
        assert_eq!(d.min(), 0.0);
        assert_eq!(d.max(), 0.0);
        assert_eq!(d.variance(), 0.0);

        let v = d.value();
        assert_eq!(v.count, 0);
        assert_eq!(v.min, 0.0);
        assert_eq!(v.max, 0.0);
        assert_eq!(v.mean(), 0.0);
    }

    #[test]
    fn test_distribution_statistics() {
        let d = Distribution::new();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            d.update(x);
        }
        assert_eq!(d.count(), 8);
        assert_eq!(d.sum(), 40.0);
        assert_eq!(d.min(), 2.0);
        assert_eq!(d.max(), 9.0);
        assert_eq!(d.mean(), 5.0);
        // Sample variance of the classic stddev example set.
        assert!(almost_equal(d.variance(), 32.0 / 7.0, 1e-12));
        assert!(almost_equal(d.stddev(), (32.0f64 / 7.0).sqrt(), 1e-12));
    }

    #[test]
    fn test_single_value_has_zero_variance() {
        let d = Distribution::new();
        d.update(2.0);
        let v = d.value();
        assert_eq!(v.count, 1);
        assert_eq!(v.sum, 2.0);
        assert_eq!(v.min, 2.0);
        assert_eq!(v.max, 2.0);
        assert_eq!(v.variance, 0.0);
    }

    #[test]
    fn test_reset() {
        let d = Distribution::new();
        d.update(3.0);
        d.reset();
        assert_eq!(d.count(), 0);
        assert_eq!(d.min(), 0.0);
        d.update(1.0);
        assert_eq!(d.count(), 1);
        assert_eq!(d.mean(), 1.0);
    }
}
