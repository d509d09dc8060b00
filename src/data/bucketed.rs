use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use hashbrown::HashMap;

use crate::data::histogram::{clamp_fraction, Histogram};

// Bucket layouts are shared per error rate; building one walks ~200 steps of
// float multiplication so repeated constructions reuse the cached offsets.
fn bucket_cache() -> &'static Mutex<HashMap<u64, Vec<i64>>> {
    static CACHE: OnceLock<Mutex<HashMap<u64, Vec<i64>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Given an error (+/-), computes all the bucket values from 1 until the
/// positive 64-bit range runs out. The error is a fraction between 0.0 and
/// 1.0.
///
/// Each bucket's value is the midpoint of an error range to the edge of the
/// bucket in each direction, so with a 5% error the bucket with value N
/// covers numbers 5% smaller (0.95*N) and 5% larger (1.05*N). For the usual
/// default of 5% this yields 200 buckets; the last bucket effectively
/// extends to infinity.
pub fn make_buckets_for_error(error: f64) -> Vec<i64> {
    let mut cache = bucket_cache().lock().unwrap();
    if let Some(offsets) = cache.get(&error.to_bits()) {
        return offsets.clone();
    }

    let mut offsets = vec![1i64];
    let mut last_value = 1i64;
    let factor = (1.0 + error) / (1.0 - error);
    let max = i64::MAX as f64;
    let mut next = 1.0f64;
    loop {
        next *= factor;
        if next >= max {
            break;
        }
        let value = next as i64 + 1;
        if value != last_value {
            offsets.push(value);
            last_value = value;
        }
    }

    cache.insert(error.to_bits(), offsets.clone());
    offsets
}

/// A histogram that counts values into a fixed set of exclusive-maximum
/// buckets.
///
/// All state is atomic, so updates never lock; percentile queries walk the
/// cumulative counts and report the midpoint of the chosen bucket's range.
pub struct BucketedHistogram {
    bucket_offsets: Vec<i64>,
    bucket_counts: Vec<AtomicU64>,
    min: AtomicI64,
    max: AtomicI64,
    sum: AtomicI64,
    count: AtomicU64,
}

impl BucketedHistogram {
    pub fn new(bucket_offsets: Vec<i64>) -> BucketedHistogram {
        let mut bucket_counts = Vec::with_capacity(bucket_offsets.len() + 1);
        for _ in 0..=bucket_offsets.len() {
            bucket_counts.push(AtomicU64::new(0));
        }
        BucketedHistogram {
            bucket_offsets,
            bucket_counts,
            min: AtomicI64::new(i64::MAX),
            max: AtomicI64::new(i64::MIN),
            sum: AtomicI64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// A bucketed histogram with an error of 5%.
    pub fn with_default_buckets() -> BucketedHistogram {
        BucketedHistogram::new(make_buckets_for_error(0.05))
    }

    /// Index of the first bucket whose exclusive maximum exceeds `key`.
    pub(crate) fn bucket_index(&self, key: i64) -> usize {
        let mut low = 0i64;
        let mut high = self.bucket_offsets.len() as i64 - 1;
        while low <= high {
            let mid = (low + high + 1) >> 1;
            let mid_value = self.bucket_offsets[mid as usize];
            if mid_value < key {
                low = mid + 1;
            } else if mid_value > key {
                high = mid - 1;
            } else {
                // Exactly equal to this bucket's value, but the value is an
                // exclusive max, so bump it up.
                return (mid + 1) as usize;
            }
        }
        low as usize
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self, index: usize) -> u64 {
        self.bucket_counts[index].load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn bucket_offsets(&self) -> &[i64] {
        &self.bucket_offsets
    }
}

impl Histogram for BucketedHistogram {
    fn clear(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(i64::MAX, Ordering::Relaxed);
        self.max.store(i64::MIN, Ordering::Relaxed);
        for c in &self.bucket_counts {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn update(&self, value: i64) {
        let index = self.bucket_index(value);
        self.bucket_counts[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        loop {
            let min = self.min.load(Ordering::Relaxed);
            if value > min
                || self
                    .min
                    .compare_exchange_weak(min, value, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
        }
        loop {
            let max = self.max.load(Ordering::Relaxed);
            if value < max
                || self
                    .max
                    .compare_exchange_weak(max, value, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
        }
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum(&self) -> i64 {
        self.sum.load(Ordering::Relaxed)
    }

    fn min(&self) -> i64 {
        if self.count() == 0 {
            0
        } else {
            self.min.load(Ordering::Relaxed)
        }
    }

    fn max(&self) -> i64 {
        if self.count() == 0 {
            0
        } else {
            self.max.load(Ordering::Relaxed)
        }
    }

    fn mean(&self) -> f64 {
        let count = self.count();
        if count > 0 {
            self.sum() as f64 / count as f64
        } else {
            0.0
        }
    }

    fn percentiles(&self, percentiles: &[f64]) -> Vec<i64> {
        let mut scores = vec![0i64; percentiles.len()];

        // The walk carries the running total across queries, so the input
        // fractions must be ascending (as the default sets are).
        let mut total = 0u64;
        let mut index = 0usize;
        for (i, &p) in percentiles.iter().enumerate() {
            let p = clamp_fraction(p);
            if p == 0.0 {
                scores[i] = if self.count() == 0 { 0 } else { self.min() };
                continue;
            }
            let target = p * self.count() as f64;
            while (total as f64) < target {
                total += self.bucket_counts[index].load(Ordering::Relaxed);
                index += 1;
            }
            if index <= 1 {
                scores[i] = 0;
            } else if index - 1 >= self.bucket_offsets.len() {
                scores[i] = i64::MAX;
            } else {
                // Midpoint of [offsets[index-2], offsets[index-1]) without
                // overflowing the i64 addition.
                let o1 = self.bucket_offsets[index - 2];
                let o2 = self.bucket_offsets[index - 1];
                let bit = ((o1 & 1) | (o2 & 1)) ^ 1;
                scores[i] = (o1 >> 1) + (o2 >> 1) - bit;
            }
        }
        scores
    }
}
