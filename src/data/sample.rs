use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::clock::{SystemClock, TimeSource};

/// Default rescale threshold for the decaying reservoir: one hour.
const RESCALE_THRESHOLD_NS: u64 = 3_600_000_000_000;

/// A fixed-size sample maintained online over an unbounded stream.
///
/// Implementations are not internally synchronized; the owning histogram
/// serializes access.
pub trait Sample: Send {
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn values(&self) -> Vec<i64>;
    fn update(&mut self, value: i64);
}

/// A uniform random sample using Vitter's Algorithm R.
pub struct UniformSample {
    reservoir_size: usize,
    values: Vec<i64>,
    count: u64,
    rng: SmallRng,
}

impl UniformSample {
    pub fn new(reservoir_size: usize) -> UniformSample {
        UniformSample {
            reservoir_size,
            values: Vec::with_capacity(reservoir_size),
            count: 0,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl Sample for UniformSample {
    fn clear(&mut self) {
        self.count = 0;
        self.values.clear();
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn values(&self) -> Vec<i64> {
        self.values.clone()
    }

    fn update(&mut self, value: i64) {
        self.count += 1;
        if self.values.len() < self.reservoir_size {
            self.values.push(value);
        } else {
            let r = (self.rng.gen::<f64>() * self.count as f64) as usize;
            if r < self.reservoir_size {
                self.values[r] = value;
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PriorityValue {
    priority: f64,
    value: i64,
}

// Min-heap on priority over a plain vector; the root holds the smallest
// priority, which is the first candidate for eviction.
#[derive(Default)]
struct Reservoir {
    samples: Vec<PriorityValue>,
}

impl Reservoir {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    fn values(&self) -> Vec<i64> {
        self.samples.iter().map(|pv| pv.value).collect()
    }

    fn root_priority(&self) -> f64 {
        self.samples[0].priority
    }

    fn push(&mut self, pv: PriorityValue) {
        self.samples.push(pv);
        self.sift_up(self.samples.len() - 1);
    }

    fn pop_root(&mut self) -> PriorityValue {
        let root = self.samples.swap_remove(0);
        if !self.samples.is_empty() {
            self.sift_down(0);
        }
        root
    }

    // Scaling every priority by the same positive factor is monotonic, so
    // the heap property survives an in-place pass.
    fn scale_priorities(&mut self, scale: f64) {
        for pv in &mut self.samples {
            pv.priority *= scale;
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.samples[i].priority < self.samples[parent].priority {
                self.samples.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.samples.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < len && self.samples[left].priority < self.samples[smallest].priority {
                smallest = left;
            }
            if right < len && self.samples[right].priority < self.samples[smallest].priority {
                smallest = right;
            }
            if smallest == i {
                return;
            }
            self.samples.swap(i, smallest);
            i = smallest;
        }
    }
}

/// An exponentially-decaying random sample using Cormode et al.'s
/// forward-decay priority reservoir, biased towards newer values.
///
/// Priorities grow as `exp(alpha * (t - L))` relative to a landmark `L`;
/// once an hour the landmark advances and every stored priority is rescaled
/// by the same factor so the float range stays bounded.
pub struct ExponentiallyDecayingSample {
    reservoir_size: usize,
    alpha: f64,
    values: Reservoir,
    count: u64,
    start_time: u64,
    next_scale_time: u64,
    clock: Arc<dyn TimeSource>,
    rng: SmallRng,
}

impl ExponentiallyDecayingSample {
    pub fn new(reservoir_size: usize, alpha: f64) -> ExponentiallyDecayingSample {
        ExponentiallyDecayingSample::with_clock(reservoir_size, alpha, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        reservoir_size: usize,
        alpha: f64,
        clock: Arc<dyn TimeSource>,
    ) -> ExponentiallyDecayingSample {
        let now = clock.now();
        ExponentiallyDecayingSample {
            reservoir_size,
            alpha,
            values: Reservoir::default(),
            count: 0,
            start_time: now,
            next_scale_time: now + RESCALE_THRESHOLD_NS,
            clock,
            rng: SmallRng::from_entropy(),
        }
    }

    fn weight(&self, delta_ns: u64) -> f64 {
        (self.alpha * (delta_ns as f64 / 1e9)).exp()
    }

    /// Advances the landmark to `now` and rescales every stored priority by
    /// `exp(-alpha * (now - L))` in one pass. The stored count collapses to
    /// the heap size so the reservoir re-fills by appending afterwards.
    fn rescale(&mut self, now: u64) {
        let old_start_time = self.start_time;
        self.start_time = now;
        self.next_scale_time = now + RESCALE_THRESHOLD_NS;
        let scale = (-self.alpha * ((now - old_start_time) as f64 / 1e9)).exp();
        self.values.scale_priorities(scale);
        self.count = self.values.len() as u64;
    }
}

impl Sample for ExponentiallyDecayingSample {
    fn clear(&mut self) {
        self.values.clear();
        self.count = 0;
        self.start_time = self.clock.now();
        self.next_scale_time = self.start_time + RESCALE_THRESHOLD_NS;
    }

    fn len(&self) -> usize {
        (self.count as usize).min(self.values.len())
    }

    fn values(&self) -> Vec<i64> {
        self.values.values()
    }

    fn update(&mut self, value: i64) {
        let timestamp = self.clock.now();
        if timestamp > self.next_scale_time {
            self.rescale(timestamp);
        }

        let u: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let priority = self.weight(timestamp - self.start_time) / u;
        self.count += 1;
        if self.values.len() < self.reservoir_size {
            self.values.push(PriorityValue { priority, value });
        } else if priority > self.values.root_priority() {
            self.values.pop_root();
            self.values.push(PriorityValue { priority, value });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExponentiallyDecayingSample, Sample, UniformSample};
    use crate::clock::Mock;
    use std::sync::Arc;

    fn all_values_between(values: &[i64], min: i64, max: i64) -> bool {
        values.iter().all(|&v| v >= min && v <= max)
    }

    #[test]
    fn test_uniform_sample_sizes() {
        for (reservoir_size, population_size) in [(1000usize, 100i64), (100, 1000)] {
            let mut sample = UniformSample::new(reservoir_size);
            assert_eq!(sample.len(), 0);
            for i in 0..population_size {
                sample.update(i);
            }
            let expected = (reservoir_size as i64).min(population_size) as usize;
            assert_eq!(sample.len(), expected);
            assert!(all_values_between(&sample.values(), 0, population_size - 1));
        }
    }

    #[test]
    fn test_uniform_sample_clear() {
        let mut sample = UniformSample::new(10);
        for i in 0..100 {
            sample.update(i);
        }
        sample.clear();
        assert_eq!(sample.len(), 0);
        assert!(sample.values().is_empty());
        sample.update(7);
        assert_eq!(sample.values(), vec![7]);
    }

    #[test]
    fn test_ed_sample_sizes() {
        for (reservoir_size, population_size, alpha) in
            [(1000usize, 100i64, 0.99), (100, 1000, 0.99), (1000, 100, 0.01)]
        {
            let mut sample = ExponentiallyDecayingSample::new(reservoir_size, alpha);
            assert_eq!(sample.len(), 0);
            for i in 0..population_size {
                sample.update(i);
            }
            let expected = (reservoir_size as i64).min(population_size) as usize;
            assert_eq!(sample.len(), expected);
            assert!(all_values_between(&sample.values(), 0, population_size));
        }
    }

    // Long periods of inactivity must not corrupt sampling state: after a
    // 15-hour idle gap, the reservoir should hold only fresh values.
    #[test]
    fn test_ed_sample_inactivity() {
        let clock = Arc::new(Mock::new(0));
        let mut sample = ExponentiallyDecayingSample::with_clock(10, 0.015, clock.clone());

        // 1000 values at 10 values/second.
        for i in 0..1000 {
            sample.update(1000 + i);
            clock.advance(100_000_000);
        }
        assert_eq!(sample.values().len(), 10);
        assert!(all_values_between(&sample.values(), 1000, 2000));

        // 15 hours of silence, then one more value triggers a rescale.
        clock.advance(15 * 3600 * 1_000_000_000);
        sample.update(2000);
        assert!(all_values_between(&sample.values(), 1000, 3000));

        // Another 1000 fresh values; the sample must contain only them.
        for i in 0..1000 {
            sample.update(3000 + i);
            clock.advance(100_000_000);
        }
        assert_eq!(sample.values().len(), 10);
        assert!(all_values_between(&sample.values(), 3000, 4000));
    }

    #[test]
    fn test_ed_sample_rescale_resets_count_to_heap_size() {
        let clock = Arc::new(Mock::new(0));
        let mut sample = ExponentiallyDecayingSample::with_clock(4, 0.015, clock.clone());
        for i in 0..100 {
            sample.update(i);
        }
        assert_eq!(sample.len(), 4);

        clock.advance(2 * 3600 * 1_000_000_000);
        sample.update(100);
        // count collapsed to the heap size on rescale, so len stays bounded
        // by the actual stored samples.
        assert_eq!(sample.len(), 4);
    }
}
