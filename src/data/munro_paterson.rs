use std::sync::Mutex;

use crate::data::histogram::{clamp_fraction, Histogram};

const ELEM_SIZE: usize = 8; // sizeof i64

/// Maximum epsilon tolerated for a typical size of input.
#[derive(Clone, Copy, Debug)]
pub struct Precision {
    pub epsilon: f64,
    pub n: usize,
}

impl Default for Precision {
    fn default() -> Precision {
        Precision {
            epsilon: 0.02,
            n: 100_000,
        }
    }
}

/// Default memory budget for the buffer tree, in bytes.
pub const DEFAULT_MAX_MEMORY: usize = 12 * 1024;

/// The smallest buffer depth `b` satisfying
/// `(b - 2) * 2^(b - 2) + 0.5 > epsilon * n`.
pub(crate) fn compute_depth(epsilon: f64, n: usize) -> usize {
    let mut b = 2u32;
    let en = epsilon * n as f64;
    while ((b - 2) as f64 * (1u64 << (b - 2)) as f64) + 0.5 <= en {
        b += 1;
    }
    b as usize
}

pub(crate) fn compute_buffer_size(b: usize, n: usize) -> usize {
    n / (1 << (b - 1))
}

/// Maximum tree depth that fits the memory budget.
pub(crate) fn compute_max_depth(max_memory_bytes: usize, buffer_size: usize) -> usize {
    let overhead = 100 + ELEM_SIZE * buffer_size;
    let bm = if max_memory_bytes < overhead {
        2
    } else {
        (max_memory_bytes - overhead) / (16 + ELEM_SIZE * buffer_size)
    };
    bm.max(2)
}

struct Inner {
    // buffer[0] and buffer[1] are the leaves; higher levels hold collapse
    // results. Two scratch buffers rotate through the collapse chain.
    buffer: Vec<Vec<i64>>,
    buffer_pool: [Vec<i64>; 2],
    indices: Vec<usize>,
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
    leaf_count: usize,
    current_top: usize,
    root_weight: u64,
    buffer_size: usize,
    max_depth: usize,
}

/// An implementation of the Munro-Paterson approximate quantile algorithm:
/// a tree of fixed-size sorted buffers collapsed pairwise as input streams
/// in, answering rank queries within `epsilon * n` of the true rank.
pub struct MunroPatersonHistogram {
    inner: Mutex<Inner>,
}

impl MunroPatersonHistogram {
    pub fn new(buffer_size: usize, max_depth: usize) -> MunroPatersonHistogram {
        let buffer = (0..=max_depth).map(|_| vec![0i64; buffer_size]).collect();
        MunroPatersonHistogram {
            inner: Mutex::new(Inner {
                buffer,
                buffer_pool: [vec![0i64; buffer_size], vec![0i64; buffer_size]],
                indices: vec![0usize; max_depth + 1],
                count: 0,
                sum: 0,
                min: 0,
                max: 0,
                leaf_count: 0,
                current_top: 1,
                root_weight: 1,
                buffer_size,
                max_depth,
            }),
        }
    }

    /// Default precision (epsilon 0.02 over 100k inputs) within the default
    /// 12 KiB memory budget.
    pub fn with_defaults() -> MunroPatersonHistogram {
        MunroPatersonHistogram::with_max_memory(DEFAULT_MAX_MEMORY)
    }

    pub fn with_max_memory(bytes: usize) -> MunroPatersonHistogram {
        let p = Precision::default();
        let depth = compute_depth(p.epsilon, p.n);
        let buffer_size = compute_buffer_size(depth, p.n);
        let max_depth = compute_max_depth(bytes, buffer_size);
        MunroPatersonHistogram::new(buffer_size, max_depth)
    }

    pub fn with_precision(p: Precision) -> MunroPatersonHistogram {
        let depth = compute_depth(p.epsilon, p.n);
        let buffer_size = compute_buffer_size(depth, p.n);
        MunroPatersonHistogram::new(buffer_size, depth)
    }

    #[cfg(test)]
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }
}

impl Inner {
    /// Weight of a level: 1 for the two leaves, `root_weight` for the root,
    /// `2^(level - 1)` otherwise.
    fn weight(&self, level: usize) -> u64 {
        if level < 2 {
            1
        } else if level == self.max_depth {
            self.root_weight
        } else {
            1 << (level - 1)
        }
    }

    /// Whether the buffer at `level` currently holds no live data.
    ///
    /// The non-leaf levels behave like a binary counter of completed leaf
    /// collapses: level `i` is in use exactly when bit `i - 2` of
    /// `settled / (2 * buffer_size)` is set, where `settled` excludes the
    /// elements still sitting in the leaves. This keeps the occupied
    /// weights summing to `count - leaf_count` at every instant.
    fn is_buffer_empty(&self, level: usize) -> bool {
        if level == self.current_top {
            // The root buffer, when present, is always full.
            return false;
        }
        let settled = self.count - self.leaf_count as u64;
        (settled / (self.buffer_size as u64 * self.weight(level))) & 1 == 0
    }

    fn add(&mut self, x: i64) {
        // When both leaves are full, sort them and collapse the tree before
        // making room for the new value.
        if self.leaf_count == 2 * self.buffer_size {
            self.buffer[0].sort_unstable();
            self.buffer[1].sort_unstable();
            let carry = std::mem::take(&mut self.buffer[0]);
            let leftover = self.collapse_chain(carry, 1);
            self.buffer[0] = leftover;
            self.leaf_count = 0;
        }

        if self.leaf_count < self.buffer_size {
            let i = self.leaf_count;
            self.buffer[0][i] = x;
        } else {
            let i = self.leaf_count - self.buffer_size;
            self.buffer[1][i] = x;
        }
        self.leaf_count += 1;
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            if x < self.min {
                self.min = x;
            }
            if x > self.max {
                self.max = x;
            }
        }
        self.count += 1;
        self.sum += x;
    }

    /// Collapses `carry` upward from `level`, returning a same-sized buffer
    /// whose storage is free for reuse (the chain recycles the scratch pair,
    /// so no allocation happens on the hot path).
    fn collapse_chain(&mut self, mut carry: Vec<i64>, mut level: usize) -> Vec<i64> {
        loop {
            if level == self.max_depth {
                // The tree cannot grow: merge into the root in place and
                // grow the root weight instead.
                let merge_weight = 1u64 << (level - 1);
                let idx = level & 1;
                let mut merged = std::mem::take(&mut self.buffer_pool[idx]);
                if merge_weight == self.root_weight {
                    collapse_equal(&carry, &self.buffer[level], &mut merged);
                } else {
                    collapse(
                        &carry,
                        merge_weight,
                        &self.buffer[level],
                        self.root_weight,
                        &mut merged,
                    );
                }
                self.buffer_pool[idx] = std::mem::replace(&mut self.buffer[level], merged);
                self.root_weight += merge_weight;
                return carry;
            } else if level == self.current_top {
                // Reached the top: open a new level above it.
                let (lo, hi) = self.buffer.split_at_mut(level + 1);
                collapse_equal(&carry, &lo[level], &mut hi[0]);
                self.current_top += 1;
                self.root_weight *= 2;
                return carry;
            } else if self.is_buffer_empty(level + 1) {
                let (lo, hi) = self.buffer.split_at_mut(level + 1);
                collapse_equal(&carry, &lo[level], &mut hi[0]);
                return carry;
            } else {
                // The upper buffer holds data: collapse into scratch and keep
                // climbing, donating the spent carry back to the pool.
                let mut merged = std::mem::take(&mut self.buffer_pool[level & 1]);
                collapse_equal(&carry, &self.buffer[level], &mut merged);
                self.buffer_pool[level & 1] = carry;
                carry = merged;
                level += 1;
            }
        }
    }

    /// Level holding the smallest not-yet-consumed element, per the cursor
    /// array. Every buffer has been sorted by the time this runs.
    fn smallest(&self, buf0_size: usize, buf1_size: usize, indices: &[usize]) -> usize {
        let mut smallest = i64::MAX;
        let mut i_smallest = 0;

        if self.leaf_count > 0 && indices[0] < buf0_size {
            smallest = self.buffer[0][indices[0]];
        }
        if self.leaf_count > self.buffer_size && indices[1] < buf1_size {
            let x = self.buffer[1][indices[1]];
            if x < smallest {
                smallest = x;
                i_smallest = 1;
            }
        }
        for i in 2..=self.current_top {
            if !self.is_buffer_empty(i) && indices[i] < self.buffer_size {
                let x = self.buffer[i][indices[i]];
                if x < smallest {
                    smallest = x;
                    i_smallest = i;
                }
            }
        }
        i_smallest
    }

    fn percentiles(&mut self, qs: &[f64]) -> Vec<i64> {
        let mut output = vec![0i64; qs.len()];
        if self.count == 0 {
            return output;
        }

        // The two leaves are the only buffers that can be partially filled.
        let (buf0_size, buf1_size) = if self.leaf_count > self.buffer_size {
            (self.buffer_size, self.leaf_count - self.buffer_size)
        } else {
            (self.leaf_count, 0)
        };
        self.buffer[0][..buf0_size].sort_unstable();
        self.buffer[1][..buf1_size].sort_unstable();

        let mut indices = std::mem::take(&mut self.indices);
        indices.iter_mut().for_each(|i| *i = 0);

        let float_count = self.count as f64;
        let mut sum = 0u64;
        let mut io = 0;
        while io < output.len() {
            let i = self.smallest(buf0_size, buf1_size, &indices);
            let id = indices[i];
            indices[i] += 1;
            sum += self.weight(i);
            while io < qs.len() && (clamp_fraction(qs[io]) * float_count) as u64 <= sum {
                output[io] = self.buffer[i][id];
                io += 1;
            }
        }

        self.indices = indices;
        output
    }
}

/// Collapses two sorted buffers of differing weights into one buffer of the
/// same length, keeping every `(w_left + w_right)`-th element of the
/// weight-expanded merge.
fn collapse(left: &[i64], left_weight: u64, right: &[i64], right_weight: u64, output: &mut [i64]) {
    let total_weight = left_weight + right_weight;
    let mut i = 0;
    let mut j = 0;
    let mut k = 0;
    let mut cnt = 0u64;

    while i < left.len() || j < right.len() {
        let (smallest, weight) = if i < left.len() && (j == right.len() || left[i] < right[j]) {
            i += 1;
            (left[i - 1], left_weight)
        } else {
            j += 1;
            (right[j - 1], right_weight)
        };

        let cur = (cnt + (total_weight >> 1) - 1) / total_weight;
        cnt += weight;
        let next = (cnt + (total_weight >> 1) - 1) / total_weight;

        for _ in cur..next {
            output[k] = smallest;
            k += 1;
        }
    }
}

/// Specialized collapse for two buffers of equal weight: keep every second
/// element of the plain merge.
fn collapse_equal(left: &[i64], right: &[i64], output: &mut [i64]) {
    let mut i = 0;
    let mut j = 0;
    let mut k = 0;
    let mut cnt = 0u64;
    while i < left.len() || j < right.len() {
        let smallest = if i < left.len() && (j == right.len() || left[i] < right[j]) {
            i += 1;
            left[i - 1]
        } else {
            j += 1;
            right[j - 1]
        };
        if cnt & 1 == 1 {
            output[k] = smallest;
            k += 1;
        }
        cnt += 1;
    }
}

impl Histogram for MunroPatersonHistogram {
    fn clear(&self) {
        let mut mp = self.inner.lock().unwrap();
        mp.count = 0;
        mp.sum = 0;
        mp.leaf_count = 0;
        mp.current_top = 1;
        mp.root_weight = 1;
        mp.min = 0;
        mp.max = 0;
    }

    fn update(&self, value: i64) {
        self.inner.lock().unwrap().add(value);
    }

    fn count(&self) -> u64 {
        self.inner.lock().unwrap().count
    }

    fn sum(&self) -> i64 {
        self.inner.lock().unwrap().sum
    }

    fn min(&self) -> i64 {
        self.inner.lock().unwrap().min
    }

    fn max(&self) -> i64 {
        self.inner.lock().unwrap().max
    }

    fn mean(&self) -> f64 {
        let mp = self.inner.lock().unwrap();
        if mp.count > 0 {
            mp.sum as f64 / mp.count as f64
        } else {
            0.0
        }
    }

    fn percentiles(&self, percentiles: &[f64]) -> Vec<i64> {
        self.inner.lock().unwrap().percentiles(percentiles)
    }
}
