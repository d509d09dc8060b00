use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonically-increasing unsigned counter.
///
/// All operations are single-word atomics; `Counter` is safe to update from
/// any number of threads without locking. `dec` wraps on underflow — correct
/// usage keeps the value non-negative, and the snapshot delta cache treats an
/// apparent decrease as a reset.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Counter {
        Counter {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn dec(&self, delta: u64) {
        self.value.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Swaps the counter to zero, returning the previous value.
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// A counter whose value is computed at snapshot time.
#[derive(Clone)]
pub struct CounterFn {
    f: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl CounterFn {
    pub fn new<F>(f: F) -> CounterFn
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        CounterFn { f: Arc::new(f) }
    }

    pub fn count(&self) -> u64 {
        (self.f)()
    }
}
