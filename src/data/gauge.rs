use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A stored integer gauge.
#[derive(Debug, Default)]
pub struct IntegerGauge {
    value: AtomicI64,
}

impl IntegerGauge {
    pub fn new() -> IntegerGauge {
        IntegerGauge {
            value: AtomicI64::new(0),
        }
    }

    pub fn inc(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn dec(&self, delta: i64) {
        self.value.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Swaps the gauge to zero, returning the previous value.
    pub fn reset(&self) -> i64 {
        self.value.swap(0, Ordering::Relaxed)
    }

    pub fn integer_value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn value(&self) -> f64 {
        self.integer_value() as f64
    }
}

/// A gauge whose value is computed at snapshot time, never on update paths.
#[derive(Clone)]
pub struct GaugeFn {
    f: Arc<dyn Fn() -> f64 + Send + Sync>,
}

impl GaugeFn {
    pub fn new<F>(f: F) -> GaugeFn
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        GaugeFn { f: Arc::new(f) }
    }

    pub fn value(&self) -> f64 {
        (self.f)()
    }
}

#[cfg(test)]
mod tests {
    use super::{GaugeFn, IntegerGauge};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_integer_gauge() {
        let g = IntegerGauge::new();
        g.inc(10);
        g.dec(3);
        assert_eq!(g.integer_value(), 7);
        g.set(-2);
        assert_eq!(g.integer_value(), -2);
        assert_eq!(g.value(), -2.0);
        assert_eq!(g.reset(), -2);
        assert_eq!(g.integer_value(), 0);
    }

    #[test]
    fn test_gauge_fn_reads_current_value() {
        let cell = Arc::new(AtomicI64::new(1));
        let inner = Arc::clone(&cell);
        let g = GaugeFn::new(move || inner.load(Ordering::Relaxed) as f64);
        assert_eq!(g.value(), 1.0);
        cell.store(9, Ordering::Relaxed);
        assert_eq!(g.value(), 9.0);
    }
}
