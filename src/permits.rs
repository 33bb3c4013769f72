use std::sync::atomic::{AtomicUsize, Ordering};

/// Gates resource creation. Every live resource is backed by exactly one
/// permit claimed here; permits are returned when resources are destroyed.
///
/// `try_get` returning zero is not an error: the drain core treats it as
/// "no capacity right now" and leaves the borrower pending.
pub trait AllocationStrategy: Send + Sync + 'static {
    /// Atomically reserve up to `desired` permits, returning the number
    /// granted. Each granted permit not converted into a live resource
    /// must later be handed back via [`AllocationStrategy::give_back`].
    fn try_get(&self, desired: usize) -> usize;

    /// Restore `permits` permits.
    fn give_back(&self, permits: usize);

    /// Non-authoritative hint of how many permits are available. Used only
    /// to decide whether an allocation attempt is worth making.
    fn estimate(&self) -> usize;

    /// The number of resources warmup aims to pre-allocate.
    fn min_permits(&self) -> usize {
        0
    }
}

/// No limit: every request is granted in full.
#[derive(Debug, Default)]
pub struct Unbounded;

impl AllocationStrategy for Unbounded {
    fn try_get(&self, desired: usize) -> usize {
        desired
    }

    fn give_back(&self, _permits: usize) {}

    fn estimate(&self) -> usize {
        usize::MAX
    }
}

/// At most `max` permits outstanding, tracked by a saturating counter.
#[derive(Debug)]
pub struct Bounded {
    available: AtomicUsize,
    max: usize,
    min: usize,
}

impl Bounded {
    pub fn new(max: usize) -> Self {
        assert!(max > 0);
        Self {
            available: AtomicUsize::new(max),
            max,
            min: 0,
        }
    }

    /// Set the warmup floor. Warmup pre-allocates up to this many resources.
    pub fn with_min(mut self, min: usize) -> Self {
        assert!(min <= self.max);
        self.min = min;
        self
    }
}

impl AllocationStrategy for Bounded {
    fn try_get(&self, desired: usize) -> usize {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let granted = desired.min(current);
            if granted == 0 {
                return 0;
            }
            match self.available.compare_exchange_weak(
                current,
                current - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    fn give_back(&self, permits: usize) {
        if permits == 0 {
            return;
        }
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            // Saturate at the configured maximum rather than trusting the
            // caller's arithmetic.
            let next = (current + permits).min(self.max);
            match self.available.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn estimate(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    fn min_permits(&self) -> usize {
        self.min
    }
}
