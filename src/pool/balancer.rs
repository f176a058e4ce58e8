use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

/// Picks the next entry index to try during acquisition.
///
/// The pool calls this up to once per entry in a single acquisition pass,
/// so a balancer does not have to avoid repeats.
pub trait LoadBalancer: Send + Sync + 'static {
    /// Index into the entry list; `len` is always non-zero.
    fn next(&self, len: usize) -> usize;
}

/// Cycles through entries in order.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next(&self, len: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Picks entries uniformly at random.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn next(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}
