use crate::error::Result;
use crate::transport::DeviceBackend;
use collective_core::LifoPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Caches device events per GPU so their (non-zero) creation cost is paid
/// once. A released event must have already completed its previous record;
/// this holds because events are only released from the finalizer, after
/// it has synchronized on them (spec §4.1).
///
/// One mutex guards every device's queue: a single lock is simpler than
/// per-device locks, and events are acquired/released far less often than
/// they are recorded on the stream.
pub struct EventPool<B: DeviceBackend> {
    backend: Arc<B>,
    pools: Mutex<HashMap<i32, LifoPool<B::Event>>>,
}

impl<B: DeviceBackend> EventPool<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a recycled event for `device` if one is available, else
    /// creates a fresh one.
    pub fn acquire(&self, device: i32) -> Result<B::Event> {
        let recycled = {
            let mut pools = self.pools.lock().unwrap();
            pools.entry(device).or_default().acquire()
        };
        match recycled {
            Some(event) => {
                trace!(device, "reused pooled device event");
                Ok(event)
            }
            None => {
                trace!(device, "creating new device event");
                self.backend.create_event()
            }
        }
    }

    /// Returns `event` to the pool for `device` so a later job can reuse
    /// it. Must only be called after synchronizing on the event.
    pub fn release(&self, device: i32, event: B::Event) {
        let mut pools = self.pools.lock().unwrap();
        pools.entry(device).or_default().release(event);
    }

    /// Number of events currently idle in `device`'s pool. Exposed for the
    /// event-pool conservation property test (spec §8).
    pub fn idle_count(&self, device: i32) -> usize {
        self.pools
            .lock()
            .unwrap()
            .get(&device)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::loopback::LoopbackBackend;

    #[test]
    fn acquire_without_prior_release_creates_a_fresh_event() {
        let backend = Arc::new(LoopbackBackend::new());
        let pool = EventPool::new(backend);
        let event = pool.acquire(0).unwrap();
        assert_eq!(pool.idle_count(0), 0);
        pool.release(0, event);
        assert_eq!(pool.idle_count(0), 1);
    }

    #[test]
    fn release_then_acquire_reuses_the_same_pool_slot() {
        let backend = Arc::new(LoopbackBackend::new());
        let pool = EventPool::new(backend);
        let e1 = pool.acquire(0).unwrap();
        pool.release(0, e1);
        assert_eq!(pool.idle_count(0), 1);
        let _e2 = pool.acquire(0).unwrap();
        assert_eq!(pool.idle_count(0), 0);
    }

    #[test]
    fn pools_are_independent_per_device() {
        let backend = Arc::new(LoopbackBackend::new());
        let pool = EventPool::new(backend);
        let e0 = pool.acquire(0).unwrap();
        pool.release(0, e0);
        assert_eq!(pool.idle_count(1), 0);
    }

    #[test]
    fn acquires_minus_releases_matches_events_live_outside_the_pool() {
        let backend = Arc::new(LoopbackBackend::new());
        let pool = EventPool::new(backend);
        let mut live = Vec::new();
        for _ in 0..5 {
            live.push(pool.acquire(0).unwrap());
        }
        assert_eq!(pool.idle_count(0), 0);
        for event in live.drain(..3) {
            pool.release(0, event);
        }
        assert_eq!(pool.idle_count(0), 3);
        for event in live.drain(..) {
            pool.release(0, event);
        }
        assert_eq!(pool.idle_count(0), 5);
    }
}
