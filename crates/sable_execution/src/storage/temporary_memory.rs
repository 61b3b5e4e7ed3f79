use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Arbitrates temporary (intermediate) memory between concurrent consumers.
///
/// Consumers register to get a state, then express how many bytes they could
/// use through the state. The manager may grant less than requested, the grant
/// never goes below the consumer's minimum reservation.
#[derive(Debug)]
pub struct TemporaryMemoryManager {
    memory_limit: usize,
    registered: AtomicUsize,
}

impl TemporaryMemoryManager {
    pub fn new(memory_limit: usize) -> Self {
        TemporaryMemoryManager {
            memory_limit,
            registered: AtomicUsize::new(0),
        }
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn register(self: &Arc<Self>) -> TemporaryMemoryState {
        self.registered.fetch_add(1, Ordering::Relaxed);
        TemporaryMemoryState {
            manager: self.clone(),
            minimum_reservation: AtomicUsize::new(0),
            remaining_size: AtomicUsize::new(0),
            reservation: AtomicUsize::new(0),
        }
    }

    /// Fair share of the memory budget for a single registered consumer.
    fn share(&self) -> usize {
        let registered = self.registered.load(Ordering::Relaxed).max(1);
        self.memory_limit / registered
    }
}

/// Per-consumer handle into the temporary memory manager.
#[derive(Debug)]
pub struct TemporaryMemoryState {
    manager: Arc<TemporaryMemoryManager>,
    minimum_reservation: AtomicUsize,
    remaining_size: AtomicUsize,
    reservation: AtomicUsize,
}

impl TemporaryMemoryState {
    /// Set the minimum number of bytes this consumer needs to make progress.
    /// The reservation never drops below this.
    pub fn set_minimum_reservation(&self, bytes: usize) {
        self.minimum_reservation.store(bytes, Ordering::Relaxed);
        let current = self.reservation.load(Ordering::Relaxed);
        if current < bytes {
            self.reservation.store(bytes, Ordering::Relaxed);
        }
    }

    /// Tell the manager how many bytes this consumer could still put to use,
    /// recomputing the granted reservation.
    pub fn set_remaining_size(&self, bytes: usize) {
        self.remaining_size.store(bytes, Ordering::Relaxed);

        let granted = std::cmp::min(bytes, self.manager.share())
            .max(self.minimum_reservation.load(Ordering::Relaxed));
        self.reservation.store(granted, Ordering::Relaxed);

        tracing::trace!(requested = bytes, granted, "updated temporary memory reservation");
    }

    /// Bytes the manager has promised to this consumer.
    pub fn reservation(&self) -> usize {
        self.reservation.load(Ordering::Relaxed)
    }

    pub fn remaining_size(&self) -> usize {
        self.remaining_size.load(Ordering::Relaxed)
    }
}

impl Drop for TemporaryMemoryState {
    fn drop(&mut self) {
        self.manager.registered.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_capped_by_share() {
        let manager = Arc::new(TemporaryMemoryManager::new(1000));
        let state = manager.register();

        state.set_remaining_size(10_000);
        assert_eq!(1000, state.reservation());

        state.set_remaining_size(500);
        assert_eq!(500, state.reservation());
    }

    #[test]
    fn minimum_reservation_always_granted() {
        let manager = Arc::new(TemporaryMemoryManager::new(0));
        let state = manager.register();

        state.set_minimum_reservation(4096);
        assert_eq!(4096, state.reservation());

        state.set_remaining_size(1 << 20);
        assert_eq!(4096, state.reservation());

        state.set_minimum_reservation(0);
        state.set_remaining_size(0);
        assert_eq!(0, state.reservation());
    }

    #[test]
    fn share_splits_between_consumers() {
        let manager = Arc::new(TemporaryMemoryManager::new(1000));
        let a = manager.register();
        let _b = manager.register();

        a.set_remaining_size(10_000);
        assert_eq!(500, a.reservation());
    }
}
