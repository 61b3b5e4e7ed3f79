use std::sync::atomic::{AtomicUsize, Ordering};

use crate::row::radix::radix_bits_for_count;

use super::hash_table::GroupedAggregateHashTable;
use super::sink::RadixHtGlobalSinkState;

/// Assume 32KB L1 cache per core, halved because of hyperthreading.
const L1_CACHE_SIZE: usize = 32768 / 2;
/// Assume 1MB L2 cache per core, halved because of hyperthreading.
const L2_CACHE_SIZE: usize = 1048576 / 2;
/// Assume 1.5MB shared L3 cache per core, halved because of hyperthreading.
const L3_CACHE_SIZE: usize = 1572864 / 2;

/// Cap on the radix bits the sink starts out with.
const MAXIMUM_INITIAL_SINK_RADIX_BITS: usize = 3;
/// Cap on the sink radix bits, independent of thread count.
const MAXIMUM_FINAL_SINK_RADIX_BITS: usize = 7;
/// By how many radix bits to increment when going external.
const EXTERNAL_RADIX_BITS_INCREMENT: usize = 3;

/// Per-query partitioning tunables for the radix hash table.
#[derive(Debug)]
pub struct RadixHtConfig {
    /// Current thread-global sink radix bits.
    sink_radix_bits: AtomicUsize,
    /// Maximum sink radix bits (set based on number of threads).
    maximum_sink_radix_bits: usize,
    /// Radix bits to jump to if we go external.
    external_radix_bits: usize,

    /// Capacity of the thread-local hash tables during the sink.
    pub sink_capacity: usize,
}

impl RadixHtConfig {
    /// If a partition's row bytes fill this many blocks, trigger a
    /// repartition.
    pub const BLOCK_FILL_FACTOR: f64 = 1.8;
    /// By how many bits to repartition when the fill threshold is crossed.
    pub const REPARTITION_RADIX_BITS: usize = 2;

    pub fn new(num_threads: usize) -> Self {
        let maximum_sink_radix_bits = Self::maximum_sink_radix_bits(num_threads);
        RadixHtConfig {
            sink_radix_bits: AtomicUsize::new(Self::initial_sink_radix_bits(num_threads)),
            maximum_sink_radix_bits,
            external_radix_bits: Self::external_radix_bits(maximum_sink_radix_bits),
            sink_capacity: Self::sink_capacity(num_threads),
        }
    }

    pub fn radix_bits(&self) -> usize {
        self.sink_radix_bits.load(Ordering::Relaxed)
    }

    /// Request raising the sink radix bits, clamped to the maximum.
    pub fn set_radix_bits(&self, radix_bits: usize, sink: &RadixHtGlobalSinkState) {
        self.set_radix_bits_internal(
            std::cmp::min(radix_bits, self.maximum_sink_radix_bits),
            false,
            sink,
        )
    }

    /// Switch to the external radix bit count, marking the sink external.
    /// Returns whether the sink is external afterwards.
    pub fn set_radix_bits_to_external(&self, sink: &RadixHtGlobalSinkState) -> bool {
        self.set_radix_bits_internal(self.external_radix_bits, true, sink);
        sink.external.load(Ordering::Relaxed)
    }

    /// Double-checked publication of a new radix bit count.
    ///
    /// Once any thread has combined its data the fan-out is frozen, otherwise
    /// collections with mismatched partition counts could meet in the global
    /// state.
    fn set_radix_bits_internal(
        &self,
        radix_bits: usize,
        external: bool,
        sink: &RadixHtGlobalSinkState,
    ) {
        if self.sink_radix_bits.load(Ordering::Relaxed) >= radix_bits
            || sink.any_combined.load(Ordering::Relaxed)
        {
            return;
        }

        let _guard = sink.inner.lock();
        if self.sink_radix_bits.load(Ordering::Relaxed) >= radix_bits
            || sink.any_combined.load(Ordering::Relaxed)
        {
            return;
        }

        if external {
            sink.external.store(true, Ordering::Relaxed);
        }
        self.sink_radix_bits.store(radix_bits, Ordering::Relaxed);
        tracing::debug!(radix_bits, external, "raised sink radix bits");
    }

    fn initial_sink_radix_bits(num_threads: usize) -> usize {
        std::cmp::min(
            radix_bits_for_count(num_threads),
            MAXIMUM_INITIAL_SINK_RADIX_BITS,
        )
    }

    fn maximum_sink_radix_bits(num_threads: usize) -> usize {
        std::cmp::min(
            radix_bits_for_count(num_threads),
            MAXIMUM_FINAL_SINK_RADIX_BITS,
        )
    }

    fn external_radix_bits(maximum_sink_radix_bits: usize) -> usize {
        std::cmp::min(
            maximum_sink_radix_bits + EXTERNAL_RADIX_BITS_INCREMENT,
            MAXIMUM_FINAL_SINK_RADIX_BITS,
        )
    }

    fn sink_capacity(num_threads: usize) -> usize {
        // Compute cache size per active thread, assuming L3 is shared.
        let total_shared_cache_size = num_threads * L3_CACHE_SIZE;
        let cache_per_active_thread =
            L1_CACHE_SIZE + L2_CACHE_SIZE + total_shared_cache_size / num_threads.max(1);

        // Size the pointer table so the active probe region stays cache
        // resident at the configured load factor.
        let size_per_entry = (GroupedAggregateHashTable::entry_size() as f64
            * GroupedAggregateHashTable::LOAD_FACTOR) as usize;
        let capacity = (cache_per_active_thread / size_per_entry).next_power_of_two();

        std::cmp::max(capacity, GroupedAggregateHashTable::initial_capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_bits_scale_with_threads() {
        assert_eq!(0, RadixHtConfig::initial_sink_radix_bits(1));
        assert_eq!(1, RadixHtConfig::initial_sink_radix_bits(2));
        assert_eq!(2, RadixHtConfig::initial_sink_radix_bits(4));
        assert_eq!(3, RadixHtConfig::initial_sink_radix_bits(8));
        // Capped at 3.
        assert_eq!(3, RadixHtConfig::initial_sink_radix_bits(64));
    }

    #[test]
    fn maximum_bits_capped_at_seven() {
        assert_eq!(4, RadixHtConfig::maximum_sink_radix_bits(16));
        assert_eq!(7, RadixHtConfig::maximum_sink_radix_bits(128));
        assert_eq!(7, RadixHtConfig::maximum_sink_radix_bits(1024));
    }

    #[test]
    fn external_bits_increment_capped() {
        assert_eq!(3, RadixHtConfig::external_radix_bits(0));
        assert_eq!(6, RadixHtConfig::external_radix_bits(3));
        assert_eq!(7, RadixHtConfig::external_radix_bits(5));
        assert_eq!(7, RadixHtConfig::external_radix_bits(7));
    }

    #[test]
    fn sink_capacity_is_pow2_and_floored() {
        for threads in [1, 2, 8, 64] {
            let capacity = RadixHtConfig::sink_capacity(threads);
            assert!(capacity.is_power_of_two());
            assert!(capacity >= GroupedAggregateHashTable::initial_capacity());
        }
    }
}
