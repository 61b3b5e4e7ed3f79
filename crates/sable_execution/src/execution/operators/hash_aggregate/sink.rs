use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;

use parking_lot::Mutex;
use sable_error::{Result, SableError};
use sable_vector::array::Array;
use sable_vector::batch::Batch;
use sable_vector::selection::SelectionVector;

use crate::execution::operators::util::DEFAULT_TARGET_BATCH_SIZE;
use crate::functions::aggregate::StateAccessor;
use crate::row::layout::RowLayout;
use crate::row::partitioned::PartitionedTupleData;
use crate::row::radix::{partition_count, radix_bits_for_count};
use crate::row::tuple_data::{TupleDataCollection, TupleDataPinProperties};
use crate::row::RowAddress;
use crate::runtime::EngineContext;
use crate::storage::arena::ArenaAllocator;
use crate::storage::temporary_memory::TemporaryMemoryState;

use super::config::RadixHtConfig;
use super::hash_table::GroupedAggregateHashTable;
use super::RadixHashTable;

/// Progress of combining a single partition, in `[0, 1]`.
///
/// Written by the one finalizing worker, read by progress reporting.
#[derive(Debug, Default)]
pub struct PartitionProgress(AtomicU64);

impl PartitionProgress {
    pub fn set(&self, fraction: f64) {
        self.0.store(fraction.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// State machine of a partition during the source phase. Transitions only move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePartitionState {
    /// Uncombined data, can be picked up for finalization.
    ReadyToFinalize,
    /// Some worker is combining this partition.
    FinalizeInProgress,
    /// Fully combined, can be scanned.
    ReadyToScan,
}

#[derive(Debug)]
pub(crate) struct AggregatePartitionInner {
    pub state: AggregatePartitionState,
    pub data: Option<TupleDataCollection>,
    /// Tasks to wake once this partition becomes ready to scan.
    pub blocked_tasks: Vec<Waker>,
}

/// One slot per radix partition, holding that partition's data as it moves
/// through finalization.
#[derive(Debug)]
pub struct AggregatePartition {
    pub(crate) inner: Mutex<AggregatePartitionInner>,
    pub(crate) progress: PartitionProgress,
}

impl AggregatePartition {
    fn new(data: TupleDataCollection) -> Self {
        AggregatePartition {
            inner: Mutex::new(AggregatePartitionInner {
                state: AggregatePartitionState::ReadyToFinalize,
                data: Some(data),
                blocked_tasks: Vec::new(),
            }),
            progress: PartitionProgress::default(),
        }
    }

    pub fn state(&self) -> AggregatePartitionState {
        self.inner.lock().state
    }

    pub fn progress(&self) -> f64 {
        self.progress.get()
    }
}

/// Shared sink data guarded by the sink lock.
#[derive(Debug, Default)]
pub(crate) struct RadixHtSinkData {
    /// Uncombined partitioned data that will be split into the aggregate
    /// partitions at finalization.
    pub uncombined_data: Option<PartitionedTupleData>,
    /// Arenas used by workers during sink and finalize. Held until teardown so
    /// aggregate state memory outlives the workers that produced it.
    pub stored_allocators: Vec<Arc<ArenaAllocator>>,
}

/// Global sink state, one per query.
#[derive(Debug)]
pub struct RadixHtGlobalSinkState {
    pub config: RadixHtConfig,
    /// Handle for negotiating memory with the temporary memory manager.
    pub temporary_memory_state: TemporaryMemoryState,

    /// Whether finalize has run.
    pub finalized: AtomicBool,
    /// Whether we are doing an external (out-of-core) aggregation.
    pub external: AtomicBool,
    /// Threads that have called sink.
    pub active_threads: AtomicUsize,
    /// Whether any thread has called combine. Freezes the radix bits.
    pub any_combined: AtomicBool,
    /// Partitions whose finalization completed.
    pub finalize_done: AtomicUsize,

    pub(crate) inner: Mutex<RadixHtSinkData>,

    /// Partitions finalized during the source phase. Published once by
    /// finalize.
    pub(crate) partitions: Mutex<Vec<Arc<AggregatePartition>>>,

    /// Pin behavior while scanning.
    pub(crate) scan_pin_properties: Mutex<TupleDataPinProperties>,

    /// Total row count over all uncombined data at finalization.
    pub count_before_combining: AtomicUsize,
    /// Conservative size of the largest partition if all groups are unique.
    pub max_partition_size: AtomicUsize,

    layout: Arc<RowLayout>,
}

impl RadixHtGlobalSinkState {
    pub fn partitions(&self) -> Vec<Arc<AggregatePartition>> {
        self.partitions.lock().clone()
    }
}

impl Drop for RadixHtGlobalSinkState {
    fn drop(&mut self) {
        // With destroy-after-done scanning (or nothing combined) the scan owns
        // destruction. Otherwise surviving rows still hold live aggregate
        // state.
        if *self.scan_pin_properties.get_mut() == TupleDataPinProperties::DestroyAfterDone
            || self.count_before_combining.load(Ordering::Relaxed) == 0
        {
            return;
        }

        let partitions = std::mem::take(self.partitions.get_mut());
        if partitions.is_empty() || !self.layout.has_destructor() {
            return;
        }

        let allocator = match self.inner.get_mut().stored_allocators.last() {
            Some(allocator) => allocator.clone(),
            None => return,
        };

        for partition in &partitions {
            let mut inner = partition.inner.lock();
            let data = match inner.data.as_mut() {
                Some(data) if data.count() > 0 => data,
                _ => continue,
            };

            let addresses: Vec<RowAddress> = data.addresses().collect();
            for (agg_idx, aggregate) in self.layout.aggregates().iter().enumerate() {
                if !aggregate.function.has_destructor() {
                    continue;
                }
                let input_data = aggregate.input_data(&allocator);
                let mut states = StateAccessor::collection(
                    data,
                    &addresses,
                    self.layout.aggregate_offset(agg_idx),
                    aggregate.function.state_size(),
                );
                if let Err(err) = aggregate.function.destroy(&input_data, &mut states) {
                    tracing::error!(%err, "failed to destroy aggregate states during teardown");
                }
            }
            data.reset();
        }
    }
}

/// Local sink state, one per worker.
#[derive(Debug, Default)]
pub struct RadixHtLocalSinkState {
    /// Thread-local hash table, created lazily on the first sink call and
    /// re-used after pointer table resets.
    pub(crate) ht: Option<GroupedAggregateHashTable>,
    /// Reusable buffer for the projected group columns.
    pub(crate) group_chunk: Vec<Arc<Array>>,
    /// Data given up under memory pressure. Only set once the aggregation went
    /// external.
    pub(crate) abandoned_data: Option<PartitionedTupleData>,
}

impl RadixHashTable {
    pub fn global_sink_state(&self, context: &EngineContext) -> RadixHtGlobalSinkState {
        let num_threads = context.scheduler.num_threads();
        let config = RadixHtConfig::new(num_threads);
        let temporary_memory_state = context.temporary_memory.register();

        // Minimum so every thread can hold a sink-capacity hash table plus a
        // block per partition.
        let block_size = context.buffer_manager.block_size();
        let tuples_per_block = (block_size / self.layout.row_width()).max(1);
        let ht_count =
            (config.sink_capacity as f64 / GroupedAggregateHashTable::LOAD_FACTOR) as usize;
        let num_partitions = partition_count(config.radix_bits());
        let count_per_partition = ht_count / num_partitions;
        let blocks_per_partition = (count_per_partition + tuples_per_block) / tuples_per_block + 1;
        let ht_size = blocks_per_partition * block_size
            + config.sink_capacity * GroupedAggregateHashTable::entry_size();
        let minimum_reservation = num_threads * ht_size;

        temporary_memory_state.set_minimum_reservation(minimum_reservation);
        temporary_memory_state.set_remaining_size(minimum_reservation);

        RadixHtGlobalSinkState {
            config,
            temporary_memory_state,
            finalized: AtomicBool::new(false),
            external: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            any_combined: AtomicBool::new(false),
            finalize_done: AtomicUsize::new(0),
            inner: Mutex::new(RadixHtSinkData::default()),
            partitions: Mutex::new(Vec::new()),
            scan_pin_properties: Mutex::new(TupleDataPinProperties::DestroyAfterDone),
            count_before_combining: AtomicUsize::new(0),
            max_partition_size: AtomicUsize::new(0),
            layout: self.layout.clone(),
        }
    }

    pub fn local_sink_state(&self) -> RadixHtLocalSinkState {
        RadixHtLocalSinkState::default()
    }

    /// Insert a chunk of input rows into this worker's thread-local hash
    /// table.
    pub fn sink(
        &self,
        context: &EngineContext,
        chunk: &Batch,
        payload: &Batch,
        filter: Option<&SelectionVector>,
        gstate: &RadixHtGlobalSinkState,
        lstate: &mut RadixHtLocalSinkState,
    ) -> Result<()> {
        if lstate.ht.is_none() {
            lstate.ht = Some(GroupedAggregateHashTable::new(
                context.buffer_manager.clone(),
                self.layout.clone(),
                gstate.config.sink_capacity,
                gstate.config.radix_bits(),
            ));
            gstate.active_threads.fetch_add(1, Ordering::Relaxed);
        }

        self.populate_group_chunk(chunk, &mut lstate.group_chunk)?;

        let Some(ht) = lstate.ht.as_mut() else {
            return Err(SableError::new("local sink state missing hash table"));
        };
        ht.add_chunk(
            &lstate.group_chunk,
            payload.columns(),
            chunk.num_rows(),
            filter,
        )?;

        if ht.count() + DEFAULT_TARGET_BATCH_SIZE < ht.resize_threshold() {
            // We can fit another chunk.
            return Ok(());
        }

        let active_threads = gstate.active_threads.load(Ordering::Relaxed);
        if active_threads > 2 {
            // 'Reset' the table without taking its data, appends go into the
            // same collection. This only works because the table never resizes
            // during the sink. With 1 or 2 threads the pointer table stays hot
            // instead.
            ht.clear_pointer_table();
            ht.reset_count();
        }

        let repartitioned = maybe_repartition(context, self, gstate, lstate, active_threads)?;

        if repartitioned {
            if let Some(ht) = lstate.ht.as_mut() {
                if ht.count() != 0 {
                    // Repartitioned on 1 or 2 threads, the reset still has to
                    // happen.
                    ht.clear_pointer_table();
                    ht.reset_count();
                }
            }
        }

        Ok(())
    }

    /// Fold this worker's data into the global sink state.
    pub fn combine(
        &self,
        context: &EngineContext,
        gstate: &RadixHtGlobalSinkState,
        lstate: &mut RadixHtLocalSinkState,
    ) -> Result<()> {
        if lstate.ht.is_none() {
            return Ok(());
        }

        // Freeze the radix bits, then converge on them one last time.
        gstate.any_combined.store(true, Ordering::Relaxed);
        maybe_repartition(
            context,
            self,
            gstate,
            lstate,
            gstate.active_threads.load(Ordering::Relaxed),
        )?;

        let Some(mut ht) = lstate.ht.take() else {
            return Err(SableError::new("local sink state missing hash table"));
        };
        ht.unpin_data();

        let data = ht.take_partitioned_data();
        let abandoned = match lstate.abandoned_data.take() {
            Some(mut abandoned) => {
                debug_assert!(gstate.external.load(Ordering::Relaxed));
                abandoned.combine(data)?;
                abandoned
            }
            None => data,
        };

        let mut inner = gstate.inner.lock();
        match inner.uncombined_data.as_mut() {
            Some(uncombined) => uncombined.combine(abandoned)?,
            None => inner.uncombined_data = Some(abandoned),
        }
        inner
            .stored_allocators
            .push(ht.aggregate_allocator().clone());

        Ok(())
    }

    /// Split the combined sink data into per-partition slots and size the
    /// memory reservation for the source phase. Runs once, after every worker
    /// combined.
    pub fn finalize(&self, context: &EngineContext, gstate: &RadixHtGlobalSinkState) -> Result<()> {
        let uncombined = gstate.inner.lock().uncombined_data.take();

        if let Some(uncombined) = uncombined {
            gstate
                .count_before_combining
                .store(uncombined.count(), Ordering::Relaxed);

            // If a single thread did everything in-memory there's nothing to
            // combine, its hash table already merged every partition.
            let single_ht = !gstate.external.load(Ordering::Relaxed)
                && gstate.active_threads.load(Ordering::Relaxed) == 1;

            let mut max_partition_size = 0;
            let mut partitions = Vec::with_capacity(uncombined.partition_count());
            for collection in uncombined.into_partitions() {
                let partition_size = collection.size_in_bytes()
                    + GroupedAggregateHashTable::capacity_for_count(collection.count())
                        * GroupedAggregateHashTable::entry_size();
                max_partition_size = std::cmp::max(max_partition_size, partition_size);

                let partition = AggregatePartition::new(collection);
                if single_ht {
                    gstate.finalize_done.fetch_add(1, Ordering::Relaxed);
                    partition.progress.set(1.0);
                    partition.inner.lock().state = AggregatePartitionState::ReadyToScan;
                }
                partitions.push(Arc::new(partition));
            }

            gstate
                .max_partition_size
                .store(max_partition_size, Ordering::Relaxed);
            *gstate.partitions.lock() = partitions;
        } else {
            gstate.count_before_combining.store(0, Ordering::Relaxed);
        }

        // Minimum of combining one partition at a time, maximum of combining
        // all of them at once.
        let max_partition_size = gstate.max_partition_size.load(Ordering::Relaxed);
        let num_partitions = gstate.partitions.lock().len();
        gstate
            .temporary_memory_state
            .set_minimum_reservation(max_partition_size);
        let max_threads = std::cmp::min(context.scheduler.num_threads(), num_partitions);
        gstate
            .temporary_memory_state
            .set_remaining_size(max_threads * max_partition_size);

        gstate.finalized.store(true, Ordering::Relaxed);

        Ok(())
    }

    /// Number of threads that can usefully participate in the source phase
    /// given the current memory reservation.
    pub fn max_threads(&self, context: &EngineContext, gstate: &RadixHtGlobalSinkState) -> usize {
        let num_partitions = gstate.partitions.lock().len();
        if num_partitions == 0 {
            return 0;
        }

        let max_partition_size = gstate.max_partition_size.load(Ordering::Relaxed).max(1);
        let partitions_fit =
            (gstate.temporary_memory_state.reservation() / max_partition_size).max(1);
        let max_possible = std::cmp::min(num_partitions, context.scheduler.num_threads());

        std::cmp::min(partitions_fit, max_possible)
    }

    /// Keep rows alive after scanning so the output can be scanned again.
    pub fn set_multi_scan(&self, gstate: &RadixHtGlobalSinkState) {
        *gstate.scan_pin_properties.lock() = TupleDataPinProperties::UnpinAfterDone;
    }
}

/// Check memory pressure and fan-out, possibly going external or repartitioning
/// this worker's data to the global radix bits.
fn maybe_repartition(
    context: &EngineContext,
    radix_ht: &RadixHashTable,
    gstate: &RadixHtGlobalSinkState,
    lstate: &mut RadixHtLocalSinkState,
    active_threads: usize,
) -> Result<bool> {
    let Some(ht) = lstate.ht.as_mut() else {
        return Err(SableError::new("local sink state missing hash table"));
    };
    let config = &gstate.config;
    let temporary_memory_state = &gstate.temporary_memory_state;

    let total_size = ht.partitioned_data().size_in_bytes()
        + ht.capacity() * GroupedAggregateHashTable::entry_size();
    let active = active_threads.max(1);

    let mut thread_limit = temporary_memory_state.reservation() / active;
    if total_size > thread_limit && !gstate.external.load(Ordering::Relaxed) {
        // Over the per-thread limit, but maybe the reservation can still grow.
        // Take the sink lock and re-check.
        let _guard = gstate.inner.lock();
        thread_limit = temporary_memory_state.reservation() / active;
        if total_size > thread_limit {
            let remaining_size = std::cmp::max(
                active * total_size,
                temporary_memory_state.remaining_size(),
            );
            temporary_memory_state.set_remaining_size(2 * remaining_size);
            thread_limit = temporary_memory_state.reservation() / active;
        }
    }

    if total_size > thread_limit && config.set_radix_bits_to_external(gstate) {
        // Out-of-core: move this worker's data to its abandoned collection at
        // the external fan-out and start over with an empty table.
        let abandoned = lstate.abandoned_data.get_or_insert_with(|| {
            PartitionedTupleData::new(
                context.buffer_manager.clone(),
                radix_ht.layout.clone(),
                config.radix_bits(),
            )
        });

        ht.unpin_data();
        let old = ht.take_partitioned_data();
        old.repartition(abandoned)?;
        ht.set_radix_bits(config.radix_bits());
        ht.initialize_partitioned_data();

        tracing::debug!(
            radix_bits = config.radix_bits(),
            "abandoned thread-local data for external aggregation"
        );
        return Ok(true);
    }

    // We can go external with a single active thread, but repartitioning
    // in-memory only pays off with parallelism.
    if active_threads < 2 {
        return Ok(false);
    }

    let partition_count = ht.partitioned_data().partition_count();
    let current_radix_bits = radix_bits_for_count(partition_count);
    debug_assert!(current_radix_bits <= config.radix_bits());

    let row_size_per_partition =
        ht.partitioned_data().count() * radix_ht.layout.row_width() / partition_count;
    if row_size_per_partition as f64
        > RadixHtConfig::BLOCK_FILL_FACTOR * context.buffer_manager.block_size() as f64
    {
        // Crossed the block fill threshold, try to raise the fan-out.
        config.set_radix_bits(
            current_radix_bits + RadixHtConfig::REPARTITION_RADIX_BITS,
            gstate,
        );
    }

    let global_radix_bits = config.radix_bits();
    if current_radix_bits == global_radix_bits {
        return Ok(false);
    }

    // Out of sync with the global radix bits, repartition.
    ht.unpin_data();
    let old = ht.take_partitioned_data();
    ht.set_radix_bits(global_radix_bits);
    ht.initialize_partitioned_data();
    old.repartition(ht.partitioned_data_mut())?;

    tracing::debug!(
        from = current_radix_bits,
        to = global_radix_bits,
        "repartitioned thread-local sink data"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_progress_roundtrip() {
        let progress = PartitionProgress::default();
        assert_eq!(0.0, progress.get());

        progress.set(0.25);
        assert_eq!(0.25, progress.get());

        progress.set(1.0);
        assert_eq!(1.0, progress.get());
    }
}
