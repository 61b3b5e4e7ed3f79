use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Waker};

use parking_lot::Mutex;
use sable_error::{Result, SableError};
use sable_vector::array::{Array, Int64Array};
use sable_vector::batch::Batch;

use crate::execution::operators::util::DEFAULT_TARGET_BATCH_SIZE;
use crate::functions::aggregate::StateAccessor;
use crate::row::tuple_data::{TupleDataCollection, TupleDataPinProperties, TupleDataScanState};
use crate::row::RowAddress;
use crate::runtime::EngineContext;
use crate::storage::arena::ArenaAllocator;

use super::hash_table::GroupedAggregateHashTable;
use super::sink::{AggregatePartition, AggregatePartitionState, RadixHtGlobalSinkState};
use super::RadixHashTable;

/// Result of pulling output from the source phase.
#[derive(Debug)]
pub enum SourcePoll {
    /// Produced a batch, call again for more.
    HaveMoreOutput(Batch),
    /// The chosen partition is being finalized by another worker. The waker
    /// passed in will be woken once it becomes scannable.
    Blocked,
    /// All partitions are scanned.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadixHtSourceTask {
    Finalize,
    Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadixHtScanStatus {
    Init,
    InProgress,
    Done,
}

enum AssignResult {
    Assigned,
    Blocked,
    Finished,
}

enum TaskResult {
    Batch(Batch),
    NoOutput,
    Blocked,
}

/// Global source state, one per scan of the aggregate.
#[derive(Debug)]
pub struct RadixHtGlobalSourceState {
    pub(crate) partitions: Vec<Arc<AggregatePartition>>,

    /// Whether every partition has been fully scanned.
    pub finished: AtomicBool,

    /// Group columns to read while scanning.
    column_ids: Vec<usize>,

    /// Next partition to hand out.
    next_task: Mutex<usize>,
    /// Partitions whose scan completed.
    pub task_done: AtomicUsize,
}

/// Local source state, one per worker participating in the scan.
#[derive(Debug)]
pub struct RadixHtLocalSourceState {
    /// Current task and the partition it operates on.
    task: Option<(RadixHtSourceTask, usize)>,

    /// Thread-local hash table re-used across finalize tasks.
    ht: Option<GroupedAggregateHashTable>,

    scan_status: RadixHtScanStatus,
    scan_state: TupleDataScanState,

    /// Arena for finalize scratch state.
    aggregate_allocator: Arc<ArenaAllocator>,
}

impl RadixHtLocalSourceState {
    fn task_finished(&self) -> bool {
        match self.task {
            None => true,
            Some((RadixHtSourceTask::Finalize, _)) => true,
            Some((RadixHtSourceTask::Scan, _)) => self.scan_status == RadixHtScanStatus::Done,
        }
    }
}

impl RadixHashTable {
    pub fn global_source_state(&self, sink: &RadixHtGlobalSinkState) -> RadixHtGlobalSourceState {
        RadixHtGlobalSourceState {
            partitions: sink.partitions(),
            finished: AtomicBool::new(false),
            column_ids: (0..self.group_types.len()).collect(),
            next_task: Mutex::new(0),
            task_done: AtomicUsize::new(0),
        }
    }

    pub fn local_source_state(&self) -> RadixHtLocalSourceState {
        RadixHtLocalSourceState {
            task: None,
            ht: None,
            scan_status: RadixHtScanStatus::Done,
            scan_state: TupleDataScanState::default(),
            aggregate_allocator: Arc::new(ArenaAllocator::new()),
        }
    }

    /// Produce the next chunk of output for this worker.
    ///
    /// Workers cooperatively finalize and scan partitions. A worker that picks
    /// a partition someone else is finalizing parks the waker from `cx` and
    /// reports `Blocked`.
    pub fn get_data(
        &self,
        cx: &mut Context,
        context: &EngineContext,
        sink: &RadixHtGlobalSinkState,
        gstate: &RadixHtGlobalSourceState,
        lstate: &mut RadixHtLocalSourceState,
    ) -> Result<SourcePoll> {
        debug_assert!(sink.finalized.load(Ordering::Relaxed));

        if gstate.finished.load(Ordering::Relaxed) {
            return Ok(SourcePoll::Finished);
        }

        if sink.count_before_combining.load(Ordering::Relaxed) == 0 {
            // Empty intermediates. Without groups there's still exactly one
            // output row holding every aggregate's identity.
            if self.grouping_set.is_empty()
                && gstate
                    .finished
                    .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return Ok(SourcePoll::HaveMoreOutput(
                    self.empty_aggregate_result(context)?,
                ));
            }
            gstate.finished.store(true, Ordering::Relaxed);
            return Ok(SourcePoll::Finished);
        }

        loop {
            if gstate.finished.load(Ordering::Relaxed) {
                return Ok(SourcePoll::Finished);
            }

            if lstate.task_finished() {
                match self.assign_task(gstate, lstate, cx.waker())? {
                    AssignResult::Assigned => {}
                    AssignResult::Blocked => return Ok(SourcePoll::Blocked),
                    AssignResult::Finished => return Ok(SourcePoll::Finished),
                }
            }

            match self.execute_task(context, sink, gstate, lstate, cx.waker())? {
                TaskResult::Batch(batch) => return Ok(SourcePoll::HaveMoreOutput(batch)),
                TaskResult::NoOutput => continue,
                TaskResult::Blocked => return Ok(SourcePoll::Blocked),
            }
        }
    }

    /// Hand out the next partition index and decide whether this worker
    /// finalizes it, scans it, or has to wait.
    fn assign_task(
        &self,
        gstate: &RadixHtGlobalSourceState,
        lstate: &mut RadixHtLocalSourceState,
        waker: &Waker,
    ) -> Result<AssignResult> {
        let mut next_task = gstate.next_task.lock();
        if gstate.finished.load(Ordering::Relaxed) {
            return Ok(AssignResult::Finished);
        }
        if *next_task == gstate.partitions.len() {
            return Ok(AssignResult::Finished);
        }

        let partition_idx = *next_task;
        *next_task += 1;

        let partition = &gstate.partitions[partition_idx];
        let mut inner = partition.inner.lock();
        match inner.state {
            AggregatePartitionState::ReadyToFinalize => {
                inner.state = AggregatePartitionState::FinalizeInProgress;
                lstate.task = Some((RadixHtSourceTask::Finalize, partition_idx));
                Ok(AssignResult::Assigned)
            }
            AggregatePartitionState::FinalizeInProgress => {
                lstate.task = Some((RadixHtSourceTask::Scan, partition_idx));
                lstate.scan_status = RadixHtScanStatus::Init;
                inner.blocked_tasks.push(waker.clone());
                Ok(AssignResult::Blocked)
            }
            AggregatePartitionState::ReadyToScan => {
                lstate.task = Some((RadixHtSourceTask::Scan, partition_idx));
                lstate.scan_status = RadixHtScanStatus::Init;
                Ok(AssignResult::Assigned)
            }
        }
    }

    fn execute_task(
        &self,
        context: &EngineContext,
        sink: &RadixHtGlobalSinkState,
        gstate: &RadixHtGlobalSourceState,
        lstate: &mut RadixHtLocalSourceState,
        waker: &Waker,
    ) -> Result<TaskResult> {
        match lstate.task {
            Some((RadixHtSourceTask::Finalize, partition_idx)) => {
                self.finalize_partition(context, sink, gstate, lstate, partition_idx)?;
                Ok(TaskResult::NoOutput)
            }
            Some((RadixHtSourceTask::Scan, partition_idx)) => {
                self.scan_partition(sink, gstate, lstate, partition_idx, waker)
            }
            None => Err(SableError::new("source worker executed without a task")),
        }
    }

    /// Combine a partition's uncombined data in this worker's hash table,
    /// publish the combined rows, and wake anything parked on the partition.
    fn finalize_partition(
        &self,
        context: &EngineContext,
        sink: &RadixHtGlobalSinkState,
        gstate: &RadixHtGlobalSourceState,
        lstate: &mut RadixHtLocalSourceState,
        partition_idx: usize,
    ) -> Result<()> {
        let partition = gstate.partitions[partition_idx].clone();

        let data = match partition.inner.lock().data.take() {
            Some(data) => data,
            None => {
                return Err(SableError::new(
                    "finalize task found partition without data",
                ))
            }
        };

        match lstate.ht.as_mut() {
            None => {
                // This capacity would always be sufficient for all data, but
                // cap it so a skewed partition doesn't over-allocate a table
                // no thread could afford.
                let capacity = GroupedAggregateHashTable::capacity_for_count(data.count());

                let num_threads = context.scheduler.num_threads().max(1);
                let memory_limit = context.buffer_manager.memory_limit();
                let thread_limit = (0.6 * memory_limit as f64 / num_threads as f64) as usize;

                let size_per_entry = data.size_in_bytes() / data.count().max(1)
                    + (GroupedAggregateHashTable::LOAD_FACTOR
                        * GroupedAggregateHashTable::entry_size() as f64)
                        as usize;
                let capacity_limit = (thread_limit / size_per_entry.max(1)).next_power_of_two();

                lstate.ht = Some(GroupedAggregateHashTable::new(
                    context.buffer_manager.clone(),
                    self.layout.clone(),
                    std::cmp::min(capacity, capacity_limit),
                    0,
                ));
            }
            Some(ht) => {
                ht.initialize_partitioned_data();
                ht.clear_pointer_table();
                ht.reset_count();
            }
        }
        let Some(ht) = lstate.ht.as_mut() else {
            return Err(SableError::new("local source state missing hash table"));
        };

        ht.combine(data, Some(&partition.progress))?;
        ht.unpin_data();
        partition.progress.set(1.0);

        // Move the combined rows back into the partition slot. The hash table
        // ran with zero radix bits, everything sits in one collection.
        let combined = ht.take_partitioned_data().into_partitions().pop();
        let combined = match combined {
            Some(collection) => collection,
            None => return Err(SableError::new("finalize hash table had no partition")),
        };
        partition.inner.lock().data = Some(combined);

        {
            let mut sink_inner = sink.inner.lock();
            sink_inner
                .stored_allocators
                .push(ht.aggregate_allocator().clone());
        }

        let finalizes_done = sink.finalize_done.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(finalizes_done <= gstate.partitions.len());
        if finalizes_done == gstate.partitions.len() {
            // All finalizes are done, the temporary memory can go back.
            sink.temporary_memory_state.set_remaining_size(0);
        }

        {
            let mut inner = partition.inner.lock();
            inner.state = AggregatePartitionState::ReadyToScan;
            for waker in inner.blocked_tasks.drain(..) {
                waker.wake();
            }
        }

        tracing::trace!(partition = partition_idx, "finalized aggregate partition");

        // This worker scans the partition it just combined, the data is hot.
        lstate.task = Some((RadixHtSourceTask::Scan, partition_idx));
        lstate.scan_status = RadixHtScanStatus::Init;

        Ok(())
    }

    /// Scan the next chunk of a finalized partition into an output batch.
    fn scan_partition(
        &self,
        sink: &RadixHtGlobalSinkState,
        gstate: &RadixHtGlobalSourceState,
        lstate: &mut RadixHtLocalSourceState,
        partition_idx: usize,
        waker: &Waker,
    ) -> Result<TaskResult> {
        let partition = gstate.partitions[partition_idx].clone();
        let scan_pin_properties = *sink.scan_pin_properties.lock();

        let mut inner = partition.inner.lock();
        if inner.state != AggregatePartitionState::ReadyToScan {
            // Woken (or polled) before the finalizing worker finished, park
            // again.
            inner.blocked_tasks.push(waker.clone());
            return Ok(TaskResult::Blocked);
        }
        let data = match inner.data.as_mut() {
            Some(data) => data,
            None => return Err(SableError::new("scan task found partition without data")),
        };

        if lstate.scan_status == RadixHtScanStatus::Init {
            lstate.scan_state = TupleDataScanState::default();
            lstate.scan_status = RadixHtScanStatus::InProgress;
        }

        let addresses = data.scan_chunk(&mut lstate.scan_state, DEFAULT_TARGET_BATCH_SIZE);
        if addresses.is_empty() {
            match scan_pin_properties {
                TupleDataPinProperties::DestroyAfterDone => data.reset(),
                TupleDataPinProperties::UnpinAfterDone => data.unpin(),
                TupleDataPinProperties::KeepPinned => {}
            }
            drop(inner);

            lstate.scan_status = RadixHtScanStatus::Done;
            let done = gstate.task_done.fetch_add(1, Ordering::Relaxed) + 1;
            if done == gstate.partitions.len() {
                gstate.finished.store(true, Ordering::Relaxed);
            }
            return Ok(TaskResult::NoOutput);
        }

        let num_rows = addresses.len();

        // Materialize the grouping columns.
        let group_arrays = {
            let rows: Vec<&[u8]> = addresses
                .iter()
                .map(|addr| data.row(addr.block, addr.row))
                .collect();
            gstate
                .column_ids
                .iter()
                .map(|&col| self.layout.read_group_column(&rows, col))
                .collect::<Result<Vec<_>>>()?
        };

        // Convert accumulator state into result values.
        let allocator = lstate.aggregate_allocator.clone();
        let mut aggregate_arrays = Vec::with_capacity(self.layout.aggregates().len());
        for (agg_idx, aggregate) in self.layout.aggregates().iter().enumerate() {
            let input_data = aggregate.input_data(&allocator);
            let offset = self.layout.aggregate_offset(agg_idx);
            let size = aggregate.function.state_size();

            let mut states = StateAccessor::collection(data, &addresses, offset, size);
            aggregate_arrays.push(aggregate.function.finalize(&input_data, &mut states)?);
        }

        if scan_pin_properties == TupleDataPinProperties::DestroyAfterDone
            && self.layout.has_destructor()
        {
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
                aggregate.function.destroy(&input_data, &mut states)?;
            }
        }
        drop(inner);

        // Compose the output: grouping columns by reference, null groups as
        // constant nulls, aggregate outputs, then the grouping values.
        let group_count = self.op.group_types.len();
        let total_columns =
            group_count + self.op.aggregates.len() + self.op.grouping_functions.len();
        let mut columns: Vec<Option<Arc<Array>>> = vec![None; total_columns];

        for (&entry, array) in self.grouping_set.iter().zip(group_arrays) {
            columns[entry] = Some(Arc::new(array));
        }
        for &null_group in &self.null_groups {
            columns[null_group] = Some(Arc::new(Array::new_nulls(
                self.op.group_types[null_group],
                num_rows,
            )));
        }
        for (agg_idx, array) in aggregate_arrays.into_iter().enumerate() {
            columns[group_count + agg_idx] = Some(Arc::new(array));
        }
        for (idx, &value) in self.grouping_values.iter().enumerate() {
            columns[group_count + self.op.aggregates.len() + idx] = Some(Arc::new(Array::Int64(
                Int64Array::from_iter(std::iter::repeat(value).take(num_rows)),
            )));
        }

        let columns = columns
            .into_iter()
            .map(|col| col.ok_or_else(|| SableError::new("output column was not populated")))
            .collect::<Result<Vec<_>>>()?;

        Ok(TaskResult::Batch(Batch::try_from_arrays(columns)?))
    }

    /// Aggregating empty input without groups yields one row of aggregate
    /// identities.
    fn empty_aggregate_result(&self, context: &EngineContext) -> Result<Batch> {
        let group_count = self.op.group_types.len();
        let total_columns =
            group_count + self.op.aggregates.len() + self.op.grouping_functions.len();
        let mut columns: Vec<Option<Arc<Array>>> = vec![None; total_columns];

        for &null_group in &self.null_groups {
            columns[null_group] = Some(Arc::new(Array::new_nulls(
                self.op.group_types[null_group],
                1,
            )));
        }

        // Initialize and immediately finalize a single state row.
        let allocator = ArenaAllocator::new();
        let mut data =
            TupleDataCollection::new(context.buffer_manager.clone(), self.layout.clone());
        let (block, row) = data.allocate_row();
        self.layout
            .initialize_aggregate_states(&allocator, data.row_mut(block, row));

        let addresses = vec![RowAddress {
            partition: 0,
            block,
            row,
        }];
        for (agg_idx, aggregate) in self.layout.aggregates().iter().enumerate() {
            let input_data = aggregate.input_data(&allocator);
            let offset = self.layout.aggregate_offset(agg_idx);
            let size = aggregate.function.state_size();

            let array = {
                let mut states = StateAccessor::collection(&mut data, &addresses, offset, size);
                aggregate.function.finalize(&input_data, &mut states)?
            };
            if aggregate.function.has_destructor() {
                let mut states = StateAccessor::collection(&mut data, &addresses, offset, size);
                aggregate.function.destroy(&input_data, &mut states)?;
            }
            columns[group_count + agg_idx] = Some(Arc::new(array));
        }

        for (idx, &value) in self.grouping_values.iter().enumerate() {
            columns[group_count + self.op.aggregates.len() + idx] =
                Some(Arc::new(Array::Int64(Int64Array::from_iter([value]))));
        }

        let columns = columns
            .into_iter()
            .map(|col| col.ok_or_else(|| SableError::new("output column was not populated")))
            .collect::<Result<Vec<_>>>()?;

        Batch::try_from_arrays(columns)
    }

    /// Query progress as a percentage.
    ///
    /// Combining dominates scanning, weigh partition combine progress twice as
    /// heavy as scan completion.
    pub fn progress(
        &self,
        _sink: &RadixHtGlobalSinkState,
        gstate: &RadixHtGlobalSourceState,
    ) -> f64 {
        let num_partitions = gstate.partitions.len();
        if num_partitions == 0 {
            return if gstate.finished.load(Ordering::Relaxed) {
                100.0
            } else {
                0.0
            };
        }

        let mut total_progress: f64 = gstate
            .partitions
            .iter()
            .map(|partition| 2.0 * partition.progress())
            .sum();
        total_progress += gstate.task_done.load(Ordering::Relaxed) as f64;

        100.0 * total_progress / (3.0 * num_partitions as f64)
    }
}
