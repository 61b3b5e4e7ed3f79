pub mod config;
pub mod entry;
pub mod hash_table;
pub mod sink;
pub mod source;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Waker};

use parking_lot::Mutex;
use sable_error::{OptionExt, Result, SableError};
use sable_vector::array::{Array, Int8Array};
use sable_vector::batch::Batch;
use sable_vector::datatype::DataType;

use crate::execution::operators::{
    OperatorState, PartitionState, PhysicalOperator, PollFinalize, PollPull, PollPush,
};
use crate::functions::aggregate::AggregateExpr;
use crate::row::layout::RowLayout;
use crate::runtime::EngineContext;

use self::sink::{RadixHtGlobalSinkState, RadixHtLocalSinkState};
use self::source::{RadixHtGlobalSourceState, RadixHtLocalSourceState, SourcePoll};

/// Constant key injected when the grouping set is empty, so ungrouped
/// aggregation flows through the same paths as grouped aggregation.
const UNGROUPED_SENTINEL: i8 = 42;

/// Describes the grouped aggregation an operator computes, independent of any
/// particular grouping set.
#[derive(Debug)]
pub struct GroupedAggregateInfo {
    /// Types of all grouping columns.
    pub group_types: Vec<DataType>,
    /// Input column index per grouping column.
    pub group_column_indexes: Vec<usize>,

    /// Types of the payload (aggregate input) columns.
    pub payload_types: Vec<DataType>,
    /// Input column index per payload column.
    pub payload_column_indexes: Vec<usize>,

    pub aggregates: Vec<AggregateExpr>,

    /// Column index lists of `GROUPING()` calls in the select list.
    pub grouping_functions: Vec<Vec<usize>>,
}

impl GroupedAggregateInfo {
    pub fn aggregate_return_types(&self) -> Vec<DataType> {
        self.aggregates
            .iter()
            .map(|agg| agg.function.return_type())
            .collect()
    }
}

/// Radix-partitioned aggregate hash table for a single grouping set.
///
/// Drives grouped aggregation through three phases: parallel sink into
/// thread-local hash tables, per-partition combine, and cooperative scan. See
/// the sink and source modules for the phase implementations.
#[derive(Debug)]
pub struct RadixHashTable {
    /// Column indices active in this grouping.
    pub(crate) grouping_set: BTreeSet<usize>,
    /// Grouping columns not in the set, emitted as nulls.
    pub(crate) null_groups: Vec<usize>,
    /// Types of the active grouping columns. Holds a single dummy column when
    /// the set is empty.
    pub(crate) group_types: Vec<DataType>,
    /// Precomputed output of each `GROUPING()` call for this set.
    pub(crate) grouping_values: Vec<i64>,
    pub(crate) layout: Arc<RowLayout>,
    pub(crate) op: Arc<GroupedAggregateInfo>,
}

impl RadixHashTable {
    pub fn try_new(grouping_set: BTreeSet<usize>, op: Arc<GroupedAggregateInfo>) -> Result<Self> {
        if let Some(&max) = grouping_set.iter().max() {
            if max >= op.group_types.len() {
                return Err(SableError::new(format!(
                    "grouping set references column {max}, operator only has {} groups",
                    op.group_types.len()
                )));
            }
        }

        let null_groups: Vec<usize> = (0..op.group_types.len())
            .filter(|idx| !grouping_set.contains(idx))
            .collect();

        let mut group_types = Vec::with_capacity(grouping_set.len().max(1));
        if grouping_set.is_empty() {
            group_types.push(DataType::Int8);
        }
        for &idx in &grouping_set {
            group_types.push(op.group_types[idx]);
        }

        let grouping_values = compute_grouping_values(&grouping_set, &op.grouping_functions);

        let layout = Arc::new(RowLayout::try_new(
            group_types.clone(),
            op.aggregates.clone(),
        )?);

        Ok(RadixHashTable {
            grouping_set,
            null_groups,
            group_types,
            grouping_values,
            layout,
            op,
        })
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    /// Project the active grouping columns out of the input by reference. For
    /// grouping-free aggregation this produces a single constant column.
    pub(crate) fn populate_group_chunk(
        &self,
        input: &Batch,
        group_chunk: &mut Vec<Arc<Array>>,
    ) -> Result<()> {
        group_chunk.clear();

        if self.grouping_set.is_empty() {
            group_chunk.push(Arc::new(Array::Int8(Int8Array::from_iter(
                std::iter::repeat(UNGROUPED_SENTINEL).take(input.num_rows()),
            ))));
            return Ok(());
        }

        for &group_idx in &self.grouping_set {
            let column_idx = self.op.group_column_indexes[group_idx];
            let column = input
                .column(column_idx)
                .required("group input column in bounds")?
                .clone();
            group_chunk.push(column);
        }

        Ok(())
    }
}

/// Compute the integer a `GROUPING()` call evaluates to for a grouping set:
/// one bit per argument, set when that column is inactive, first argument in
/// the highest bit.
fn compute_grouping_values(
    grouping_set: &BTreeSet<usize>,
    grouping_functions: &[Vec<usize>],
) -> Vec<i64> {
    grouping_functions
        .iter()
        .map(|grouping| {
            let mut value: i64 = 0;
            for (idx, col) in grouping.iter().enumerate() {
                if !grouping_set.contains(col) {
                    value |= 1 << (grouping.len() - (idx + 1));
                }
            }
            value
        })
        .collect()
}

/// Hash aggregate operator: one radix hash table per grouping set, every
/// input batch feeds all of them.
#[derive(Debug)]
pub struct PhysicalHashAggregate {
    op: Arc<GroupedAggregateInfo>,
    tables: Vec<RadixHashTable>,
}

#[derive(Debug)]
pub struct HashAggregateOperatorState {
    context: EngineContext,
    sink_states: Vec<Arc<RadixHtGlobalSinkState>>,
    /// Source states, published once the last sink partition finalizes.
    source_states: Mutex<Option<Vec<Arc<RadixHtGlobalSourceState>>>>,
    /// Sink partitions that haven't finalized their pushes yet.
    remaining_sink_partitions: AtomicUsize,
    /// Pull-side wakers parked until the source states exist.
    pull_wakers: Mutex<Vec<Waker>>,
}

#[derive(Debug)]
pub struct HashAggregatePartitionState {
    sink_locals: Vec<RadixHtLocalSinkState>,
    source_locals: Option<Vec<RadixHtLocalSourceState>>,
    /// Grouping-set table this partition is currently draining.
    current_table: usize,
}

impl PhysicalHashAggregate {
    pub fn try_new(op: GroupedAggregateInfo, grouping_sets: Vec<BTreeSet<usize>>) -> Result<Self> {
        let op = Arc::new(op);
        let tables = grouping_sets
            .into_iter()
            .map(|set| RadixHashTable::try_new(set, op.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(PhysicalHashAggregate { op, tables })
    }

    pub fn tables(&self) -> &[RadixHashTable] {
        &self.tables
    }

    pub fn create_states(
        &self,
        context: &EngineContext,
        partitions: usize,
    ) -> (HashAggregateOperatorState, Vec<HashAggregatePartitionState>) {
        let operator_state = HashAggregateOperatorState {
            context: context.clone(),
            sink_states: self
                .tables
                .iter()
                .map(|table| Arc::new(table.global_sink_state(context)))
                .collect(),
            source_states: Mutex::new(None),
            remaining_sink_partitions: AtomicUsize::new(partitions),
            pull_wakers: Mutex::new(Vec::new()),
        };

        let partition_states = (0..partitions)
            .map(|_| HashAggregatePartitionState {
                sink_locals: self
                    .tables
                    .iter()
                    .map(|table| table.local_sink_state())
                    .collect(),
                source_locals: None,
                current_table: 0,
            })
            .collect();

        (operator_state, partition_states)
    }
}

impl PhysicalOperator for PhysicalHashAggregate {
    fn poll_push(
        &self,
        _cx: &mut Context,
        partition_state: &mut PartitionState,
        operator_state: &OperatorState,
        batch: Batch,
    ) -> Result<PollPush> {
        let state = match partition_state {
            PartitionState::HashAggregate(state) => state,
            other => panic!("invalid partition state: {other:?}"),
        };
        let operator_state = match operator_state {
            OperatorState::HashAggregate(state) => state,
            other => panic!("invalid operator state: {other:?}"),
        };

        let payload = batch.project(&self.op.payload_column_indexes);
        for (idx, table) in self.tables.iter().enumerate() {
            table.sink(
                &operator_state.context,
                &batch,
                &payload,
                None,
                &operator_state.sink_states[idx],
                &mut state.sink_locals[idx],
            )?;
        }

        Ok(PollPush::NeedsMore)
    }

    fn poll_finalize_push(
        &self,
        _cx: &mut Context,
        partition_state: &mut PartitionState,
        operator_state: &OperatorState,
    ) -> Result<PollFinalize> {
        let state = match partition_state {
            PartitionState::HashAggregate(state) => state,
            other => panic!("invalid partition state: {other:?}"),
        };
        let operator_state = match operator_state {
            OperatorState::HashAggregate(state) => state,
            other => panic!("invalid operator state: {other:?}"),
        };

        for (idx, table) in self.tables.iter().enumerate() {
            table.combine(
                &operator_state.context,
                &operator_state.sink_states[idx],
                &mut state.sink_locals[idx],
            )?;
        }

        let remaining = operator_state
            .remaining_sink_partitions
            .fetch_sub(1, Ordering::Relaxed);
        if remaining == 1 {
            // Last sink partition. Finalize every table and open the source
            // side.
            let mut source_states = Vec::with_capacity(self.tables.len());
            for (idx, table) in self.tables.iter().enumerate() {
                table.finalize(&operator_state.context, &operator_state.sink_states[idx])?;
                source_states.push(Arc::new(
                    table.global_source_state(&operator_state.sink_states[idx]),
                ));
            }
            *operator_state.source_states.lock() = Some(source_states);

            for waker in operator_state.pull_wakers.lock().drain(..) {
                waker.wake();
            }
        }

        Ok(PollFinalize::Finalized)
    }

    fn poll_pull(
        &self,
        cx: &mut Context,
        partition_state: &mut PartitionState,
        operator_state: &OperatorState,
    ) -> Result<PollPull> {
        let state = match partition_state {
            PartitionState::HashAggregate(state) => state,
            other => panic!("invalid partition state: {other:?}"),
        };
        let operator_state = match operator_state {
            OperatorState::HashAggregate(state) => state,
            other => panic!("invalid operator state: {other:?}"),
        };

        let source_states = match operator_state.source_states.lock().as_ref() {
            Some(states) => states.clone(),
            None => {
                // Sink side hasn't finalized yet.
                operator_state.pull_wakers.lock().push(cx.waker().clone());
                return Ok(PollPull::Pending);
            }
        };

        let locals = state.source_locals.get_or_insert_with(|| {
            self.tables
                .iter()
                .map(|table| table.local_source_state())
                .collect()
        });

        while state.current_table < self.tables.len() {
            let idx = state.current_table;
            match self.tables[idx].get_data(
                cx,
                &operator_state.context,
                &operator_state.sink_states[idx],
                &source_states[idx],
                &mut locals[idx],
            )? {
                SourcePoll::HaveMoreOutput(batch) => return Ok(PollPull::Batch(batch)),
                SourcePoll::Blocked => return Ok(PollPull::Pending),
                SourcePoll::Finished => state.current_table += 1,
            }
        }

        Ok(PollPull::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    use parking_lot::Condvar;
    use sable_vector::array::Int64Array;
    use sable_vector::bitmap::Bitmap;

    use super::*;
    use crate::functions::aggregate::count::CountStar;
    use crate::functions::aggregate::sum::Sum;
    use crate::functions::aggregate::{
        AggregateBindData, AggregateFunction, AggregateInputData, StateAccessor,
    };
    use crate::storage::buffer_manager::BufferManager;
    use crate::storage::temporary_memory::TemporaryMemoryManager;
    use crate::scheduler::Scheduler;

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWaker))
    }

    /// Waker that unblocks a parked test thread.
    struct ParkWaker {
        woken: Mutex<bool>,
        condvar: Condvar,
    }

    impl ParkWaker {
        fn new() -> Arc<Self> {
            Arc::new(ParkWaker {
                woken: Mutex::new(false),
                condvar: Condvar::new(),
            })
        }

        fn notify(&self) {
            *self.woken.lock() = true;
            self.condvar.notify_all();
        }

        fn park(&self) {
            let mut woken = self.woken.lock();
            while !*woken {
                self.condvar.wait(&mut woken);
            }
            *woken = false;
        }
    }

    impl Wake for ParkWaker {
        fn wake(self: Arc<Self>) {
            self.notify();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.notify();
        }
    }

    fn test_context(num_threads: usize, memory_limit: usize) -> EngineContext {
        EngineContext::try_new(num_threads, memory_limit).unwrap()
    }

    /// `SELECT k, sum(v) FROM input GROUP BY k` over `(k Int64, v Int64)`.
    fn sum_info() -> GroupedAggregateInfo {
        let sum = Sum.specialize(&DataType::Int64).unwrap();
        GroupedAggregateInfo {
            group_types: vec![DataType::Int64],
            group_column_indexes: vec![0],
            payload_types: vec![DataType::Int64],
            payload_column_indexes: vec![1],
            aggregates: vec![AggregateExpr::new(sum, Bitmap::from_iter([true]))],
            grouping_functions: Vec::new(),
        }
    }

    /// `SELECT k, count(*) FROM input GROUP BY k` over `(k Int64)`.
    fn count_star_info() -> GroupedAggregateInfo {
        GroupedAggregateInfo {
            group_types: vec![DataType::Int64],
            group_column_indexes: vec![0],
            payload_types: Vec::new(),
            payload_column_indexes: Vec::new(),
            aggregates: vec![AggregateExpr::new(
                Arc::new(CountStar),
                Bitmap::new_with_all_false(0),
            )],
            grouping_functions: Vec::new(),
        }
    }

    fn kv_batch(rows: impl IntoIterator<Item = (i64, i64)>) -> Batch {
        let (keys, values): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
        Batch::try_new([
            Array::Int64(Int64Array::from_iter(keys)),
            Array::Int64(Int64Array::from_iter(values)),
        ])
        .unwrap()
    }

    fn key_batch(keys: impl IntoIterator<Item = i64>) -> Batch {
        Batch::try_new([Array::Int64(Int64Array::from_iter(keys))]).unwrap()
    }

    fn i64_at(batch: &Batch, col: usize, row: usize) -> Option<i64> {
        let arr = batch.column(col).unwrap();
        if !arr.is_valid(row) {
            return None;
        }
        match arr.as_ref() {
            Array::Int64(arr) => Some(arr.value(row)),
            other => panic!("expected Int64 column, got {other:?}"),
        }
    }

    /// Flatten output batches into rows of optional i64s, sorted.
    fn sorted_rows(batches: &[Batch]) -> Vec<Vec<Option<i64>>> {
        let mut rows = Vec::new();
        for batch in batches {
            for row in 0..batch.num_rows() {
                rows.push(
                    (0..batch.num_columns())
                        .map(|col| i64_at(batch, col, row))
                        .collect::<Vec<_>>(),
                );
            }
        }
        rows.sort();
        rows
    }

    /// Sink the batches on one worker, finalize, then drain the source,
    /// checking progress monotonicity along the way.
    fn run_serial(
        table: &RadixHashTable,
        context: &EngineContext,
        batches: Vec<Batch>,
    ) -> Vec<Batch> {
        let gstate = table.global_sink_state(context);
        let mut lstate = table.local_sink_state();

        for batch in &batches {
            let payload = batch.project(&table.op.payload_column_indexes);
            table
                .sink(context, batch, &payload, None, &gstate, &mut lstate)
                .unwrap();
        }
        table.combine(context, &gstate, &mut lstate).unwrap();
        table.finalize(context, &gstate).unwrap();

        let source = table.global_source_state(&gstate);
        let mut local_source = table.local_source_state();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut out = Vec::new();
        let mut last_progress = 0.0;
        loop {
            match table
                .get_data(&mut cx, context, &gstate, &source, &mut local_source)
                .unwrap()
            {
                SourcePoll::HaveMoreOutput(batch) => out.push(batch),
                SourcePoll::Blocked => panic!("single worker should never block"),
                SourcePoll::Finished => break,
            }
            let progress = table.progress(&gstate, &source);
            assert!(progress >= last_progress);
            assert!((0.0..=100.0).contains(&progress));
            last_progress = progress;
        }

        assert_eq!(100.0, table.progress(&gstate, &source));
        out
    }

    /// Parallel sink and source over `worker_batches.len()` worker threads.
    fn run_parallel(
        table: &RadixHashTable,
        context: &EngineContext,
        worker_batches: Vec<Vec<Batch>>,
    ) -> Vec<Batch> {
        assert_eq!(context.scheduler.num_threads(), worker_batches.len());
        let gstate = table.global_sink_state(context);

        context.scheduler.run_workers(|worker| {
            let mut lstate = table.local_sink_state();
            for batch in &worker_batches[worker] {
                let payload = batch.project(&table.op.payload_column_indexes);
                table
                    .sink(context, batch, &payload, None, &gstate, &mut lstate)
                    .unwrap();
            }
            table.combine(context, &gstate, &mut lstate).unwrap();
        });

        table.finalize(context, &gstate).unwrap();

        let source = table.global_source_state(&gstate);
        let out = Mutex::new(Vec::new());
        context.scheduler.run_workers(|_| {
            let park = ParkWaker::new();
            let waker = Waker::from(park.clone());
            let mut cx = Context::from_waker(&waker);
            let mut local_source = table.local_source_state();
            loop {
                match table
                    .get_data(&mut cx, context, &gstate, &source, &mut local_source)
                    .unwrap()
                {
                    SourcePoll::HaveMoreOutput(batch) => out.lock().push(batch),
                    SourcePoll::Blocked => park.park(),
                    SourcePoll::Finished => break,
                }
            }
        });

        assert_eq!(100.0, table.progress(&gstate, &source));
        out.into_inner()
    }

    #[test]
    fn sum_by_key() {
        // 10 rows (k = i % 3, v = 1), SUM(v) GROUP BY k.
        let context = test_context(1, 1 << 28);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(sum_info())).unwrap();

        let batch = kv_batch((0..10).map(|i| (i % 3, 1)));
        let out = run_serial(&table, &context, vec![batch]);

        assert_eq!(
            vec![
                vec![Some(0), Some(4)],
                vec![Some(1), Some(3)],
                vec![Some(2), Some(3)],
            ],
            sorted_rows(&out)
        );
    }

    #[test]
    fn count_star_empty_input_no_groups() {
        // COUNT(*) with no GROUP BY over zero rows returns a single 0.
        let context = test_context(1, 1 << 28);
        let info = GroupedAggregateInfo {
            group_types: Vec::new(),
            group_column_indexes: Vec::new(),
            ..count_star_info()
        };
        let table = RadixHashTable::try_new(BTreeSet::new(), Arc::new(info)).unwrap();

        let out = run_serial(&table, &context, Vec::new());
        assert_eq!(vec![vec![Some(0)]], sorted_rows(&out));
    }

    #[test]
    fn grouped_empty_input_is_empty() {
        let context = test_context(1, 1 << 28);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(sum_info())).unwrap();

        let out = run_serial(&table, &context, Vec::new());
        assert!(sorted_rows(&out).is_empty());
    }

    #[test]
    fn ungrouped_sum_over_rows() {
        let context = test_context(1, 1 << 28);
        let info = GroupedAggregateInfo {
            group_types: Vec::new(),
            group_column_indexes: Vec::new(),
            ..sum_info()
        };
        // Payload is column 1, as in sum_info.
        let table = RadixHashTable::try_new(BTreeSet::new(), Arc::new(info)).unwrap();

        let batch = kv_batch([(0, 5), (1, 7), (2, 8)]);
        let out = run_serial(&table, &context, vec![batch]);
        assert_eq!(vec![vec![Some(20)]], sorted_rows(&out));
    }

    #[test]
    fn parallel_count_unique_keys() {
        // Many unique keys over 8 workers stays in-memory with bounded
        // fan-out.
        let context = test_context(8, 1 << 30);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(count_star_info())).unwrap();

        let num_workers = 8;
        let keys_per_worker = 1 << 15;
        let worker_batches: Vec<Vec<Batch>> = (0..num_workers)
            .map(|worker| {
                let start = (worker * keys_per_worker) as i64;
                (0..keys_per_worker / 2048)
                    .map(|chunk| {
                        let base = start + (chunk * 2048) as i64;
                        key_batch(base..base + 2048)
                    })
                    .collect()
            })
            .collect();

        let out = run_parallel(&table, &context, worker_batches);

        let rows = sorted_rows(&out);
        assert_eq!((num_workers * keys_per_worker) as usize, rows.len());
        assert!(rows.iter().all(|row| row[1] == Some(1)));
    }

    #[test]
    fn external_aggregation_spills_and_matches() {
        // Starve the memory manager so the sink goes out-of-core, output must
        // be identical to the in-memory run.
        let keys: Vec<i64> = (0..50_000).collect();
        let batches = |keys: &[i64]| -> Vec<Batch> {
            keys.chunks(2048).map(|c| key_batch(c.iter().copied())).collect()
        };

        let rich_context = test_context(1, 1 << 30);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(count_star_info())).unwrap();
        let expected = sorted_rows(&run_serial(&table, &rich_context, batches(&keys)));

        let poor_context = EngineContext::new(
            Arc::new(BufferManager::new(1 << 16, 0)),
            Arc::new(TemporaryMemoryManager::new(0)),
            Arc::new(Scheduler::try_new(1).unwrap()),
        );
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(count_star_info())).unwrap();

        let gstate = table.global_sink_state(&poor_context);
        gstate.temporary_memory_state.set_minimum_reservation(0);
        gstate.temporary_memory_state.set_remaining_size(0);

        let mut lstate = table.local_sink_state();
        for batch in batches(&keys) {
            let payload = batch.project(&table.op.payload_column_indexes);
            table
                .sink(&poor_context, &batch, &payload, None, &gstate, &mut lstate)
                .unwrap();
        }
        assert!(gstate.external.load(Ordering::Relaxed));
        // Single thread, so the external radix bits are the initial 0 plus the
        // external increment.
        assert_eq!(3, gstate.config.radix_bits());

        table.combine(&poor_context, &gstate, &mut lstate).unwrap();
        table.finalize(&poor_context, &gstate).unwrap();

        let source = table.global_source_state(&gstate);
        let mut local_source = table.local_source_state();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut out = Vec::new();
        loop {
            match table
                .get_data(&mut cx, &poor_context, &gstate, &source, &mut local_source)
                .unwrap()
            {
                SourcePoll::HaveMoreOutput(batch) => out.push(batch),
                SourcePoll::Blocked => panic!("single worker should never block"),
                SourcePoll::Finished => break,
            }
        }

        assert_eq!(expected, sorted_rows(&out));
    }

    #[test]
    fn repartition_raises_fan_out() {
        // Small blocks and >8 scheduler threads leave headroom between the
        // initial and maximum radix bits, crossing the fill threshold must
        // repartition.
        let context = EngineContext::new(
            Arc::new(BufferManager::new(4096, 1 << 30)),
            Arc::new(TemporaryMemoryManager::new(1 << 30)),
            Arc::new(Scheduler::try_new(16).unwrap()),
        );
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(count_star_info())).unwrap();

        let num_workers: usize = 3;
        let keys_per_worker: i64 = 45_000;
        let worker_batches: Vec<Vec<Batch>> = (0..num_workers)
            .map(|worker| {
                let start = worker as i64 * keys_per_worker;
                (start..start + keys_per_worker)
                    .collect::<Vec<_>>()
                    .chunks(2048)
                    .map(|chunk| key_batch(chunk.iter().copied()))
                    .collect()
            })
            .collect();

        let gstate = table.global_sink_state(&context);
        // All workers sink one batch before anyone can cross the resize
        // threshold, making the active thread count deterministic.
        let barrier = std::sync::Barrier::new(num_workers);
        let (table_ref, context_ref, gstate_ref, barrier_ref) =
            (&table, &context, &gstate, &barrier);
        std::thread::scope(|scope| {
            for batches in &worker_batches {
                scope.spawn(move || {
                    let mut lstate = table_ref.local_sink_state();
                    for (idx, batch) in batches.iter().enumerate() {
                        let payload = batch.project(&table_ref.op.payload_column_indexes);
                        table_ref
                            .sink(context_ref, batch, &payload, None, gstate_ref, &mut lstate)
                            .unwrap();
                        if idx == 0 {
                            barrier_ref.wait();
                        }
                    }
                    table_ref.combine(context_ref, gstate_ref, &mut lstate).unwrap();
                });
            }
        });

        // Initial bits for 16 threads is 3, maximum 4. The fill factor check
        // must have raised it.
        assert_eq!(4, gstate.config.radix_bits());
        assert!(!gstate.external.load(Ordering::Relaxed));

        // Frozen after combine.
        gstate.config.set_radix_bits(7, &gstate);
        assert_eq!(4, gstate.config.radix_bits());

        table.finalize(&context, &gstate).unwrap();
        assert_eq!(16, gstate.partitions().len());

        let source = table.global_source_state(&gstate);
        let out = Mutex::new(Vec::new());
        let (source_ref, out_ref) = (&source, &out);
        std::thread::scope(|scope| {
            for _ in 0..num_workers {
                scope.spawn(move || {
                    let park = ParkWaker::new();
                    let waker = Waker::from(park.clone());
                    let mut cx = Context::from_waker(&waker);
                    let mut local_source = table_ref.local_source_state();
                    loop {
                        match table_ref
                            .get_data(&mut cx, context_ref, gstate_ref, source_ref, &mut local_source)
                            .unwrap()
                        {
                            SourcePoll::HaveMoreOutput(batch) => out_ref.lock().push(batch),
                            SourcePoll::Blocked => park.park(),
                            SourcePoll::Finished => break,
                        }
                    }
                });
            }
        });

        let rows = sorted_rows(&out.into_inner());
        assert_eq!((num_workers as i64 * keys_per_worker) as usize, rows.len());
    }

    #[test]
    fn late_sink_after_combine_is_included() {
        // A worker may still be sinking after another worker combined. Its
        // rows arrive through its own combine, with the radix bits frozen.
        let context = test_context(2, 1 << 28);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(sum_info())).unwrap();

        let gstate = table.global_sink_state(&context);

        let mut early = table.local_sink_state();
        let batch = kv_batch([(0, 1), (1, 2)]);
        let payload = batch.project(&table.op.payload_column_indexes);
        table
            .sink(&context, &batch, &payload, None, &gstate, &mut early)
            .unwrap();
        table.combine(&context, &gstate, &mut early).unwrap();
        assert!(gstate.any_combined.load(Ordering::Relaxed));

        let bits_at_freeze = gstate.config.radix_bits();
        let mut late = table.local_sink_state();
        let batch = kv_batch([(0, 10), (2, 20)]);
        let payload = batch.project(&table.op.payload_column_indexes);
        table
            .sink(&context, &batch, &payload, None, &gstate, &mut late)
            .unwrap();
        table.combine(&context, &gstate, &mut late).unwrap();
        assert_eq!(bits_at_freeze, gstate.config.radix_bits());

        table.finalize(&context, &gstate).unwrap();

        let source = table.global_source_state(&gstate);
        let mut local_source = table.local_source_state();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut out = Vec::new();
        loop {
            match table
                .get_data(&mut cx, &context, &gstate, &source, &mut local_source)
                .unwrap()
            {
                SourcePoll::HaveMoreOutput(batch) => out.push(batch),
                SourcePoll::Blocked => panic!("single worker should never block"),
                SourcePoll::Finished => break,
            }
        }

        assert_eq!(
            vec![
                vec![Some(0), Some(11)],
                vec![Some(1), Some(2)],
                vec![Some(2), Some(20)],
            ],
            sorted_rows(&out)
        );
    }

    #[test]
    fn single_thread_shortcut_skips_finalize() {
        let context = test_context(1, 1 << 28);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(sum_info())).unwrap();

        let gstate = table.global_sink_state(&context);
        let mut lstate = table.local_sink_state();
        let batch = kv_batch((0..100).map(|i| (i, 1)));
        let payload = batch.project(&table.op.payload_column_indexes);
        table
            .sink(&context, &batch, &payload, None, &gstate, &mut lstate)
            .unwrap();
        table.combine(&context, &gstate, &mut lstate).unwrap();
        table.finalize(&context, &gstate).unwrap();

        let partitions = gstate.partitions();
        assert!(!partitions.is_empty());
        assert_eq!(1, table.max_threads(&context, &gstate));
        assert_eq!(
            partitions.len(),
            gstate.finalize_done.load(Ordering::Relaxed)
        );
        for partition in &partitions {
            assert_eq!(
                sink::AggregatePartitionState::ReadyToScan,
                partition.state()
            );
            assert_eq!(1.0, partition.progress());
        }
    }

    #[test]
    fn grouping_values_encode_inactive_columns() {
        // GROUPING(a, b, c) with grouping set {a, c} = 0b010.
        let values = compute_grouping_values(&BTreeSet::from([0, 2]), &[vec![0, 1, 2]]);
        assert_eq!(vec![2], values);

        let values = compute_grouping_values(&BTreeSet::new(), &[vec![0, 1]]);
        assert_eq!(vec![3], values);
    }

    #[test]
    fn grouping_sets_emit_null_groups_and_grouping_values() {
        // GROUPING SETS ((a), (b), (a, b)) with SUM(v) and GROUPING(a, b).
        let context = test_context(1, 1 << 28);
        let make_info = || {
            let sum = Sum.specialize(&DataType::Int64).unwrap();
            GroupedAggregateInfo {
                group_types: vec![DataType::Int64, DataType::Int64],
                group_column_indexes: vec![0, 1],
                payload_types: vec![DataType::Int64],
                payload_column_indexes: vec![2],
                aggregates: vec![AggregateExpr::new(sum, Bitmap::from_iter([true]))],
                grouping_functions: vec![vec![0, 1]],
            }
        };

        let input = Batch::try_new([
            Array::Int64(Int64Array::from_iter([1, 1, 2])),
            Array::Int64(Int64Array::from_iter([10, 20, 10])),
            Array::Int64(Int64Array::from_iter([1, 2, 4])),
        ])
        .unwrap();

        // Set (a): b is null, grouping value 0b01.
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(make_info())).unwrap();
        let out = run_serial(&table, &context, vec![input.clone()]);
        assert_eq!(
            vec![
                vec![Some(1), None, Some(3), Some(1)],
                vec![Some(2), None, Some(4), Some(1)],
            ],
            sorted_rows(&out)
        );

        // Set (b): a is null, grouping value 0b10.
        let table =
            RadixHashTable::try_new(BTreeSet::from([1]), Arc::new(make_info())).unwrap();
        let out = run_serial(&table, &context, vec![input.clone()]);
        assert_eq!(
            vec![
                vec![None, Some(10), Some(5), Some(2)],
                vec![None, Some(20), Some(2), Some(2)],
            ],
            sorted_rows(&out)
        );

        // Set (a, b): nothing null, grouping value 0.
        let table =
            RadixHashTable::try_new(BTreeSet::from([0, 1]), Arc::new(make_info())).unwrap();
        let out = run_serial(&table, &context, vec![input]);
        assert_eq!(
            vec![
                vec![Some(1), Some(10), Some(1), Some(0)],
                vec![Some(1), Some(20), Some(2), Some(0)],
                vec![Some(2), Some(10), Some(4), Some(0)],
            ],
            sorted_rows(&out)
        );
    }

    /// Count aggregate with a destructor that tallies into its bind data.
    #[derive(Debug)]
    struct SpyBindData {
        destroyed: AtomicUsize,
    }

    impl AggregateBindData for SpyBindData {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Debug)]
    struct SpyCount;

    impl AggregateFunction for SpyCount {
        fn name(&self) -> &'static str {
            "spy_count"
        }

        fn return_type(&self) -> DataType {
            DataType::Int64
        }

        fn state_size(&self) -> usize {
            CountStar.state_size()
        }

        fn initialize(&self, input: &AggregateInputData, state: &mut [u8]) {
            CountStar.initialize(input, state)
        }

        fn update(
            &self,
            input: &AggregateInputData,
            inputs: &[&Array],
            num_rows: usize,
            states: &mut StateAccessor,
        ) -> sable_error::Result<()> {
            CountStar.update(input, inputs, num_rows, states)
        }

        fn combine(
            &self,
            input: &AggregateInputData,
            sources: &mut StateAccessor,
            targets: &mut StateAccessor,
        ) -> sable_error::Result<()> {
            CountStar.combine(input, sources, targets)
        }

        fn finalize(
            &self,
            input: &AggregateInputData,
            states: &mut StateAccessor,
        ) -> sable_error::Result<Array> {
            CountStar.finalize(input, states)
        }

        fn has_destructor(&self) -> bool {
            true
        }

        fn destroy(
            &self,
            input: &AggregateInputData,
            states: &mut StateAccessor,
        ) -> sable_error::Result<()> {
            let bind = input
                .bind_data
                .expect("spy aggregate to have bind data")
                .as_any()
                .downcast_ref::<SpyBindData>()
                .expect("bind data to be spy bind data");
            bind.destroyed.fetch_add(states.len(), Ordering::Relaxed);
            Ok(())
        }
    }

    fn spy_info(bind: Arc<SpyBindData>) -> GroupedAggregateInfo {
        GroupedAggregateInfo {
            group_types: vec![DataType::Int64],
            group_column_indexes: vec![0],
            payload_types: Vec::new(),
            payload_column_indexes: Vec::new(),
            aggregates: vec![AggregateExpr::new(
                Arc::new(SpyCount),
                Bitmap::new_with_all_false(0),
            )
            .with_bind_data(bind)],
            grouping_functions: Vec::new(),
        }
    }

    #[test]
    fn destructor_runs_exactly_once_per_group() {
        let bind = Arc::new(SpyBindData {
            destroyed: AtomicUsize::new(0),
        });
        let context = test_context(4, 1 << 30);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(spy_info(bind.clone())))
                .unwrap();

        // 4 workers, overlapping keys so combine has to merge (and must not
        // double-destroy).
        let worker_batches: Vec<Vec<Batch>> = (0..4)
            .map(|_| vec![key_batch(0..1000)])
            .collect();
        let out = run_parallel(&table, &context, worker_batches);

        let rows = sorted_rows(&out);
        assert_eq!(1000, rows.len());
        assert!(rows.iter().all(|row| row[1] == Some(4)));
        assert_eq!(1000, bind.destroyed.load(Ordering::Relaxed));
    }

    #[test]
    fn multi_scan_destroys_on_teardown() {
        let bind = Arc::new(SpyBindData {
            destroyed: AtomicUsize::new(0),
        });
        let context = test_context(1, 1 << 28);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(spy_info(bind.clone())))
                .unwrap();

        let gstate = table.global_sink_state(&context);
        table.set_multi_scan(&gstate);

        let mut lstate = table.local_sink_state();
        let batch = key_batch(0..100);
        let payload = batch.project(&table.op.payload_column_indexes);
        table
            .sink(&context, &batch, &payload, None, &gstate, &mut lstate)
            .unwrap();
        table.combine(&context, &gstate, &mut lstate).unwrap();
        table.finalize(&context, &gstate).unwrap();

        // Scan twice, nothing gets destroyed while rows stay alive.
        for _ in 0..2 {
            let source = table.global_source_state(&gstate);
            let mut local_source = table.local_source_state();
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            let mut out = Vec::new();
            loop {
                match table
                    .get_data(&mut cx, &context, &gstate, &source, &mut local_source)
                    .unwrap()
                {
                    SourcePoll::HaveMoreOutput(batch) => out.push(batch),
                    SourcePoll::Blocked => panic!("single worker should never block"),
                    SourcePoll::Finished => break,
                }
            }
            assert_eq!(100, sorted_rows(&out).len());
        }
        assert_eq!(0, bind.destroyed.load(Ordering::Relaxed));

        // Teardown runs the destructors.
        drop(gstate);
        assert_eq!(100, bind.destroyed.load(Ordering::Relaxed));
    }

    #[test]
    fn cancelled_scan_releases_memory() {
        let bind = Arc::new(SpyBindData {
            destroyed: AtomicUsize::new(0),
        });
        let context = test_context(1, 1 << 28);
        let table =
            RadixHashTable::try_new(BTreeSet::from([0]), Arc::new(spy_info(bind.clone())))
                .unwrap();

        {
            let gstate = table.global_sink_state(&context);
            let mut lstate = table.local_sink_state();
            let batch = key_batch(0..100);
            let payload = batch.project(&table.op.payload_column_indexes);
            table
                .sink(&context, &batch, &payload, None, &gstate, &mut lstate)
                .unwrap();
            table.combine(&context, &gstate, &mut lstate).unwrap();
            table.finalize(&context, &gstate).unwrap();

            let source = table.global_source_state(&gstate);
            let mut local_source = table.local_source_state();
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);

            // Pull one chunk, then abandon the query.
            match table
                .get_data(&mut cx, &context, &gstate, &source, &mut local_source)
                .unwrap()
            {
                SourcePoll::HaveMoreOutput(_) | SourcePoll::Finished => {}
                SourcePoll::Blocked => panic!("single worker should never block"),
            }
        }

        // Every block went back to the buffer manager, and nothing was
        // destroyed twice.
        assert_eq!(0, context.buffer_manager.allocated_bytes());
        assert!(bind.destroyed.load(Ordering::Relaxed) <= 100);
    }

    #[test]
    fn operator_facade_aggregates_across_pipelines() {
        let context = test_context(2, 1 << 28);
        let operator = PhysicalHashAggregate::try_new(sum_info(), vec![BTreeSet::from([0])])
            .unwrap();

        let (operator_state, partition_states) = operator.create_states(&context, 2);
        let operator_state = OperatorState::HashAggregate(operator_state);
        let mut partition_states: Vec<_> = partition_states
            .into_iter()
            .map(PartitionState::HashAggregate)
            .collect();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        // Partition 0 and 1 each push a batch.
        let batches = [
            kv_batch([(0, 1), (1, 2), (0, 3)]),
            kv_batch([(1, 10), (2, 20)]),
        ];
        for (state, batch) in partition_states.iter_mut().zip(batches) {
            match operator
                .poll_push(&mut cx, state, &operator_state, batch)
                .unwrap()
            {
                PollPush::NeedsMore => {}
                other => panic!("unexpected poll push result: {other:?}"),
            }
        }

        // Pulling before the sink finalizes parks the waker.
        match operator
            .poll_pull(&mut cx, &mut partition_states[0], &operator_state)
            .unwrap()
        {
            PollPull::Pending => {}
            other => panic!("unexpected poll pull result: {other:?}"),
        }

        for state in partition_states.iter_mut() {
            match operator
                .poll_finalize_push(&mut cx, state, &operator_state)
                .unwrap()
            {
                PollFinalize::Finalized => {}
                other => panic!("unexpected poll finalize result: {other:?}"),
            }
        }

        let mut out = Vec::new();
        for state in partition_states.iter_mut() {
            loop {
                match operator.poll_pull(&mut cx, state, &operator_state).unwrap() {
                    PollPull::Batch(batch) => out.push(batch),
                    PollPull::Pending => continue,
                    PollPull::Exhausted => break,
                }
            }
        }

        assert_eq!(
            vec![
                vec![Some(0), Some(4)],
                vec![Some(1), Some(12)],
                vec![Some(2), Some(20)],
            ],
            sorted_rows(&out)
        );
    }
}
