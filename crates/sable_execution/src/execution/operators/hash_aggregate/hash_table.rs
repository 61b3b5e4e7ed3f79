use std::sync::Arc;

use sable_error::{Result, SableError};
use sable_vector::array::Array;
use sable_vector::compute::take::take;
use sable_vector::selection::SelectionVector;

use crate::execution::operators::util::hash::build_hashes;
use crate::execution::operators::util::DEFAULT_TARGET_BATCH_SIZE;
use crate::functions::aggregate::StateAccessor;
use crate::row::layout::RowLayout;
use crate::row::partitioned::PartitionedTupleData;
use crate::row::tuple_data::{TupleDataCollection, TupleDataScanState};
use crate::row::RowAddress;
use crate::storage::arena::ArenaAllocator;
use crate::storage::buffer_manager::BufferManager;

use super::entry::EntryKey;
use super::sink::PartitionProgress;

/// Grouped aggregate hash table.
///
/// A fixed-capacity open-addressed pointer table over rows that live in a
/// radix-partitioned collection. The pointer table can be cleared and the
/// logical count reset without touching the underlying rows, subsequent
/// inserts then append fresh groups into the same collection. Duplicate groups
/// produced that way get merged when partitions are combined.
pub struct GroupedAggregateHashTable {
    layout: Arc<RowLayout>,
    buffer_manager: Arc<BufferManager>,

    entries: Vec<EntryKey<RowAddress>>,
    /// Number of groups visible through the pointer table.
    count: usize,

    radix_bits: usize,
    partitioned_data: PartitionedTupleData,

    /// Arena backing any out-of-row aggregate state.
    aggregate_allocator: Arc<ArenaAllocator>,

    insert_buffers: InsertBuffers,
}

/// Reusable buffers during hash table inserts.
#[derive(Debug, Default)]
struct InsertBuffers {
    /// Row hashes for the chunk being inserted.
    hashes: Vec<u64>,
    /// Computed offsets into entries.
    offsets: Vec<usize>,
    /// Selection vector containing indices for input rows that still need to
    /// be inserted into the table.
    needs_insert: SelectionVector,
    /// Selection vector pointing to new groups.
    new_group_rows: SelectionVector,
    /// Selection vector pointing to rows that need to be compared.
    needs_compare: SelectionVector,
    /// Rows that don't pass the equality check.
    not_eq_rows: SelectionVector,
    /// Group addresses for each row in the input.
    group_addresses: Vec<RowAddress>,
}

impl GroupedAggregateHashTable {
    /// Count-to-capacity factor. The table holds `capacity / LOAD_FACTOR`
    /// groups before it needs a resize (or a pointer-table reset during the
    /// sink).
    pub const LOAD_FACTOR: f64 = 1.5;

    pub fn new(
        buffer_manager: Arc<BufferManager>,
        layout: Arc<RowLayout>,
        capacity: usize,
        radix_bits: usize,
    ) -> Self {
        let capacity = capacity.next_power_of_two();
        let partitioned_data =
            PartitionedTupleData::new(buffer_manager.clone(), layout.clone(), radix_bits);

        GroupedAggregateHashTable {
            layout,
            buffer_manager,
            entries: vec![EntryKey::default(); capacity],
            count: 0,
            radix_bits,
            partitioned_data,
            aggregate_allocator: Arc::new(ArenaAllocator::new()),
            insert_buffers: InsertBuffers::default(),
        }
    }

    pub fn initial_capacity() -> usize {
        DEFAULT_TARGET_BATCH_SIZE * 2
    }

    /// Pointer table capacity that comfortably fits `count` groups.
    pub fn capacity_for_count(count: usize) -> usize {
        let scaled = (count as f64 * Self::LOAD_FACTOR) as usize;
        std::cmp::max(scaled, Self::initial_capacity()).next_power_of_two()
    }

    pub fn entry_size() -> usize {
        std::mem::size_of::<EntryKey<RowAddress>>()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn resize_threshold(&self) -> usize {
        (self.capacity() as f64 / Self::LOAD_FACTOR) as usize
    }

    pub fn radix_bits(&self) -> usize {
        self.radix_bits
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    pub fn aggregate_allocator(&self) -> &Arc<ArenaAllocator> {
        &self.aggregate_allocator
    }

    /// Bytes held by the row data plus the pointer table.
    pub fn size_in_bytes(&self) -> usize {
        self.partitioned_data.size_in_bytes() + self.capacity() * Self::entry_size()
    }

    /// Empty the pointer table without touching the underlying row data.
    pub fn clear_pointer_table(&mut self) {
        self.entries.fill(EntryKey::default());
    }

    pub fn reset_count(&mut self) {
        self.count = 0;
    }

    /// Set the radix bits used for the next partitioned data initialization.
    pub fn set_radix_bits(&mut self, radix_bits: usize) {
        self.radix_bits = radix_bits;
    }

    /// Replace the partitioned data with a fresh empty collection at the
    /// current radix bits.
    pub fn initialize_partitioned_data(&mut self) {
        self.partitioned_data = PartitionedTupleData::new(
            self.buffer_manager.clone(),
            self.layout.clone(),
            self.radix_bits,
        );
    }

    pub fn unpin_data(&mut self) {
        self.partitioned_data.unpin();
    }

    pub fn partitioned_data(&self) -> &PartitionedTupleData {
        &self.partitioned_data
    }

    pub(crate) fn partitioned_data_mut(&mut self) -> &mut PartitionedTupleData {
        &mut self.partitioned_data
    }

    /// Take ownership of the partitioned data, leaving a fresh empty
    /// collection in its place.
    pub fn take_partitioned_data(&mut self) -> PartitionedTupleData {
        let fresh = PartitionedTupleData::new(
            self.buffer_manager.clone(),
            self.layout.clone(),
            self.radix_bits,
        );
        std::mem::replace(&mut self.partitioned_data, fresh)
    }

    /// Insert a chunk of group and payload values.
    ///
    /// `groups` are the grouping columns, `payload` the aggregate input
    /// columns, and `filter` an optional row selection applied to both.
    pub fn add_chunk(
        &mut self,
        groups: &[Arc<Array>],
        payload: &[Arc<Array>],
        num_rows: usize,
        filter: Option<&SelectionVector>,
    ) -> Result<()> {
        // Materialized selections when a filter is provided.
        let group_storage: Vec<Array>;
        let payload_storage: Vec<Array>;

        let (group_refs, payload_refs, num_rows): (Vec<&Array>, Vec<&Array>, usize) = match filter
        {
            Some(filter) => {
                group_storage = groups
                    .iter()
                    .map(|arr| take(arr, filter))
                    .collect::<Result<_>>()?;
                payload_storage = payload
                    .iter()
                    .map(|arr| take(arr, filter))
                    .collect::<Result<_>>()?;
                (
                    group_storage.iter().collect(),
                    payload_storage.iter().collect(),
                    filter.len(),
                )
            }
            None => (
                groups.iter().map(|arr| arr.as_ref()).collect(),
                payload.iter().map(|arr| arr.as_ref()).collect(),
                num_rows,
            ),
        };

        if num_rows == 0 {
            return Ok(());
        }

        self.insert_buffers.hashes.clear();
        self.insert_buffers.hashes.resize(num_rows, 0);
        build_hashes(&group_refs, &mut self.insert_buffers.hashes)?;

        self.find_or_create_groups(&group_refs, num_rows)?;
        self.update_states(&payload_refs, num_rows)
    }

    /// Combine all rows of `data` into this table, merging states of groups
    /// already present.
    ///
    /// Reports fractional progress into `progress` while walking the source
    /// collection.
    pub fn combine(
        &mut self,
        data: TupleDataCollection,
        progress: Option<&PartitionProgress>,
    ) -> Result<()> {
        let total = data.count();
        if total == 0 {
            return Ok(());
        }

        let layout = self.layout.clone();
        let mut data = data;
        let mut scan_state = TupleDataScanState::default();
        let mut done = 0;

        loop {
            let addresses = data.scan_chunk(&mut scan_state, DEFAULT_TARGET_BATCH_SIZE);
            if addresses.is_empty() {
                break;
            }

            // Materialize group values and hashes from the source rows.
            let (groups, hashes) = {
                let rows: Vec<&[u8]> = addresses
                    .iter()
                    .map(|addr| data.row(addr.block, addr.row))
                    .collect();
                let groups = (0..layout.num_groups())
                    .map(|col| layout.read_group_column(&rows, col))
                    .collect::<Result<Vec<_>>>()?;
                let hashes: Vec<u64> = rows.iter().map(|row| layout.read_hash(row)).collect();
                (groups, hashes)
            };

            self.insert_buffers.hashes.clear();
            self.insert_buffers.hashes.extend(hashes);

            // Unlike the sink path, combining must grow the pointer table to
            // fit every distinct group.
            while self.count + addresses.len() > self.resize_threshold() {
                let new_capacity = self.capacity() * 2;
                self.resize(new_capacity)?;
            }

            let group_refs: Vec<&Array> = groups.iter().collect();
            self.find_or_create_groups(&group_refs, addresses.len())?;

            let allocator = self.aggregate_allocator.clone();
            let target_addresses = &self.insert_buffers.group_addresses;
            let target_data = &mut self.partitioned_data;
            for (agg_idx, aggregate) in layout.aggregates().iter().enumerate() {
                let input_data = aggregate.input_data(&allocator);
                let offset = layout.aggregate_offset(agg_idx);
                let size = aggregate.function.state_size();

                let mut sources = StateAccessor::collection(&mut data, &addresses, offset, size);
                let mut targets =
                    StateAccessor::partitioned(&mut *target_data, target_addresses, offset, size);
                aggregate
                    .function
                    .combine(&input_data, &mut sources, &mut targets)?;
            }

            done += addresses.len();
            if let Some(progress) = progress {
                progress.set(done as f64 / total as f64);
            }
        }

        Ok(())
    }

    fn update_states(&mut self, payload: &[&Array], num_rows: usize) -> Result<()> {
        let layout = self.layout.clone();
        let allocator = self.aggregate_allocator.clone();

        let addresses = &self.insert_buffers.group_addresses;
        let data = &mut self.partitioned_data;

        for (agg_idx, aggregate) in layout.aggregates().iter().enumerate() {
            let inputs: Vec<&Array> = aggregate
                .col_selection
                .iter()
                .zip(payload.iter())
                .filter_map(|(selected, arr)| selected.then_some(*arr))
                .collect();

            let input_data = aggregate.input_data(&allocator);
            let mut states = StateAccessor::partitioned(
                &mut *data,
                addresses,
                layout.aggregate_offset(agg_idx),
                aggregate.function.state_size(),
            );
            aggregate
                .function
                .update(&input_data, &inputs, num_rows, &mut states)?;
        }

        Ok(())
    }

    /// Probe the pointer table for each input row, appending rows for groups
    /// not yet present. Fills `insert_buffers.group_addresses` with the group
    /// row of every input row. Expects `insert_buffers.hashes` to be set.
    fn find_or_create_groups(&mut self, groups: &[&Array], num_rows: usize) -> Result<()> {
        let cap = self.capacity() as u64;
        let layout = self.layout.clone();
        let allocator = self.aggregate_allocator.clone();

        self.insert_buffers
            .group_addresses
            .resize(num_rows, RowAddress::default());

        // Precompute offsets into the table.
        self.insert_buffers.offsets.clear();
        self.insert_buffers
            .offsets
            .extend(self.insert_buffers.hashes.iter().map(|hash| (hash % cap) as usize));

        // Init selection to all rows in input.
        self.insert_buffers.needs_insert.clear();
        self.insert_buffers.needs_insert.append_locations(0..num_rows);

        let mut remaining = num_rows;
        let mut new_groups = 0;

        while remaining > 0 {
            self.insert_buffers.new_group_rows.clear();
            self.insert_buffers.needs_compare.clear();
            self.insert_buffers.not_eq_rows.clear();

            // Figure out where we're putting remaining rows.
            for idx in 0..remaining {
                let row_idx = self.insert_buffers.needs_insert.get_unchecked(idx);
                let hash = self.insert_buffers.hashes[row_idx];
                let offset = &mut self.insert_buffers.offsets[row_idx];

                // Probe.
                let mut iter_count = 0;
                loop {
                    let entry = &mut self.entries[*offset];

                    if entry.is_empty() {
                        // Empty entry, claim it.
                        //
                        // Sets the prefix with a placeholder address, the real
                        // address is filled in when the group row is created.
                        *entry = EntryKey::new(hash, RowAddress::default());
                        self.insert_buffers.new_group_rows.push_location(row_idx);
                        break;
                    }

                    if entry.prefix_matches_hash(hash) {
                        self.insert_buffers.needs_compare.push_location(row_idx);
                        break;
                    }

                    *offset = ((*offset as u64 + 1) % cap) as usize;

                    if iter_count > cap {
                        // We wrapped. The sink keeps the count below the
                        // resize threshold and the combine path resizes, so
                        // every chunk must fit.
                        return Err(SableError::new("Hash table completely full"));
                    }
                    iter_count += 1;
                }
            }

            // Create rows for new groups and point their entries at them.
            if !self.insert_buffers.new_group_rows.is_empty() {
                for row_idx in self.insert_buffers.new_group_rows.iter_locations() {
                    let hash = self.insert_buffers.hashes[row_idx];
                    let addr = self.partitioned_data.allocate_row_for_hash(hash);

                    {
                        let row = self.partitioned_data.row_mut(addr);
                        for (col, group) in groups.iter().enumerate() {
                            layout.write_group_value(row, col, group, row_idx)?;
                        }
                        layout.write_hash(row, hash);
                        layout.initialize_aggregate_states(&allocator, row);
                    }

                    let offset = self.insert_buffers.offsets[row_idx];
                    self.entries[offset] = EntryKey::new(hash, addr);
                    self.insert_buffers.group_addresses[row_idx] = addr;
                    new_groups += 1;
                }
            }

            // Compare rows whose hash prefix matched an occupied entry.
            self.insert_buffers.needs_insert.clear();
            if !self.insert_buffers.needs_compare.is_empty() {
                for row_idx in self.insert_buffers.needs_compare.iter_locations() {
                    let offset = self.insert_buffers.offsets[row_idx];
                    let addr = self.entries[offset].key;
                    self.insert_buffers.group_addresses[row_idx] = addr;

                    let row = self.partitioned_data.row(addr);
                    let hash = self.insert_buffers.hashes[row_idx];
                    let eq = layout.read_hash(row) == hash
                        && groups
                            .iter()
                            .enumerate()
                            .all(|(col, group)| layout.group_value_eq(row, col, group, row_idx));

                    if !eq {
                        self.insert_buffers.not_eq_rows.push_location(row_idx);
                    }
                }
            }

            // Every row that failed the equality check moves to the next entry
            // and goes through the loop again.
            for row_idx in self.insert_buffers.not_eq_rows.iter_locations() {
                let offset = &mut self.insert_buffers.offsets[row_idx];
                *offset = ((*offset as u64 + 1) % cap) as usize;
            }

            std::mem::swap(
                &mut self.insert_buffers.needs_insert,
                &mut self.insert_buffers.not_eq_rows,
            );

            remaining = self.insert_buffers.needs_insert.len();
        }

        self.count += new_groups;

        Ok(())
    }

    /// Grow the pointer table, rebuilding it from the row data.
    ///
    /// Only valid when the pointer table covers every row in the collection,
    /// which holds on the combine path (the sink clears the table instead of
    /// resizing).
    fn resize(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity < self.entries.len() {
            return Err(SableError::new("Cannot reduce hash table capacity"));
        }

        let layout = self.layout.clone();
        let mut entries = vec![EntryKey::default(); new_capacity];
        let cap = new_capacity as u64;

        for addr in self.partitioned_data.row_addresses() {
            let hash = layout.read_hash(self.partitioned_data.row(addr));
            let mut offset = (hash % cap) as usize;
            while !entries[offset].is_empty() {
                offset = ((offset as u64 + 1) % cap) as usize;
            }
            entries[offset] = EntryKey::new(hash, addr);
        }

        self.entries = entries;

        Ok(())
    }
}

impl std::fmt::Debug for GroupedAggregateHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedAggregateHashTable")
            .field("capacity", &self.capacity())
            .field("count", &self.count)
            .field("radix_bits", &self.radix_bits)
            .finish_non_exhaustive()
    }
}
