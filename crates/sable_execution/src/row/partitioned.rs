use std::sync::Arc;

use sable_error::{Result, SableError};

use crate::row::layout::RowLayout;
use crate::row::radix::{partition_count, partition_for_hash};
use crate::row::tuple_data::TupleDataCollection;
use crate::row::RowAddress;
use crate::storage::buffer_manager::BufferManager;

/// Row data split into `2^radix_bits` partitions by the top bits of the row
/// hash.
#[derive(Debug)]
pub struct PartitionedTupleData {
    layout: Arc<RowLayout>,
    buffer_manager: Arc<BufferManager>,
    radix_bits: usize,
    partitions: Vec<TupleDataCollection>,
}

impl PartitionedTupleData {
    pub fn new(
        buffer_manager: Arc<BufferManager>,
        layout: Arc<RowLayout>,
        radix_bits: usize,
    ) -> Self {
        let partitions = (0..partition_count(radix_bits))
            .map(|_| TupleDataCollection::new(buffer_manager.clone(), layout.clone()))
            .collect();

        PartitionedTupleData {
            layout,
            buffer_manager,
            radix_bits,
            partitions,
        }
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    pub fn radix_bits(&self) -> usize {
        self.radix_bits
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> &[TupleDataCollection] {
        &self.partitions
    }

    pub fn into_partitions(self) -> Vec<TupleDataCollection> {
        self.partitions
    }

    pub fn count(&self) -> usize {
        self.partitions.iter().map(|p| p.count()).sum()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.partitions.iter().map(|p| p.size_in_bytes()).sum()
    }

    /// Claim space for a row in the partition selected by `hash`.
    pub fn allocate_row_for_hash(&mut self, hash: u64) -> RowAddress {
        let partition = partition_for_hash(hash, self.radix_bits);
        let (block, row) = self.partitions[partition].allocate_row();
        RowAddress {
            partition: partition as u32,
            block,
            row,
        }
    }

    pub fn row(&self, addr: RowAddress) -> &[u8] {
        self.partitions[addr.partition as usize].row(addr.block, addr.row)
    }

    pub fn row_mut(&mut self, addr: RowAddress) -> &mut [u8] {
        self.partitions[addr.partition as usize].row_mut(addr.block, addr.row)
    }

    /// Addresses of every row across all partitions.
    pub fn row_addresses(&self) -> impl Iterator<Item = RowAddress> + '_ {
        self.partitions
            .iter()
            .enumerate()
            .flat_map(|(partition_idx, partition)| {
                partition.addresses().map(move |addr| RowAddress {
                    partition: partition_idx as u32,
                    ..addr
                })
            })
    }

    /// Move all data from `other` into self, partition by partition.
    pub fn combine(&mut self, other: PartitionedTupleData) -> Result<()> {
        if self.radix_bits != other.radix_bits {
            return Err(SableError::new(format!(
                "cannot combine partitioned data with radix bits {} into {}",
                other.radix_bits, self.radix_bits
            )));
        }

        for (target, source) in self.partitions.iter_mut().zip(other.partitions) {
            target.combine(source)?;
        }

        Ok(())
    }

    /// Redistribute all rows into `target`, which must have at least as many
    /// radix bits. Rows are re-bucketed on the hash stored in the row.
    pub fn repartition(self, target: &mut PartitionedTupleData) -> Result<()> {
        if target.radix_bits < self.radix_bits {
            return Err(SableError::new(format!(
                "cannot repartition {} radix bits down to {}",
                self.radix_bits, target.radix_bits
            )));
        }

        let layout = self.layout.clone();
        for partition in self.partitions {
            for addr in partition.addresses() {
                let hash = layout.read_hash(partition.row(addr.block, addr.row));
                let target_addr = target.allocate_row_for_hash(hash);
                target
                    .row_mut(target_addr)
                    .copy_from_slice(partition.row(addr.block, addr.row));
            }
        }

        Ok(())
    }

    /// Unpin the blocks of every partition.
    pub fn unpin(&mut self) {
        for partition in &mut self.partitions {
            partition.unpin();
        }
    }
}
