use std::sync::Arc;

use sable_error::{Result, SableError};

use crate::row::layout::RowLayout;
use crate::row::RowAddress;
use crate::storage::buffer_manager::{BufferManager, RowBlock};

/// What to do with block pins while scanning a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleDataPinProperties {
    /// Keep blocks pinned, the collection will be read again.
    KeepPinned,
    /// Unpin blocks once the scan moves past them, data stays alive.
    UnpinAfterDone,
    /// Destroy row state while scanning, the collection is read exactly once.
    DestroyAfterDone,
}

/// Scan position within a collection.
#[derive(Debug, Default, Clone)]
pub struct TupleDataScanState {
    block_idx: usize,
    row_idx: usize,
}

/// Append-only row container backed by pinnable blocks.
#[derive(Debug)]
pub struct TupleDataCollection {
    layout: Arc<RowLayout>,
    buffer_manager: Arc<BufferManager>,
    blocks: Vec<RowBlock>,
    count: usize,
    rows_per_block: usize,
}

impl TupleDataCollection {
    pub fn new(buffer_manager: Arc<BufferManager>, layout: Arc<RowLayout>) -> Self {
        let rows_per_block = std::cmp::max(1, buffer_manager.block_size() / layout.row_width());
        TupleDataCollection {
            layout,
            buffer_manager,
            blocks: Vec::new(),
            count: 0,
            rows_per_block,
        }
    }

    pub fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.blocks.iter().map(|block| block.capacity_bytes()).sum()
    }

    /// Claim space for a new row, returning its (block, row) position.
    pub fn allocate_row(&mut self) -> (u32, u32) {
        let row_width = self.layout.row_width();

        if let Some(block) = self.blocks.last_mut() {
            if let Some(row_idx) = block.allocate_row(row_width) {
                self.count += 1;
                return ((self.blocks.len() - 1) as u32, row_idx as u32);
            }
        }

        let mut block = self
            .buffer_manager
            .allocate_block(self.rows_per_block * row_width);
        let row_idx = block
            .allocate_row(row_width)
            .expect("freshly allocated block to have row capacity");
        self.blocks.push(block);
        self.count += 1;

        ((self.blocks.len() - 1) as u32, row_idx as u32)
    }

    pub fn row(&self, block: u32, row: u32) -> &[u8] {
        self.blocks[block as usize].row(self.layout.row_width(), row as usize)
    }

    pub fn row_mut(&mut self, block: u32, row: u32) -> &mut [u8] {
        self.blocks[block as usize].row_mut(self.layout.row_width(), row as usize)
    }

    /// Move all blocks from `other` into self.
    ///
    /// Row addresses into `other` are invalidated. Addresses into self remain
    /// valid.
    pub fn combine(&mut self, mut other: TupleDataCollection) -> Result<()> {
        if self.layout.row_width() != other.layout.row_width() {
            return Err(SableError::new(
                "cannot combine tuple data collections with different row layouts",
            ));
        }

        self.blocks.append(&mut other.blocks);
        self.count += other.count;
        other.count = 0;

        Ok(())
    }

    /// Unpin all blocks, allowing the buffer manager to spill them.
    pub fn unpin(&mut self) {
        for block in &mut self.blocks {
            block.unpin();
        }
    }

    /// Drop all blocks and reset the count. Does not run any aggregate state
    /// destructors.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.count = 0;
    }

    /// Get the addresses of the next up-to-`max_rows` rows.
    ///
    /// Returns an empty vector once the scan is exhausted.
    pub fn scan_chunk(&self, state: &mut TupleDataScanState, max_rows: usize) -> Vec<RowAddress> {
        let mut addresses = Vec::new();

        while addresses.len() < max_rows && state.block_idx < self.blocks.len() {
            let block = &self.blocks[state.block_idx];
            if state.row_idx >= block.row_count() {
                state.block_idx += 1;
                state.row_idx = 0;
                continue;
            }

            addresses.push(RowAddress {
                partition: 0,
                block: state.block_idx as u32,
                row: state.row_idx as u32,
            });
            state.row_idx += 1;
        }

        addresses
    }

    /// Addresses of every row in the collection.
    pub fn addresses(&self) -> impl Iterator<Item = RowAddress> + '_ {
        self.blocks.iter().enumerate().flat_map(|(block_idx, block)| {
            (0..block.row_count()).map(move |row_idx| RowAddress {
                partition: 0,
                block: block_idx as u32,
                row: row_idx as u32,
            })
        })
    }
}
