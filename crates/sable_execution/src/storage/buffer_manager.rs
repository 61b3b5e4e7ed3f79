use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default size of a row block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

/// Hands out pinnable blocks of memory and tracks how much has been allocated.
///
/// Blocks that get unpinned are eligible for spilling. This manager keeps
/// everything resident and only does the accounting, the engine never touches
/// block contents without going through a block it owns.
#[derive(Debug)]
pub struct BufferManager {
    block_size: usize,
    memory_limit: usize,
    allocated: AtomicUsize,
    unpinned: AtomicUsize,
}

impl BufferManager {
    pub fn new(block_size: usize, memory_limit: usize) -> Self {
        BufferManager {
            block_size,
            memory_limit,
            allocated: AtomicUsize::new(0),
            unpinned: AtomicUsize::new(0),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Total bytes currently allocated across all live blocks.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Bytes in blocks that have been unpinned and could be spilled.
    pub fn unpinned_bytes(&self) -> usize {
        self.unpinned.load(Ordering::Relaxed)
    }

    /// Allocate a new zeroed block of `bytes` bytes.
    pub fn allocate_block(self: &Arc<Self>, bytes: usize) -> RowBlock {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
        RowBlock {
            manager: self.clone(),
            data: vec![0; bytes],
            row_count: 0,
            pinned: true,
        }
    }

    fn release(&self, bytes: usize, pinned: bool) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
        if !pinned {
            self.unpinned.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    fn note_unpinned(&self, bytes: usize) {
        self.unpinned.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// A fixed-size block of row data.
#[derive(Debug)]
pub struct RowBlock {
    manager: Arc<BufferManager>,
    data: Vec<u8>,
    row_count: usize,
    pinned: bool,
}

impl RowBlock {
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn capacity_bytes(&self) -> usize {
        self.data.len()
    }

    /// Claim the next row slot, returning its index within the block. Returns
    /// None if the block is full.
    pub fn allocate_row(&mut self, row_width: usize) -> Option<usize> {
        if (self.row_count + 1) * row_width > self.data.len() {
            return None;
        }
        self.row_count += 1;
        Some(self.row_count - 1)
    }

    pub fn row(&self, row_width: usize, idx: usize) -> &[u8] {
        let offset = idx * row_width;
        &self.data[offset..offset + row_width]
    }

    pub fn row_mut(&mut self, row_width: usize, idx: usize) -> &mut [u8] {
        let offset = idx * row_width;
        &mut self.data[offset..offset + row_width]
    }

    /// Release the pin on this block, making it eligible for spilling.
    pub fn unpin(&mut self) {
        if self.pinned {
            self.pinned = false;
            self.manager.note_unpinned(self.data.len());
        }
    }

    pub fn pin(&mut self) {
        if !self.pinned {
            self.pinned = true;
            self.manager
                .unpinned
                .fetch_sub(self.data.len(), Ordering::Relaxed);
        }
    }
}

impl Drop for RowBlock {
    fn drop(&mut self) {
        self.manager.release(self.data.len(), self.pinned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_accounting() {
        let manager = Arc::new(BufferManager::new(1024, 1 << 20));

        let block = manager.allocate_block(1024);
        assert_eq!(1024, manager.allocated_bytes());

        std::mem::drop(block);
        assert_eq!(0, manager.allocated_bytes());
    }

    #[test]
    fn unpin_accounting() {
        let manager = Arc::new(BufferManager::new(1024, 1 << 20));

        let mut block = manager.allocate_block(1024);
        block.unpin();
        assert_eq!(1024, manager.unpinned_bytes());

        std::mem::drop(block);
        assert_eq!(0, manager.unpinned_bytes());
        assert_eq!(0, manager.allocated_bytes());
    }

    #[test]
    fn rows_fill_block() {
        let manager = Arc::new(BufferManager::new(64, 1 << 20));
        let mut block = manager.allocate_block(64);

        assert_eq!(Some(0), block.allocate_row(32));
        assert_eq!(Some(1), block.allocate_row(32));
        assert_eq!(None, block.allocate_row(32));
    }
}
