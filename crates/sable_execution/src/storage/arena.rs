use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

const ARENA_CHUNK_SIZE: usize = 32 * 1024;

/// Bump allocator backing variable-size aggregate state.
///
/// Allocations are never freed individually, everything lives until the arena
/// is dropped. The sink keeps a handle per worker in its stored allocator list
/// so state memory outlives the worker that produced it.
#[derive(Debug, Default)]
pub struct ArenaAllocator {
    inner: Mutex<ArenaInner>,
}

#[derive(Debug, Default)]
struct ArenaInner {
    chunks: Vec<Box<[u8]>>,
    offset: usize,
    allocated: usize,
}

/// Handle to an allocation within an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlice {
    chunk: usize,
    offset: usize,
    len: usize,
}

impl ArenaAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` zeroed bytes, returning a handle to the allocation.
    pub fn allocate(&self, len: usize) -> ArenaSlice {
        let mut inner = self.inner.lock();

        let needs_chunk = match inner.chunks.last() {
            Some(chunk) => inner.offset + len > chunk.len(),
            None => true,
        };
        if needs_chunk {
            let size = std::cmp::max(len, ARENA_CHUNK_SIZE);
            inner.chunks.push(vec![0; size].into_boxed_slice());
            inner.offset = 0;
        }

        let slice = ArenaSlice {
            chunk: inner.chunks.len() - 1,
            offset: inner.offset,
            len,
        };
        inner.offset += len;
        inner.allocated += len;

        slice
    }

    /// Get mutable access to a previously allocated slice.
    pub fn slice_mut(&self, slice: ArenaSlice) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner.lock(), |inner| {
            &mut inner.chunks[slice.chunk][slice.offset..slice.offset + slice.len]
        })
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_stable() {
        let arena = ArenaAllocator::new();

        let a = arena.allocate(8);
        let b = arena.allocate(8);

        arena.slice_mut(a).copy_from_slice(&1u64.to_ne_bytes());
        arena.slice_mut(b).copy_from_slice(&2u64.to_ne_bytes());

        assert_eq!(&1u64.to_ne_bytes()[..], &arena.slice_mut(a)[..]);
        assert_eq!(16, arena.allocated_bytes());
    }

    #[test]
    fn oversized_allocation_gets_own_chunk() {
        let arena = ArenaAllocator::new();
        let slice = arena.allocate(ARENA_CHUNK_SIZE * 2);
        assert_eq!(ARENA_CHUNK_SIZE * 2, arena.slice_mut(slice).len());
    }
}
