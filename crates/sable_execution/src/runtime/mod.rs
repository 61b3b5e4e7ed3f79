use std::sync::Arc;

use sable_error::Result;

use crate::scheduler::Scheduler;
use crate::storage::buffer_manager::{BufferManager, DEFAULT_BLOCK_SIZE};
use crate::storage::temporary_memory::TemporaryMemoryManager;

/// Shared services handed to operators when creating execution states.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub buffer_manager: Arc<BufferManager>,
    pub temporary_memory: Arc<TemporaryMemoryManager>,
    pub scheduler: Arc<Scheduler>,
}

impl EngineContext {
    pub fn new(
        buffer_manager: Arc<BufferManager>,
        temporary_memory: Arc<TemporaryMemoryManager>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        EngineContext {
            buffer_manager,
            temporary_memory,
            scheduler,
        }
    }

    /// Create a context with the given thread count and memory limit, using
    /// the default block size.
    pub fn try_new(num_threads: usize, memory_limit: usize) -> Result<Self> {
        Ok(EngineContext {
            buffer_manager: Arc::new(BufferManager::new(DEFAULT_BLOCK_SIZE, memory_limit)),
            temporary_memory: Arc::new(TemporaryMemoryManager::new(memory_limit)),
            scheduler: Arc::new(Scheduler::try_new(num_threads)?),
        })
    }
}
