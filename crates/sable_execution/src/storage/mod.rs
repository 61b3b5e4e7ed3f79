pub mod arena;
pub mod buffer_manager;
pub mod temporary_memory;
