pub mod hash;

/// Target row count for batches produced and consumed by operators.
pub const DEFAULT_TARGET_BATCH_SIZE: usize = 2048;
