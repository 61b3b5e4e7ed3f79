pub mod hash_aggregate;
pub mod util;

use std::fmt::Debug;
use std::task::Context;

use sable_error::Result;
use sable_vector::batch::Batch;

use self::hash_aggregate::{HashAggregateOperatorState, HashAggregatePartitionState};

/// States local to a partition within a single operator.
#[derive(Debug)]
pub enum PartitionState {
    HashAggregate(HashAggregatePartitionState),
    None,
}

/// A global state across all partitions in an operator.
#[derive(Debug)]
pub enum OperatorState {
    HashAggregate(HashAggregateOperatorState),
    None,
}

/// Result of a push to an operator.
#[derive(Debug)]
pub enum PollPush {
    /// Batch was successfully pushed.
    Pushed,

    /// Batch was consumed, and the operator needs more input before producing
    /// output.
    NeedsMore,

    /// Batch could not be processed right now.
    ///
    /// A waker will be registered for a later wakeup. This same batch should
    /// be pushed at that time.
    Pending(Batch),

    /// This operator requires no more input.
    Break,
}

/// Result of finalizing pushes to an operator partition.
#[derive(Debug)]
pub enum PollFinalize {
    Finalized,
    Pending,
}

/// Result of a pull from an operator.
#[derive(Debug)]
pub enum PollPull {
    /// Successfully received a data batch.
    Batch(Batch),

    /// A batch could not be retrieved right now.
    ///
    /// A waker will be registered for a later wakeup to try to pull the next
    /// batch.
    Pending,

    /// The operator has been exhausted for this partition.
    Exhausted,
}

pub trait PhysicalOperator: Sync + Send + Debug {
    /// Try to push a batch for this partition.
    fn poll_push(
        &self,
        cx: &mut Context,
        partition_state: &mut PartitionState,
        operator_state: &OperatorState,
        batch: Batch,
    ) -> Result<PollPush>;

    /// Finalize pushing to a partition.
    ///
    /// This indicates the operator will receive no more input for the given
    /// partition.
    fn poll_finalize_push(
        &self,
        cx: &mut Context,
        partition_state: &mut PartitionState,
        operator_state: &OperatorState,
    ) -> Result<PollFinalize>;

    /// Try to pull a batch for this partition.
    fn poll_pull(
        &self,
        cx: &mut Context,
        partition_state: &mut PartitionState,
        operator_state: &OperatorState,
    ) -> Result<PollPull>;
}
