pub mod count;
pub mod minmax;
pub mod sum;

mod macros;

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use sable_error::Result;
use sable_vector::array::Array;
use sable_vector::bitmap::Bitmap;
use sable_vector::datatype::DataType;

use crate::row::partitioned::PartitionedTupleData;
use crate::row::tuple_data::TupleDataCollection;
use crate::row::RowAddress;
use crate::storage::arena::ArenaAllocator;

/// Function-specific binding information produced when planning an aggregate.
pub trait AggregateBindData: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Data available to every aggregate function call.
#[derive(Debug)]
pub struct AggregateInputData<'a> {
    pub bind_data: Option<&'a dyn AggregateBindData>,
    pub allocator: &'a ArenaAllocator,
}

/// An aggregate function operating on raw fixed-width state bytes embedded in
/// row storage.
///
/// `update` folds input rows into states, `combine` folds source states into
/// target states, `finalize` converts states into output values. Functions
/// that hold resources outside the state bytes report `has_destructor` and get
/// a `destroy` call exactly once per state.
pub trait AggregateFunction: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn return_type(&self) -> DataType;

    /// Size in bytes of a single aggregate state.
    fn state_size(&self) -> usize;

    /// Initialize a zeroed state buffer.
    fn initialize(&self, input: &AggregateInputData, state: &mut [u8]);

    /// Update states with input rows. `states` maps input row `i` to the state
    /// of the group that row belongs to.
    fn update(
        &self,
        input: &AggregateInputData,
        inputs: &[&Array],
        num_rows: usize,
        states: &mut StateAccessor,
    ) -> Result<()>;

    /// Merge source state `i` into target state `i`. Source states are
    /// consumed and must not be finalized or destroyed afterwards.
    fn combine(
        &self,
        input: &AggregateInputData,
        sources: &mut StateAccessor,
        targets: &mut StateAccessor,
    ) -> Result<()>;

    /// Convert states into an array of output values.
    fn finalize(&self, input: &AggregateInputData, states: &mut StateAccessor) -> Result<Array>;

    fn has_destructor(&self) -> bool {
        false
    }

    fn destroy(&self, _input: &AggregateInputData, _states: &mut StateAccessor) -> Result<()> {
        Ok(())
    }
}

/// A planned aggregate bound to its payload columns.
#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub function: Arc<dyn AggregateFunction>,
    pub bind_data: Option<Arc<dyn AggregateBindData>>,

    /// Bitmap selecting this aggregate's input columns from the payload chunk.
    ///
    /// Payload columns are shared between all aggregates of an operator, this
    /// narrows them down to the ones this aggregate reads.
    pub col_selection: Bitmap,
}

impl AggregateExpr {
    pub fn new(function: Arc<dyn AggregateFunction>, col_selection: Bitmap) -> Self {
        AggregateExpr {
            function,
            bind_data: None,
            col_selection,
        }
    }

    pub fn with_bind_data(mut self, bind_data: Arc<dyn AggregateBindData>) -> Self {
        self.bind_data = Some(bind_data);
        self
    }

    pub fn input_data<'a>(&'a self, allocator: &'a ArenaAllocator) -> AggregateInputData<'a> {
        AggregateInputData {
            bind_data: self.bind_data.as_deref(),
            allocator,
        }
    }
}

/// Row storage a state accessor reads states from.
#[derive(Debug)]
enum StateStorage<'a> {
    Partitioned(&'a mut PartitionedTupleData),
    Collection(&'a mut TupleDataCollection),
}

/// Accessor mapping a dense index to the state bytes of a row.
///
/// Index `i` resolves through `addresses[i]`, so the same accessor shape works
/// for updates (input row -> group state) and combines (source row -> target
/// state).
#[derive(Debug)]
pub struct StateAccessor<'a> {
    storage: StateStorage<'a>,
    addresses: &'a [RowAddress],
    state_offset: usize,
    state_size: usize,
}

impl<'a> StateAccessor<'a> {
    pub fn partitioned(
        data: &'a mut PartitionedTupleData,
        addresses: &'a [RowAddress],
        state_offset: usize,
        state_size: usize,
    ) -> Self {
        StateAccessor {
            storage: StateStorage::Partitioned(data),
            addresses,
            state_offset,
            state_size,
        }
    }

    pub fn collection(
        data: &'a mut TupleDataCollection,
        addresses: &'a [RowAddress],
        state_offset: usize,
        state_size: usize,
    ) -> Self {
        StateAccessor {
            storage: StateStorage::Collection(data),
            addresses,
            state_offset,
            state_size,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// State bytes for index `idx`.
    pub fn state_mut(&mut self, idx: usize) -> &mut [u8] {
        let addr = self.addresses[idx];
        let row = match &mut self.storage {
            StateStorage::Partitioned(data) => data.row_mut(addr),
            StateStorage::Collection(data) => data.row_mut(addr.block, addr.row),
        };
        &mut row[self.state_offset..self.state_offset + self.state_size]
    }
}

/// A state that can be loaded from and stored to a fixed-width byte span.
pub trait FixedSizeState: Default + Debug {
    fn state_size() -> usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(&self, bytes: &mut [u8]);
}

/// Logic of a single aggregate state over typed input and output.
pub trait AggregateState<I, O>: FixedSizeState {
    fn update(&mut self, input: I) -> Result<()>;

    fn merge(&mut self, other: Self) -> Result<()>;

    /// Produce the output value, `None` meaning null.
    fn finalize(self) -> Result<Option<O>>;
}
