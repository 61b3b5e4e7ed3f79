use sable_error::{Result, SableError};
use sable_vector::array::{Array, Int64Array};
use sable_vector::datatype::DataType;

use super::{
    AggregateFunction, AggregateInputData, AggregateState, FixedSizeState, StateAccessor,
};
use crate::row::layout::PrimitiveNative;

/// `count(col)`, counting non-null inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountNonNull;

/// `count(*)`, counting rows. Takes no inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountStar;

#[derive(Debug, Default)]
pub struct CountState {
    count: i64,
}

impl FixedSizeState for CountState {
    fn state_size() -> usize {
        i64::WIDTH
    }

    fn load(bytes: &[u8]) -> Self {
        CountState {
            count: i64::read_from(bytes),
        }
    }

    fn store(&self, bytes: &mut [u8]) {
        self.count.write_to(bytes)
    }
}

impl AggregateState<(), i64> for CountState {
    fn update(&mut self, _input: ()) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        self.count += other.count;
        Ok(())
    }

    fn finalize(self) -> Result<Option<i64>> {
        Ok(Some(self.count))
    }
}

fn count_rows(
    num_rows: usize,
    states: &mut StateAccessor,
    counts_row: impl Fn(usize) -> bool,
) -> Result<()> {
    for row_idx in 0..num_rows {
        if !counts_row(row_idx) {
            continue;
        }
        let bytes = states.state_mut(row_idx);
        let mut state = CountState::load(bytes);
        state.update(())?;
        state.store(bytes);
    }
    Ok(())
}

fn combine_counts(sources: &mut StateAccessor, targets: &mut StateAccessor) -> Result<()> {
    debug_assert_eq!(sources.len(), targets.len());
    for idx in 0..sources.len() {
        let source = CountState::load(sources.state_mut(idx));
        let bytes = targets.state_mut(idx);
        let mut target = CountState::load(bytes);
        target.merge(source)?;
        target.store(bytes);
    }
    Ok(())
}

fn finalize_counts(states: &mut StateAccessor) -> Result<Array> {
    let mut values = Vec::with_capacity(states.len());
    for idx in 0..states.len() {
        values.push(CountState::load(states.state_mut(idx)).count);
    }
    Ok(Array::Int64(Int64Array::from_iter(values)))
}

impl AggregateFunction for CountNonNull {
    fn name(&self) -> &'static str {
        "count"
    }

    fn return_type(&self) -> DataType {
        DataType::Int64
    }

    fn state_size(&self) -> usize {
        CountState::state_size()
    }

    fn initialize(&self, _input: &AggregateInputData, state: &mut [u8]) {
        CountState::default().store(state)
    }

    fn update(
        &self,
        _input: &AggregateInputData,
        inputs: &[&Array],
        num_rows: usize,
        states: &mut StateAccessor,
    ) -> Result<()> {
        let arr = match inputs.first() {
            Some(arr) => *arr,
            None => return Err(SableError::new("count expects one input column")),
        };
        count_rows(num_rows, states, |row_idx| arr.is_valid(row_idx))
    }

    fn combine(
        &self,
        _input: &AggregateInputData,
        sources: &mut StateAccessor,
        targets: &mut StateAccessor,
    ) -> Result<()> {
        combine_counts(sources, targets)
    }

    fn finalize(&self, _input: &AggregateInputData, states: &mut StateAccessor) -> Result<Array> {
        finalize_counts(states)
    }
}

impl AggregateFunction for CountStar {
    fn name(&self) -> &'static str {
        "count_star"
    }

    fn return_type(&self) -> DataType {
        DataType::Int64
    }

    fn state_size(&self) -> usize {
        CountState::state_size()
    }

    fn initialize(&self, _input: &AggregateInputData, state: &mut [u8]) {
        CountState::default().store(state)
    }

    fn update(
        &self,
        _input: &AggregateInputData,
        _inputs: &[&Array],
        num_rows: usize,
        states: &mut StateAccessor,
    ) -> Result<()> {
        count_rows(num_rows, states, |_| true)
    }

    fn combine(
        &self,
        _input: &AggregateInputData,
        sources: &mut StateAccessor,
        targets: &mut StateAccessor,
    ) -> Result<()> {
        combine_counts(sources, targets)
    }

    fn finalize(&self, _input: &AggregateInputData, states: &mut StateAccessor) -> Result<Array> {
        finalize_counts(states)
    }
}
