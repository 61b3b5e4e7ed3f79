use std::ops::AddAssign;
use std::sync::Arc;

use sable_error::{Result, SableError};
use sable_vector::datatype::DataType;

use super::macros::generate_unary_primitive_aggregate;
use super::{AggregateFunction, AggregateState, FixedSizeState};
use crate::row::layout::PrimitiveNative;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sum;

impl Sum {
    pub fn specialize(&self, input: &DataType) -> Result<Arc<dyn AggregateFunction>> {
        Ok(match input {
            DataType::Int64 => Arc::new(SumInt64),
            DataType::Float64 => Arc::new(SumFloat64),
            other => return Err(SableError::new(format!("no sum implementation for {other}"))),
        })
    }
}

generate_unary_primitive_aggregate!(SumInt64, "sum", Int64, Int64, SumState<i64>);
generate_unary_primitive_aggregate!(SumFloat64, "sum", Float64, Float64, SumState<f64>);

/// Sum of all non-null inputs. Finalizes to null when no input was seen.
#[derive(Debug, Default)]
pub struct SumState<T> {
    sum: T,
    valid: bool,
}

impl<T: PrimitiveNative> FixedSizeState for SumState<T> {
    fn state_size() -> usize {
        T::WIDTH + 1
    }

    fn load(bytes: &[u8]) -> Self {
        SumState {
            sum: T::read_from(bytes),
            valid: bytes[T::WIDTH] != 0,
        }
    }

    fn store(&self, bytes: &mut [u8]) {
        self.sum.write_to(bytes);
        bytes[T::WIDTH] = self.valid as u8;
    }
}

impl<T: PrimitiveNative + AddAssign> AggregateState<T, T> for SumState<T> {
    fn update(&mut self, input: T) -> Result<()> {
        self.sum += input;
        self.valid = true;
        Ok(())
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        if other.valid {
            self.sum += other.sum;
            self.valid = true;
        }
        Ok(())
    }

    fn finalize(self) -> Result<Option<T>> {
        Ok(self.valid.then_some(self.sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip() {
        let mut bytes = vec![0u8; SumState::<i64>::state_size()];
        let mut state = SumState::<i64>::default();
        state.update(4).unwrap();
        state.update(5).unwrap();
        state.store(&mut bytes);

        let state = SumState::<i64>::load(&bytes);
        assert_eq!(Some(9), state.finalize().unwrap());
    }

    #[test]
    fn empty_sum_is_null() {
        let state = SumState::<i64>::default();
        assert_eq!(None, state.finalize().unwrap());
    }

    #[test]
    fn merge_ignores_empty_source() {
        let mut target = SumState::<i64>::default();
        target.update(3).unwrap();
        target.merge(SumState::default()).unwrap();
        assert_eq!(Some(3), target.finalize().unwrap());
    }
}
