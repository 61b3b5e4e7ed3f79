use std::sync::Arc;

use sable_error::{Result, SableError};
use sable_vector::datatype::DataType;

use super::macros::generate_unary_primitive_aggregate;
use super::{AggregateFunction, AggregateState, FixedSizeState};
use crate::row::layout::PrimitiveNative;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Min;

impl Min {
    pub fn specialize(&self, input: &DataType) -> Result<Arc<dyn AggregateFunction>> {
        Ok(match input {
            DataType::Int64 => Arc::new(MinInt64),
            DataType::Float64 => Arc::new(MinFloat64),
            other => return Err(SableError::new(format!("no min implementation for {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Max;

impl Max {
    pub fn specialize(&self, input: &DataType) -> Result<Arc<dyn AggregateFunction>> {
        Ok(match input {
            DataType::Int64 => Arc::new(MaxInt64),
            DataType::Float64 => Arc::new(MaxFloat64),
            other => return Err(SableError::new(format!("no max implementation for {other}"))),
        })
    }
}

generate_unary_primitive_aggregate!(MinInt64, "min", Int64, Int64, MinState<i64>);
generate_unary_primitive_aggregate!(MinFloat64, "min", Float64, Float64, MinState<f64>);
generate_unary_primitive_aggregate!(MaxInt64, "max", Int64, Int64, MaxState<i64>);
generate_unary_primitive_aggregate!(MaxFloat64, "max", Float64, Float64, MaxState<f64>);

#[derive(Debug, Default)]
pub struct MinState<T> {
    value: T,
    valid: bool,
}

#[derive(Debug, Default)]
pub struct MaxState<T> {
    value: T,
    valid: bool,
}

macro_rules! impl_extremum_state {
    ($state:ident, $keep:expr) => {
        impl<T: PrimitiveNative> FixedSizeState for $state<T> {
            fn state_size() -> usize {
                T::WIDTH + 1
            }

            fn load(bytes: &[u8]) -> Self {
                $state {
                    value: T::read_from(bytes),
                    valid: bytes[T::WIDTH] != 0,
                }
            }

            fn store(&self, bytes: &mut [u8]) {
                self.value.write_to(bytes);
                bytes[T::WIDTH] = self.valid as u8;
            }
        }

        impl<T: PrimitiveNative + PartialOrd> AggregateState<T, T> for $state<T> {
            fn update(&mut self, input: T) -> Result<()> {
                if !self.valid || $keep(&input, &self.value) {
                    self.value = input;
                    self.valid = true;
                }
                Ok(())
            }

            fn merge(&mut self, other: Self) -> Result<()> {
                if other.valid {
                    self.update(other.value)?;
                }
                Ok(())
            }

            fn finalize(self) -> Result<Option<T>> {
                Ok(self.valid.then_some(self.value))
            }
        }
    };
}

impl_extremum_state!(MinState, |new: &T, old: &T| new < old);
impl_extremum_state!(MaxState, |new: &T, old: &T| new > old);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_and_max() {
        let mut min = MinState::<i64>::default();
        let mut max = MaxState::<i64>::default();
        for v in [3, -1, 7] {
            min.update(v).unwrap();
            max.update(v).unwrap();
        }
        assert_eq!(Some(-1), min.finalize().unwrap());
        assert_eq!(Some(7), max.finalize().unwrap());
    }

    #[test]
    fn empty_is_null() {
        assert_eq!(None, MinState::<f64>::default().finalize().unwrap());
        assert_eq!(None, MaxState::<f64>::default().finalize().unwrap());
    }
}
