/// Generate an `AggregateFunction` impl for a unary aggregate over a primitive
/// input array, with state logic provided by an `AggregateState` type.
macro_rules! generate_unary_primitive_aggregate {
    ($name:ident, $fn_name:expr, $input_variant:ident, $output_variant:ident, $state:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl crate::functions::aggregate::AggregateFunction for $name {
            fn name(&self) -> &'static str {
                $fn_name
            }

            fn return_type(&self) -> sable_vector::datatype::DataType {
                sable_vector::datatype::DataType::$output_variant
            }

            fn state_size(&self) -> usize {
                <$state as crate::functions::aggregate::FixedSizeState>::state_size()
            }

            fn initialize(
                &self,
                _input: &crate::functions::aggregate::AggregateInputData,
                state: &mut [u8],
            ) {
                use crate::functions::aggregate::FixedSizeState;
                <$state>::default().store(state)
            }

            fn update(
                &self,
                _input: &crate::functions::aggregate::AggregateInputData,
                inputs: &[&sable_vector::array::Array],
                num_rows: usize,
                states: &mut crate::functions::aggregate::StateAccessor,
            ) -> sable_error::Result<()> {
                use crate::functions::aggregate::{AggregateState, FixedSizeState};

                let arr = match inputs.first() {
                    Some(sable_vector::array::Array::$input_variant(arr)) => arr,
                    other => {
                        return Err(sable_error::SableError::new(format!(
                            "unexpected input for {}: {other:?}",
                            $fn_name
                        )))
                    }
                };

                for row_idx in 0..num_rows {
                    if !arr.is_valid(row_idx) {
                        continue;
                    }
                    let bytes = states.state_mut(row_idx);
                    let mut state = <$state>::load(bytes);
                    state.update(arr.value(row_idx))?;
                    state.store(bytes);
                }

                Ok(())
            }

            fn combine(
                &self,
                _input: &crate::functions::aggregate::AggregateInputData,
                sources: &mut crate::functions::aggregate::StateAccessor,
                targets: &mut crate::functions::aggregate::StateAccessor,
            ) -> sable_error::Result<()> {
                use crate::functions::aggregate::{AggregateState, FixedSizeState};

                debug_assert_eq!(sources.len(), targets.len());
                for idx in 0..sources.len() {
                    let source = <$state>::load(sources.state_mut(idx));
                    let bytes = targets.state_mut(idx);
                    let mut target = <$state>::load(bytes);
                    target.merge(source)?;
                    target.store(bytes);
                }

                Ok(())
            }

            fn finalize(
                &self,
                _input: &crate::functions::aggregate::AggregateInputData,
                states: &mut crate::functions::aggregate::StateAccessor,
            ) -> sable_error::Result<sable_vector::array::Array> {
                use crate::functions::aggregate::{AggregateState, FixedSizeState};

                let mut values = Vec::with_capacity(states.len());
                for idx in 0..states.len() {
                    let state = <$state>::load(states.state_mut(idx));
                    values.push(state.finalize()?);
                }

                Ok(sable_vector::array::Array::$output_variant(
                    sable_vector::array::PrimitiveArray::from_iter(values),
                ))
            }
        }
    };
}

pub(crate) use generate_unary_primitive_aggregate;
