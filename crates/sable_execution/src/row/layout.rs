use std::sync::Arc;

use sable_error::{not_implemented, Result, SableError};
use sable_vector::array::{Array, BooleanArray, PrimitiveArray};
use sable_vector::bitmap::Bitmap;
use sable_vector::datatype::DataType;

use crate::functions::aggregate::AggregateExpr;
use crate::storage::arena::ArenaAllocator;

/// Fixed-width native value that can be written to and read from row storage.
pub trait PrimitiveNative: Copy + Default + std::fmt::Debug + Send + Sync + 'static {
    const WIDTH: usize;

    fn write_to(self, out: &mut [u8]);
    fn read_from(bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive_native {
    ($native:ty, $width:expr) => {
        impl PrimitiveNative for $native {
            const WIDTH: usize = $width;

            fn write_to(self, out: &mut [u8]) {
                out[..$width].copy_from_slice(&self.to_ne_bytes());
            }

            fn read_from(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $width];
                buf.copy_from_slice(&bytes[..$width]);
                Self::from_ne_bytes(buf)
            }
        }
    };
}

impl_primitive_native!(i8, 1);
impl_primitive_native!(i16, 2);
impl_primitive_native!(i32, 4);
impl_primitive_native!(i64, 8);
impl_primitive_native!(u8, 1);
impl_primitive_native!(u16, 2);
impl_primitive_native!(u32, 4);
impl_primitive_native!(u64, 8);
impl_primitive_native!(f32, 4);
impl_primitive_native!(f64, 8);

/// Describes the byte layout of a row:
///
/// ```text
/// [group validity bytes..., group values..., hash, aggregate states...]
/// ```
///
/// Group columns must be fixed-width. One validity byte per group column sits
/// at the front of the row.
#[derive(Debug)]
pub struct RowLayout {
    group_types: Vec<DataType>,
    aggregates: Vec<AggregateExpr>,
    group_offsets: Vec<usize>,
    hash_offset: usize,
    aggregate_offsets: Vec<usize>,
    row_width: usize,
    has_destructor: bool,
}

impl RowLayout {
    pub fn try_new(group_types: Vec<DataType>, aggregates: Vec<AggregateExpr>) -> Result<Self> {
        // Validity bytes prefix the row, one byte per group column.
        let mut offset = group_types.len();

        let mut group_offsets = Vec::with_capacity(group_types.len());
        for datatype in &group_types {
            let width = match datatype.fixed_width() {
                Some(width) => width,
                None => not_implemented!("variable-length group column: {datatype}"),
            };
            group_offsets.push(offset);
            offset += width;
        }

        let hash_offset = offset;
        offset += std::mem::size_of::<u64>();

        let mut aggregate_offsets = Vec::with_capacity(aggregates.len());
        for aggregate in &aggregates {
            aggregate_offsets.push(offset);
            offset += aggregate.function.state_size();
        }

        let has_destructor = aggregates.iter().any(|agg| agg.function.has_destructor());

        Ok(RowLayout {
            group_types,
            aggregates,
            group_offsets,
            hash_offset,
            aggregate_offsets,
            row_width: offset,
            has_destructor,
        })
    }

    pub fn group_types(&self) -> &[DataType] {
        &self.group_types
    }

    pub fn num_groups(&self) -> usize {
        self.group_types.len()
    }

    pub fn aggregates(&self) -> &[AggregateExpr] {
        &self.aggregates
    }

    pub fn aggregate_offset(&self, idx: usize) -> usize {
        self.aggregate_offsets[idx]
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn has_destructor(&self) -> bool {
        self.has_destructor
    }

    pub fn write_hash(&self, row: &mut [u8], hash: u64) {
        hash.write_to(&mut row[self.hash_offset..]);
    }

    pub fn read_hash(&self, row: &[u8]) -> u64 {
        u64::read_from(&row[self.hash_offset..])
    }

    /// Write the group value from `array[row_idx]` into group column `col` of
    /// the row, including its validity byte.
    pub fn write_group_value(
        &self,
        row: &mut [u8],
        col: usize,
        array: &Array,
        row_idx: usize,
    ) -> Result<()> {
        let valid = array.is_valid(row_idx);
        row[col] = valid as u8;
        if !valid {
            return Ok(());
        }

        let offset = self.group_offsets[col];
        match (self.group_types[col], array) {
            (DataType::Boolean, Array::Boolean(arr)) => row[offset] = arr.value(row_idx) as u8,
            (DataType::Int8, Array::Int8(arr)) => arr.value(row_idx).write_to(&mut row[offset..]),
            (DataType::Int16, Array::Int16(arr)) => arr.value(row_idx).write_to(&mut row[offset..]),
            (DataType::Int32, Array::Int32(arr)) => arr.value(row_idx).write_to(&mut row[offset..]),
            (DataType::Int64, Array::Int64(arr)) => arr.value(row_idx).write_to(&mut row[offset..]),
            (DataType::UInt8, Array::UInt8(arr)) => arr.value(row_idx).write_to(&mut row[offset..]),
            (DataType::UInt16, Array::UInt16(arr)) => {
                arr.value(row_idx).write_to(&mut row[offset..])
            }
            (DataType::UInt32, Array::UInt32(arr)) => {
                arr.value(row_idx).write_to(&mut row[offset..])
            }
            (DataType::UInt64, Array::UInt64(arr)) => {
                arr.value(row_idx).write_to(&mut row[offset..])
            }
            (DataType::Float32, Array::Float32(arr)) => {
                arr.value(row_idx).write_to(&mut row[offset..])
            }
            (DataType::Float64, Array::Float64(arr)) => {
                arr.value(row_idx).write_to(&mut row[offset..])
            }
            (datatype, other) => {
                return Err(SableError::new(format!(
                    "group column type mismatch: layout has {datatype}, array is {}",
                    other.datatype()
                )))
            }
        }

        Ok(())
    }

    /// Compare the stored group value in column `col` of the row against
    /// `array[row_idx]`. Two nulls compare equal, groups treat null as a value.
    pub fn group_value_eq(&self, row: &[u8], col: usize, array: &Array, row_idx: usize) -> bool {
        let row_valid = row[col] != 0;
        let arr_valid = array.is_valid(row_idx);
        if row_valid != arr_valid {
            return false;
        }
        if !row_valid {
            return true;
        }

        let offset = self.group_offsets[col];
        match (self.group_types[col], array) {
            (DataType::Boolean, Array::Boolean(arr)) => {
                (row[offset] != 0) == arr.value(row_idx)
            }
            (DataType::Int8, Array::Int8(arr)) => {
                i8::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::Int16, Array::Int16(arr)) => {
                i16::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::Int32, Array::Int32(arr)) => {
                i32::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::Int64, Array::Int64(arr)) => {
                i64::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::UInt8, Array::UInt8(arr)) => {
                u8::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::UInt16, Array::UInt16(arr)) => {
                u16::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::UInt32, Array::UInt32(arr)) => {
                u32::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::UInt64, Array::UInt64(arr)) => {
                u64::read_from(&row[offset..]) == arr.value(row_idx)
            }
            (DataType::Float32, Array::Float32(arr)) => {
                f32::read_from(&row[offset..]).to_ne_bytes() == arr.value(row_idx).to_ne_bytes()
            }
            (DataType::Float64, Array::Float64(arr)) => {
                f64::read_from(&row[offset..]).to_ne_bytes() == arr.value(row_idx).to_ne_bytes()
            }
            _ => false,
        }
    }

    /// Materialize group column `col` from a set of rows back into an array.
    pub fn read_group_column(&self, rows: &[&[u8]], col: usize) -> Result<Array> {
        let offset = self.group_offsets[col];
        let validity: Bitmap = rows.iter().map(|row| row[col] != 0).collect();
        let validity = if validity.count_trues() == validity.len() {
            None
        } else {
            Some(validity)
        };

        fn read_primitive<T: PrimitiveNative>(
            rows: &[&[u8]],
            offset: usize,
            validity: Option<Bitmap>,
        ) -> PrimitiveArray<T> {
            let values = rows.iter().map(|row| T::read_from(&row[offset..])).collect();
            PrimitiveArray::new(values, validity)
        }

        Ok(match self.group_types[col] {
            DataType::Boolean => {
                let values: Bitmap = rows.iter().map(|row| row[offset] != 0).collect();
                Array::Boolean(BooleanArray::new(values, validity))
            }
            DataType::Int8 => Array::Int8(read_primitive(rows, offset, validity)),
            DataType::Int16 => Array::Int16(read_primitive(rows, offset, validity)),
            DataType::Int32 => Array::Int32(read_primitive(rows, offset, validity)),
            DataType::Int64 => Array::Int64(read_primitive(rows, offset, validity)),
            DataType::UInt8 => Array::UInt8(read_primitive(rows, offset, validity)),
            DataType::UInt16 => Array::UInt16(read_primitive(rows, offset, validity)),
            DataType::UInt32 => Array::UInt32(read_primitive(rows, offset, validity)),
            DataType::UInt64 => Array::UInt64(read_primitive(rows, offset, validity)),
            DataType::Float32 => Array::Float32(read_primitive(rows, offset, validity)),
            DataType::Float64 => Array::Float64(read_primitive(rows, offset, validity)),
            DataType::Utf8 => {
                return Err(SableError::new(
                    "variable-length group columns cannot exist in a row layout",
                ))
            }
        })
    }

    /// Initialize the aggregate state region of a freshly allocated row.
    pub fn initialize_aggregate_states(&self, allocator: &ArenaAllocator, row: &mut [u8]) {
        for (idx, aggregate) in self.aggregates.iter().enumerate() {
            let offset = self.aggregate_offsets[idx];
            let size = aggregate.function.state_size();
            let input_data = aggregate.input_data(allocator);
            aggregate
                .function
                .initialize(&input_data, &mut row[offset..offset + size]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_vector::array::Int64Array;

    fn int64_layout() -> RowLayout {
        RowLayout::try_new(vec![DataType::Int64, DataType::Int32], Vec::new()).unwrap()
    }

    #[test]
    fn offsets_and_width() {
        let layout = int64_layout();
        // 2 validity bytes + 8 + 4 + 8 byte hash.
        assert_eq!(22, layout.row_width());
        assert_eq!(14, layout.hash_offset);
        assert_eq!(vec![2, 10], layout.group_offsets);
    }

    #[test]
    fn varlen_groups_rejected() {
        RowLayout::try_new(vec![DataType::Utf8], Vec::new()).unwrap_err();
    }

    #[test]
    fn write_read_roundtrip() {
        let layout = RowLayout::try_new(vec![DataType::Int64], Vec::new()).unwrap();
        let arr = Array::Int64(Int64Array::from_iter([Some(42), None]));

        let mut row0 = vec![0u8; layout.row_width()];
        let mut row1 = vec![0u8; layout.row_width()];
        layout.write_group_value(&mut row0, 0, &arr, 0).unwrap();
        layout.write_group_value(&mut row1, 0, &arr, 1).unwrap();
        layout.write_hash(&mut row0, 77);

        assert_eq!(77, layout.read_hash(&row0));
        assert!(layout.group_value_eq(&row0, 0, &arr, 0));
        assert!(!layout.group_value_eq(&row0, 0, &arr, 1));
        // Null in the row compares equal to null in the array.
        assert!(layout.group_value_eq(&row1, 0, &arr, 1));

        let rows: Vec<&[u8]> = vec![&row0, &row1];
        let out = layout.read_group_column(&rows, 0).unwrap();
        assert!(out.is_valid(0));
        assert!(!out.is_valid(1));
        match out {
            Array::Int64(arr) => assert_eq!(42, arr.value(0)),
            other => panic!("unexpected array type: {other:?}"),
        }
    }
}
