use sable_error::Result;

use crate::array::{Array, BooleanArray, PrimitiveArray, Utf8Array};
use crate::bitmap::Bitmap;
use crate::selection::SelectionVector;

/// Create a new array by taking rows from the input at the locations indicated
/// by the selection vector.
pub fn take(arr: &Array, selection: &SelectionVector) -> Result<Array> {
    Ok(match arr {
        Array::Boolean(arr) => Array::Boolean(take_boolean(arr, selection)),
        Array::Int8(arr) => Array::Int8(take_primitive(arr, selection)),
        Array::Int16(arr) => Array::Int16(take_primitive(arr, selection)),
        Array::Int32(arr) => Array::Int32(take_primitive(arr, selection)),
        Array::Int64(arr) => Array::Int64(take_primitive(arr, selection)),
        Array::UInt8(arr) => Array::UInt8(take_primitive(arr, selection)),
        Array::UInt16(arr) => Array::UInt16(take_primitive(arr, selection)),
        Array::UInt32(arr) => Array::UInt32(take_primitive(arr, selection)),
        Array::UInt64(arr) => Array::UInt64(take_primitive(arr, selection)),
        Array::Float32(arr) => Array::Float32(take_primitive(arr, selection)),
        Array::Float64(arr) => Array::Float64(take_primitive(arr, selection)),
        Array::Utf8(arr) => Array::Utf8(take_utf8(arr, selection)),
    })
}

fn take_validity(validity: Option<&Bitmap>, selection: &SelectionVector) -> Option<Bitmap> {
    validity.map(|validity| {
        selection
            .iter_locations()
            .map(|loc| validity.value(loc))
            .collect()
    })
}

fn take_primitive<T: Copy>(
    arr: &PrimitiveArray<T>,
    selection: &SelectionVector,
) -> PrimitiveArray<T> {
    let values: Vec<_> = selection.iter_locations().map(|loc| arr.value(loc)).collect();
    PrimitiveArray::new(values, take_validity(arr.validity(), selection))
}

fn take_boolean(arr: &BooleanArray, selection: &SelectionVector) -> BooleanArray {
    let values: Bitmap = selection.iter_locations().map(|loc| arr.value(loc)).collect();
    BooleanArray::new(values, take_validity(arr.validity(), selection))
}

fn take_utf8(arr: &Utf8Array, selection: &SelectionVector) -> Utf8Array {
    let mut out = Utf8Array::from_iter(selection.iter_locations().map(|loc| arr.value(loc)));
    if let Some(validity) = take_validity(arr.validity(), selection) {
        out = Utf8Array::from_parts(out, validity);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Int64Array;

    #[test]
    fn take_with_validity() {
        let arr = Array::Int64(Int64Array::from_iter([Some(1), None, Some(3), Some(4)]));
        let sel = SelectionVector::from_iter([3, 1, 0]);

        let out = take(&arr, &sel).unwrap();
        assert_eq!(3, out.len());
        assert!(out.is_valid(0));
        assert!(!out.is_valid(1));
        match out {
            Array::Int64(arr) => {
                assert_eq!(4, arr.value(0));
                assert_eq!(1, arr.value(2));
            }
            other => panic!("unexpected array type: {other:?}"),
        }
    }
}
