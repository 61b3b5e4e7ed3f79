use crate::bitmap::Bitmap;
use crate::datatype::DataType;

/// A typed column of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    Boolean(BooleanArray),
    Int8(PrimitiveArray<i8>),
    Int16(PrimitiveArray<i16>),
    Int32(PrimitiveArray<i32>),
    Int64(PrimitiveArray<i64>),
    UInt8(PrimitiveArray<u8>),
    UInt16(PrimitiveArray<u16>),
    UInt32(PrimitiveArray<u32>),
    UInt64(PrimitiveArray<u64>),
    Float32(PrimitiveArray<f32>),
    Float64(PrimitiveArray<f64>),
    Utf8(Utf8Array),
}

pub type Int8Array = PrimitiveArray<i8>;
pub type Int16Array = PrimitiveArray<i16>;
pub type Int32Array = PrimitiveArray<i32>;
pub type Int64Array = PrimitiveArray<i64>;
pub type UInt8Array = PrimitiveArray<u8>;
pub type UInt16Array = PrimitiveArray<u16>;
pub type UInt32Array = PrimitiveArray<u32>;
pub type UInt64Array = PrimitiveArray<u64>;
pub type Float32Array = PrimitiveArray<f32>;
pub type Float64Array = PrimitiveArray<f64>;

impl Array {
    pub fn datatype(&self) -> DataType {
        match self {
            Array::Boolean(_) => DataType::Boolean,
            Array::Int8(_) => DataType::Int8,
            Array::Int16(_) => DataType::Int16,
            Array::Int32(_) => DataType::Int32,
            Array::Int64(_) => DataType::Int64,
            Array::UInt8(_) => DataType::UInt8,
            Array::UInt16(_) => DataType::UInt16,
            Array::UInt32(_) => DataType::UInt32,
            Array::UInt64(_) => DataType::UInt64,
            Array::Float32(_) => DataType::Float32,
            Array::Float64(_) => DataType::Float64,
            Array::Utf8(_) => DataType::Utf8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Array::Boolean(arr) => arr.len(),
            Array::Int8(arr) => arr.len(),
            Array::Int16(arr) => arr.len(),
            Array::Int32(arr) => arr.len(),
            Array::Int64(arr) => arr.len(),
            Array::UInt8(arr) => arr.len(),
            Array::UInt16(arr) => arr.len(),
            Array::UInt32(arr) => arr.len(),
            Array::UInt64(arr) => arr.len(),
            Array::Float32(arr) => arr.len(),
            Array::Float64(arr) => arr.len(),
            Array::Utf8(arr) => arr.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validity(&self) -> Option<&Bitmap> {
        match self {
            Array::Boolean(arr) => arr.validity(),
            Array::Int8(arr) => arr.validity(),
            Array::Int16(arr) => arr.validity(),
            Array::Int32(arr) => arr.validity(),
            Array::Int64(arr) => arr.validity(),
            Array::UInt8(arr) => arr.validity(),
            Array::UInt16(arr) => arr.validity(),
            Array::UInt32(arr) => arr.validity(),
            Array::UInt64(arr) => arr.validity(),
            Array::Float32(arr) => arr.validity(),
            Array::Float64(arr) => arr.validity(),
            Array::Utf8(arr) => arr.validity(),
        }
    }

    /// Whether the value at `idx` is valid (non-null).
    pub fn is_valid(&self, idx: usize) -> bool {
        match self.validity() {
            Some(validity) => validity.value(idx),
            None => true,
        }
    }

    /// Create a typed array of the given length with all values null.
    pub fn new_nulls(datatype: DataType, len: usize) -> Self {
        let validity = Some(Bitmap::new_with_all_false(len));
        match datatype {
            DataType::Boolean => Array::Boolean(BooleanArray {
                values: Bitmap::new_with_all_false(len),
                validity,
            }),
            DataType::Int8 => Array::Int8(PrimitiveArray::new(vec![0; len], validity)),
            DataType::Int16 => Array::Int16(PrimitiveArray::new(vec![0; len], validity)),
            DataType::Int32 => Array::Int32(PrimitiveArray::new(vec![0; len], validity)),
            DataType::Int64 => Array::Int64(PrimitiveArray::new(vec![0; len], validity)),
            DataType::UInt8 => Array::UInt8(PrimitiveArray::new(vec![0; len], validity)),
            DataType::UInt16 => Array::UInt16(PrimitiveArray::new(vec![0; len], validity)),
            DataType::UInt32 => Array::UInt32(PrimitiveArray::new(vec![0; len], validity)),
            DataType::UInt64 => Array::UInt64(PrimitiveArray::new(vec![0; len], validity)),
            DataType::Float32 => Array::Float32(PrimitiveArray::new(vec![0.0; len], validity)),
            DataType::Float64 => Array::Float64(PrimitiveArray::new(vec![0.0; len], validity)),
            DataType::Utf8 => Array::Utf8(Utf8Array {
                offsets: vec![0; len + 1],
                data: Vec::new(),
                validity,
            }),
        }
    }
}

/// Array of primitive fixed-width values.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveArray<T> {
    /// Underlying primitive values.
    values: Vec<T>,

    /// Validity mask. A `false` bit means the value at that index is null.
    validity: Option<Bitmap>,
}

impl<T> PrimitiveArray<T> {
    pub fn new(values: Vec<T>, validity: Option<Bitmap>) -> Self {
        if let Some(validity) = &validity {
            assert_eq!(values.len(), validity.len());
        }
        PrimitiveArray { values, validity }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn validity(&self) -> Option<&Bitmap> {
        self.validity.as_ref()
    }

    pub fn is_valid(&self, idx: usize) -> bool {
        match &self.validity {
            Some(validity) => validity.value(idx),
            None => true,
        }
    }
}

impl<T: Copy> PrimitiveArray<T> {
    /// Get the value at `idx`, ignoring validity.
    ///
    /// Panics if out of bounds.
    pub fn value(&self, idx: usize) -> T {
        self.values[idx]
    }
}

impl<T> FromIterator<T> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        PrimitiveArray {
            values: iter.into_iter().collect(),
            validity: None,
        }
    }
}

impl<T> FromIterator<Option<T>> for PrimitiveArray<T>
where
    T: Default,
{
    fn from_iter<I: IntoIterator<Item = Option<T>>>(iter: I) -> Self {
        let mut values = Vec::new();
        let mut validity = Bitmap::default();
        for val in iter {
            match val {
                Some(val) => {
                    values.push(val);
                    validity.push(true);
                }
                None => {
                    values.push(T::default());
                    validity.push(false);
                }
            }
        }
        PrimitiveArray {
            values,
            validity: Some(validity),
        }
    }
}

/// Array of boolean values backed by a bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct BooleanArray {
    values: Bitmap,
    validity: Option<Bitmap>,
}

impl BooleanArray {
    pub fn new(values: Bitmap, validity: Option<Bitmap>) -> Self {
        if let Some(validity) = &validity {
            assert_eq!(values.len(), validity.len());
        }
        BooleanArray { values, validity }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, idx: usize) -> bool {
        self.values.value(idx)
    }

    pub fn values(&self) -> &Bitmap {
        &self.values
    }

    pub fn validity(&self) -> Option<&Bitmap> {
        self.validity.as_ref()
    }
}

impl FromIterator<bool> for BooleanArray {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        BooleanArray {
            values: Bitmap::from_iter(iter),
            validity: None,
        }
    }
}

/// Array of variable-length utf8 strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Utf8Array {
    /// Offsets into `data`, of length `len + 1`.
    offsets: Vec<usize>,
    data: Vec<u8>,
    validity: Option<Bitmap>,
}

impl Utf8Array {
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, idx: usize) -> &str {
        let start = self.offsets[idx];
        let end = self.offsets[idx + 1];
        // Data is only ever built from &str pushes.
        std::str::from_utf8(&self.data[start..end]).expect("utf8 array data to be valid utf8")
    }

    pub fn values_iter(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.len()).map(|idx| self.value(idx))
    }

    pub fn validity(&self) -> Option<&Bitmap> {
        self.validity.as_ref()
    }

    /// Attach a validity mask to an existing array.
    pub fn from_parts(array: Utf8Array, validity: Bitmap) -> Self {
        assert_eq!(array.len(), validity.len());
        Utf8Array {
            validity: Some(validity),
            ..array
        }
    }
}

impl<'a> FromIterator<&'a str> for Utf8Array {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut offsets = vec![0];
        let mut data = Vec::new();
        for val in iter {
            data.extend_from_slice(val.as_bytes());
            offsets.push(data.len());
        }
        Utf8Array {
            offsets,
            data,
            validity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_with_nulls() {
        let arr = Int64Array::from_iter([Some(1), None, Some(3)]);
        assert_eq!(3, arr.len());
        assert!(arr.is_valid(0));
        assert!(!arr.is_valid(1));
        assert_eq!(3, arr.value(2));
    }

    #[test]
    fn typed_null_array() {
        let arr = Array::new_nulls(DataType::Int32, 4);
        assert_eq!(DataType::Int32, arr.datatype());
        assert_eq!(4, arr.len());
        assert!(!arr.is_valid(0));
        assert!(!arr.is_valid(3));
    }

    #[test]
    fn utf8_values() {
        let arr = Utf8Array::from_iter(["a", "bc", ""]);
        assert_eq!(3, arr.len());
        assert_eq!("bc", arr.value(1));
        assert_eq!("", arr.value(2));
    }
}
