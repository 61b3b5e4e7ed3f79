use ahash::RandomState;
use sable_error::{Result, SableError};
use sable_vector::array::{Array, BooleanArray, PrimitiveArray, Utf8Array};

/// State used for all hashing operations during physical execution.
///
/// Seeds are fixed so hash-to-partition mappings agree across threads and
/// operators.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Hash every row in the provided arrays, writing the values to `hashes`.
///
/// All arrays provided must be of the same length, and the provided hash
/// buffer must equal that length.
pub fn build_hashes(arrays: &[&Array], hashes: &mut [u64]) -> Result<()> {
    for (idx, array) in arrays.iter().enumerate() {
        if array.len() != hashes.len() {
            return Err(SableError::new(format!(
                "hash buffer length {} does not match array length {}",
                hashes.len(),
                array.len()
            )));
        }

        let combine_hash = idx > 0;

        match array {
            Array::Boolean(arr) => hash_boolean(arr, hashes, combine_hash),
            Array::Int8(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Int16(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Int32(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Int64(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::UInt8(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::UInt16(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::UInt32(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::UInt64(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Float32(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Float64(arr) => hash_primitive(arr, hashes, combine_hash),
            Array::Utf8(arr) => hash_utf8(arr, hashes, combine_hash),
        }
    }

    Ok(())
}

/// Helper trait for hashing values.
///
/// This is mostly for floats since they don't automatically implement `Hash`.
trait HashValue {
    fn hash_one(&self) -> u64;
}

macro_rules! impl_hash_value {
    ($typ:ty) => {
        impl HashValue for $typ {
            fn hash_one(&self) -> u64 {
                HASH_RANDOM_STATE.hash_one(self)
            }
        }
    };
}

impl_hash_value!(bool);
impl_hash_value!(i8);
impl_hash_value!(i16);
impl_hash_value!(i32);
impl_hash_value!(i64);
impl_hash_value!(u8);
impl_hash_value!(u16);
impl_hash_value!(u32);
impl_hash_value!(u64);
impl_hash_value!(str);

impl HashValue for f32 {
    fn hash_one(&self) -> u64 {
        HASH_RANDOM_STATE.hash_one(self.to_ne_bytes())
    }
}

impl HashValue for f64 {
    fn hash_one(&self) -> u64 {
        HASH_RANDOM_STATE.hash_one(self.to_ne_bytes())
    }
}

/// Combines two hashes into one hash.
const fn combine_hashes(l: u64, r: u64) -> u64 {
    let hash = (17 * 37u64).wrapping_add(l);
    hash.wrapping_mul(37).wrapping_add(r)
}

/// All nulls hash to the same arbitrary but consistent value.
fn null_hash_value() -> u64 {
    HASH_RANDOM_STATE.hash_one(1)
}

fn write_hash(hashes: &mut [u64], idx: usize, hash: u64, combine: bool) {
    if combine {
        hashes[idx] = combine_hashes(hash, hashes[idx]);
    } else {
        hashes[idx] = hash;
    }
}

fn hash_boolean(array: &BooleanArray, hashes: &mut [u64], combine: bool) {
    let null_hash = null_hash_value();
    for idx in 0..array.len() {
        let valid = array.validity().map(|v| v.value(idx)).unwrap_or(true);
        let hash = if valid {
            array.value(idx).hash_one()
        } else {
            null_hash
        };
        write_hash(hashes, idx, hash, combine);
    }
}

fn hash_primitive<T: HashValue + Copy>(array: &PrimitiveArray<T>, hashes: &mut [u64], combine: bool) {
    let null_hash = null_hash_value();
    for idx in 0..array.len() {
        let hash = if array.is_valid(idx) {
            array.value(idx).hash_one()
        } else {
            null_hash
        };
        write_hash(hashes, idx, hash, combine);
    }
}

fn hash_utf8(array: &Utf8Array, hashes: &mut [u64], combine: bool) {
    let null_hash = null_hash_value();
    for idx in 0..array.len() {
        let valid = array.validity().map(|v| v.value(idx)).unwrap_or(true);
        let hash = if valid {
            array.value(idx).hash_one()
        } else {
            null_hash
        };
        write_hash(hashes, idx, hash, combine);
    }
}
