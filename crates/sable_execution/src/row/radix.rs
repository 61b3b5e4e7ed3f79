/// Number of partitions produced by `radix_bits` bits.
pub const fn partition_count(radix_bits: usize) -> usize {
    1 << radix_bits
}

/// Radix bits needed to address `count` partitions, rounding `count` up to a
/// power of two.
pub fn radix_bits_for_count(count: usize) -> usize {
    count.next_power_of_two().trailing_zeros() as usize
}

/// Select a partition from the top `radix_bits` bits of the hash.
#[inline]
pub fn partition_for_hash(hash: u64, radix_bits: usize) -> usize {
    if radix_bits == 0 {
        return 0;
    }
    (hash >> (64 - radix_bits)) as usize
}
