pub mod layout;
pub mod partitioned;
pub mod radix;
pub mod tuple_data;

/// Address of a single row inside a partitioned tuple collection.
///
/// When used against an unpartitioned collection the partition index is zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RowAddress {
    pub partition: u32,
    pub block: u32,
    pub row: u32,
}
