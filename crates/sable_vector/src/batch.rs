use std::sync::Arc;

use sable_error::{Result, SableError};

use crate::array::Array;

/// A batch of same-length arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Columns that make up this batch.
    cols: Vec<Arc<Array>>,

    /// Number of rows in this batch. Needed to allow for a batch that has no
    /// columns but a non-zero number of rows.
    num_rows: usize,
}

impl Batch {
    pub fn empty() -> Self {
        Batch {
            cols: Vec::new(),
            num_rows: 0,
        }
    }

    pub fn empty_with_num_rows(num_rows: usize) -> Self {
        Batch {
            cols: Vec::new(),
            num_rows,
        }
    }

    pub fn try_new(cols: impl IntoIterator<Item = Array>) -> Result<Self> {
        Self::try_from_arrays(cols.into_iter().map(Arc::new))
    }

    pub fn try_from_arrays(cols: impl IntoIterator<Item = Arc<Array>>) -> Result<Self> {
        let cols: Vec<_> = cols.into_iter().collect();
        let len = match cols.first() {
            Some(arr) => arr.len(),
            None => return Ok(Self::empty()),
        };

        for col in &cols {
            if col.len() != len {
                return Err(SableError::new(format!(
                    "Expected column length to be {len}, got {}",
                    col.len()
                )));
            }
        }

        Ok(Batch {
            cols,
            num_rows: len,
        })
    }

    /// Project a batch using the provided indices.
    ///
    /// Panics if any index is out of bounds.
    pub fn project(&self, indices: &[usize]) -> Self {
        let cols: Vec<_> = indices.iter().map(|idx| self.cols[*idx].clone()).collect();

        Batch {
            cols,
            num_rows: self.num_rows,
        }
    }

    pub fn column(&self, idx: usize) -> Option<&Arc<Array>> {
        self.cols.get(idx)
    }

    pub fn columns(&self) -> &[Arc<Array>] {
        &self.cols
    }

    pub fn num_columns(&self) -> usize {
        self.cols.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Int64Array;

    #[test]
    fn mismatched_lengths() {
        let cols = vec![
            Array::Int64(Int64Array::from_iter([1, 2, 3])),
            Array::Int64(Int64Array::from_iter([1, 2])),
        ];
        Batch::try_new(cols).unwrap_err();
    }

    #[test]
    fn project_reorders() {
        let batch = Batch::try_new([
            Array::Int64(Int64Array::from_iter([1, 2])),
            Array::Int64(Int64Array::from_iter([3, 4])),
        ])
        .unwrap();

        let projected = batch.project(&[1, 0]);
        assert_eq!(2, projected.num_rows());
        assert_eq!(
            &Array::Int64(Int64Array::from_iter([3, 4])),
            projected.column(0).unwrap().as_ref()
        );
    }
}
