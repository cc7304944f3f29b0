//! The shared prediction matrix: one pre-sized 2-D buffer that every predict
//! task writes its slice of.
//!
//! Rows align with observations (possibly only the tail of the full dataset,
//! tracked through the row-offset rebase) and columns with the layer's column
//! assignments. Tasks own disjoint row/column regions by construction —
//! unique columns per instance, disjoint test partitions within a case — so
//! concurrent writes need no locking. Geometry is still validated on every
//! write; region disjointness is an invariant, not a runtime check.

use crate::error::EstimationError;
use crate::index::{IndexSet, ResolvedIndex};
use crate::learner::Prediction;
use ndarray::Array2;
use std::cell::UnsafeCell;

pub struct PredictionMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<UnsafeCell<f64>>,
}

// Safety: concurrent tasks write disjoint cells (unique column assignment
// combined with disjoint fold test partitions), and every write path bounds-
// checks its region first. Reads only happen after the writing batch has
// completed.
unsafe impl Sync for PredictionMatrix {}

impl PredictionMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: (0..rows * cols).map(|_| UnsafeCell::new(0.0)).collect(),
        }
    }

    /// Take ownership of an existing row-major array, e.g. one pre-filled
    /// with NaN to make unwritten cells visible.
    pub fn from_array(array: Array2<f64>) -> Self {
        let (rows, cols) = array.dim();
        Self {
            rows,
            cols,
            cells: array.into_iter().map(UnsafeCell::new).collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Write one task's predictions into the rows named by `test` (global
    /// indices, rebased against `full_rows`) at `column`. 1-D predictions
    /// fill one column; 2-D predictions fill `column..column + width`.
    pub fn assign(
        &self,
        values: &Prediction,
        test: &IndexSet,
        column: usize,
        full_rows: usize,
    ) -> Result<(), EstimationError> {
        let offset = full_rows
            .checked_sub(self.rows)
            .ok_or(EstimationError::RowMismatch {
                matrix_rows: self.rows,
                input_rows: full_rows,
            })?;

        let rows: Vec<usize> = match test.resolve(offset) {
            ResolvedIndex::All => (0..self.rows).collect(),
            ResolvedIndex::Slice(start, end) => (start..end).collect(),
            ResolvedIndex::Gather(rows) => rows,
        };
        self.write_block(values, &rows, column)
    }

    /// Write a full-data prediction down the whole of `column` (and its
    /// probability columns, if 2-D).
    pub fn assign_full(&self, values: &Prediction, column: usize) -> Result<(), EstimationError> {
        let rows: Vec<usize> = (0..self.rows).collect();
        self.write_block(values, &rows, column)
    }

    fn write_block(
        &self,
        values: &Prediction,
        rows: &[usize],
        column: usize,
    ) -> Result<(), EstimationError> {
        let width = values.width();
        let in_bounds = rows.iter().all(|&row| row < self.rows)
            && column + width <= self.cols
            && values.nrows() == rows.len();
        if !in_bounds {
            return Err(EstimationError::ShapeMismatch {
                values_rows: values.nrows(),
                values_cols: width,
                column,
                target_rows: rows.len(),
                rows: self.rows,
                cols: self.cols,
            });
        }

        match values {
            Prediction::Values(v) => {
                for (i, &row) in rows.iter().enumerate() {
                    self.write(row, column, v[i]);
                }
            }
            Prediction::Probabilities(p) => {
                for (i, &row) in rows.iter().enumerate() {
                    for k in 0..width {
                        self.write(row, column + k, p[[i, k]]);
                    }
                }
            }
        }
        Ok(())
    }

    #[inline]
    fn write(&self, row: usize, col: usize, value: f64) {
        // Bounds were checked by the caller; the slice index re-checks them.
        unsafe {
            *self.cells[row * self.cols + col].get() = value;
        }
    }

    /// Read one cell. Only meaningful once no writers are running.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        unsafe { *self.cells[row * self.cols + col].get() }
    }

    /// Recover the assembled array once all writing batches have completed.
    pub fn into_array(self) -> Array2<f64> {
        let data: Vec<f64> = self.cells.into_iter().map(UnsafeCell::into_inner).collect();
        Array2::from_shape_vec((self.rows, self.cols), data)
            .expect("row-major cell buffer matches its declared shape")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn one_column_assignment_lands_on_its_rows() {
        let matrix = PredictionMatrix::zeros(6, 2);
        let values = Prediction::Values(array![1.0, 2.0, 3.0]);
        matrix
            .assign(&values, &IndexSet::Range(2, 5), 1, 6)
            .unwrap();

        let out = matrix.into_array();
        assert_eq!(out[[2, 1]], 1.0);
        assert_eq!(out[[4, 1]], 3.0);
        assert_eq!(out[[2, 0]], 0.0);
        assert_eq!(out[[5, 1]], 0.0);
    }

    #[test]
    fn rebase_shifts_global_rows_into_a_shorter_buffer() {
        // Buffer covers the last 6 of 10 observations.
        let matrix = PredictionMatrix::zeros(6, 1);
        let values = Prediction::Values(array![7.0, 8.0, 9.0]);
        matrix
            .assign(&values, &IndexSet::Range(7, 10), 0, 10)
            .unwrap();

        let out = matrix.into_array();
        assert_eq!(out[[3, 0]], 7.0);
        assert_eq!(out[[5, 0]], 9.0);
        assert_eq!(out[[0, 0]], 0.0);
    }

    #[test]
    fn probability_blocks_span_adjacent_columns() {
        let matrix = PredictionMatrix::zeros(4, 4);
        let values = Prediction::Probabilities(array![[0.3, 0.7], [0.6, 0.4]]);
        matrix
            .assign(&values, &IndexSet::Range(1, 3), 1, 4)
            .unwrap();

        let out = matrix.into_array();
        assert_eq!(out[[1, 1]], 0.3);
        assert_eq!(out[[1, 2]], 0.7);
        assert_eq!(out[[2, 1]], 0.6);
        assert_eq!(out[[2, 2]], 0.4);
        assert_eq!(out[[1, 3]], 0.0);
    }

    #[test]
    fn disjoint_range_sets_gather() {
        let matrix = PredictionMatrix::zeros(8, 1);
        let values = Prediction::Values(array![1.0, 2.0, 3.0, 4.0]);
        matrix
            .assign(
                &values,
                &IndexSet::Ranges(vec![(0, 2), (6, 8)]),
                0,
                8,
            )
            .unwrap();

        let out = matrix.into_array();
        assert_eq!(out[[1, 0]], 2.0);
        assert_eq!(out[[6, 0]], 3.0);
        assert_eq!(out[[3, 0]], 0.0);
    }

    #[test]
    fn geometry_violations_are_rejected() {
        let matrix = PredictionMatrix::zeros(4, 2);

        // Row range beyond the buffer.
        let values = Prediction::Values(array![1.0, 2.0]);
        assert!(matrix.assign(&values, &IndexSet::Range(3, 5), 0, 4).is_err());

        // Prediction wider than the remaining columns.
        let wide = Prediction::Probabilities(Array2::zeros((2, 3)));
        assert!(matrix.assign(&wide, &IndexSet::Range(0, 2), 1, 4).is_err());

        // Row count mismatch between partition and values.
        let short = Prediction::Values(array![1.0]);
        assert!(matrix.assign(&short, &IndexSet::Range(0, 2), 0, 4).is_err());

        // Matrix taller than the dataset it is rebased against.
        assert!(matrix.assign(&values, &IndexSet::Range(0, 2), 0, 3).is_err());
    }
}
