//! Global-to-local index translation for the submatrix grid.
//!
//! A matrix of n x m elements partitioned into r x c submatrices forms a
//! grid of ceil(n/r) x ceil(m/c) blocks, numbered in row-major order. All
//! blocks are full-sized except possibly the last block row and column,
//! which hold the remainders.

/// Position of one element: the submatrix it falls into and its local
/// coordinates within that submatrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseIndex {
    pub submatrix: usize,
    pub local_row: usize,
    pub local_col: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub rows: usize,
    pub cols: usize,
    pub submatrix_rows: usize,
    pub submatrix_cols: usize,
}

impl Partition {
    pub fn new(rows: usize, cols: usize, submatrix_rows: usize, submatrix_cols: usize) -> Self {
        assert!(rows > 0 && cols > 0, "matrix dimensions must be positive");
        assert!(
            submatrix_rows > 0 && submatrix_cols > 0,
            "submatrix dimensions must be positive"
        );

        Partition {
            rows,
            cols,
            submatrix_rows,
            submatrix_cols,
        }
    }

    /// Number of submatrices along one row of the grid.
    pub fn per_row(&self) -> usize {
        self.cols.div_ceil(self.submatrix_cols)
    }

    /// Number of submatrices along one column of the grid.
    pub fn per_col(&self) -> usize {
        self.rows.div_ceil(self.submatrix_rows)
    }

    /// Total number of submatrix ids.
    pub fn max_submatrices(&self) -> usize {
        self.per_row() * self.per_col()
    }

    pub fn locate(&self, row: usize, col: usize) -> SparseIndex {
        let block_row = row / self.submatrix_rows;
        let block_col = col / self.submatrix_cols;

        SparseIndex {
            submatrix: block_row * self.per_row() + block_col,
            local_row: row % self.submatrix_rows,
            local_col: col % self.submatrix_cols,
        }
    }

    /// Global row index of the first element of the given submatrix.
    pub fn row_start(&self, submatrix: usize) -> usize {
        (submatrix / self.per_row()) * self.submatrix_rows
    }

    /// Global column index of the first element of the given submatrix.
    pub fn col_start(&self, submatrix: usize) -> usize {
        (submatrix % self.per_row()) * self.submatrix_cols
    }

    /// Row count of the given submatrix; boundary blocks may be smaller.
    pub fn rows_of(&self, submatrix: usize) -> usize {
        (self.rows - self.row_start(submatrix)).min(self.submatrix_rows)
    }

    /// Column count of the given submatrix; boundary blocks may be smaller.
    pub fn cols_of(&self, submatrix: usize) -> usize {
        (self.cols - self.col_start(submatrix)).min(self.submatrix_cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_partition() {
        let part = Partition::new(4, 4, 2, 2);

        assert_eq!(part.per_row(), 2);
        assert_eq!(part.per_col(), 2);
        assert_eq!(part.max_submatrices(), 4);

        assert_eq!(
            part.locate(0, 0),
            SparseIndex {
                submatrix: 0,
                local_row: 0,
                local_col: 0
            }
        );
        assert_eq!(
            part.locate(1, 3),
            SparseIndex {
                submatrix: 1,
                local_row: 1,
                local_col: 1
            }
        );
        assert_eq!(
            part.locate(3, 0),
            SparseIndex {
                submatrix: 2,
                local_row: 1,
                local_col: 0
            }
        );
    }

    #[test]
    fn test_boundary_blocks_are_smaller() {
        // 5x7 at 2x3: grid is 3x3; the last block row has 1 row, the last
        // block column 1 column.
        let part = Partition::new(5, 7, 2, 3);

        assert_eq!(part.per_row(), 3);
        assert_eq!(part.per_col(), 3);

        assert_eq!(part.rows_of(0), 2);
        assert_eq!(part.cols_of(0), 3);
        assert_eq!(part.rows_of(8), 1);
        assert_eq!(part.cols_of(8), 1);
        assert_eq!(part.row_start(8), 4);
        assert_eq!(part.col_start(8), 6);

        let at = part.locate(4, 6);
        assert_eq!(at.submatrix, 8);
        assert_eq!((at.local_row, at.local_col), (0, 0));
    }

    #[test]
    fn test_every_element_maps_into_its_block() {
        let part = Partition::new(6, 5, 4, 2);

        for row in 0..6 {
            for col in 0..5 {
                let at = part.locate(row, col);
                assert!(at.submatrix < part.max_submatrices());
                assert!(at.local_row < part.rows_of(at.submatrix));
                assert!(at.local_col < part.cols_of(at.submatrix));
                assert_eq!(part.row_start(at.submatrix) + at.local_row, row);
                assert_eq!(part.col_start(at.submatrix) + at.local_col, col);
            }
        }
    }
}
