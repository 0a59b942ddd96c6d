//! Per-submatrix storage encodings.
//!
//! Both encodings present the same surface: element access by local index,
//! batch iteration over stored slots, and re-compression. The compressed
//! sparse row encoding never stores the zero element (after `pack`); the
//! dense block encoding stores every slot.

use crate::matrix::Element;

pub trait Submatrix<T: Element>: Send + Sync {
    fn id(&self) -> usize;
    fn local_rows(&self) -> usize;
    fn local_cols(&self) -> usize;
    /// Global row index of the first local row.
    fn row_start(&self) -> usize;
    /// Global column index of the first local column.
    fn col_start(&self) -> usize;

    /// Element at local (row, col); the zero element for absent slots.
    fn get(&self, local_row: usize, local_col: usize) -> T;

    /// Stores `value` at local (row, col), keeping the encoding invariants.
    fn set(&mut self, value: T, local_row: usize, local_col: usize);

    /// Number of storage slots (zeros included for the dense encoding).
    fn stored(&self) -> usize;

    /// Value of the k-th storage slot, `k < stored()`.
    fn value_at(&self, k: usize) -> T;

    /// Local row of the k-th storage slot.
    fn local_row_of(&self, k: usize) -> usize;

    /// Local column of the k-th storage slot.
    fn local_col_of(&self, k: usize) -> usize;

    /// Overwrites the k-th storage slot in place. Writing the zero element
    /// may leave the encoding uncompressed; follow up with `pack`.
    fn set_value_at(&mut self, value: T, k: usize);

    /// Drops every stored slot whose value equals the zero element.
    fn pack(&mut self);

    /// Number of stored non-zero elements.
    fn nonzero_count(&self) -> usize;

    fn clone_box(&self) -> Box<dyn Submatrix<T>>;

    /// Prototype factory: an empty submatrix of the same encoding.
    fn make(
        &self,
        id: usize,
        local_rows: usize,
        local_cols: usize,
        row_start: usize,
        col_start: usize,
    ) -> Box<dyn Submatrix<T>>;

    fn row_is_local(&self, global_row: usize) -> bool {
        (self.row_start()..self.row_start() + self.local_rows()).contains(&global_row)
    }

    fn col_is_local(&self, global_col: usize) -> bool {
        (self.col_start()..self.col_start() + self.local_cols()).contains(&global_col)
    }

    /// Global row index of the k-th storage slot.
    fn global_row_of(&self, k: usize) -> usize {
        self.row_start() + self.local_row_of(k)
    }

    /// Global column index of the k-th storage slot.
    fn global_col_of(&self, k: usize) -> usize {
        self.col_start() + self.local_col_of(k)
    }
}

/// Compressed sparse row storage. `values` holds the non-zero elements in
/// row-major order, `cols` the local column of each, and `row_ptr` (length
/// local rows + 1) the index of each row's first element, with -1 marking
/// an empty row. The trailing entry always holds the element count.
pub struct CrsSubmatrix<T> {
    id: usize,
    local_rows: usize,
    local_cols: usize,
    row_start: usize,
    col_start: usize,
    zero: T,
    values: Vec<T>,
    cols: Vec<usize>,
    row_ptr: Vec<isize>,
}

impl<T: Element> CrsSubmatrix<T> {
    /// Prototype for matrix constructors; carries only the zero element.
    pub fn prototype(zero: T) -> Self {
        CrsSubmatrix {
            id: 0,
            local_rows: 0,
            local_cols: 0,
            row_start: 0,
            col_start: 0,
            zero,
            values: Vec::new(),
            cols: Vec::new(),
            row_ptr: vec![0],
        }
    }

    pub fn empty(
        zero: T,
        id: usize,
        local_rows: usize,
        local_cols: usize,
        row_start: usize,
        col_start: usize,
    ) -> Self {
        let mut row_ptr = vec![-1; local_rows];
        row_ptr.push(0);

        CrsSubmatrix {
            id,
            local_rows,
            local_cols,
            row_start,
            col_start,
            zero,
            values: Vec::new(),
            cols: Vec::new(),
            row_ptr,
        }
    }

    /// First storage index of the given row together with its element
    /// count; `None` for empty rows.
    fn row_span(&self, local_row: usize) -> Option<(usize, usize)> {
        let first = self.row_ptr[local_row];
        if first < 0 {
            return None;
        }

        // The next non-empty row pointer bounds this row; the trailing
        // entry is always valid.
        let next = self.row_ptr[local_row + 1..]
            .iter()
            .find(|&&p| p >= 0)
            .copied()
            .unwrap_or(self.values.len() as isize);

        Some((first as usize, (next - first) as usize))
    }

    fn slot_of(&self, local_row: usize, local_col: usize) -> Option<usize> {
        let (first, count) = self.row_span(local_row)?;
        let row_cols = &self.cols[first..first + count];
        row_cols
            .binary_search(&local_col)
            .ok()
            .map(|within| first + within)
    }

    fn insert_slot(&mut self, local_row: usize, local_col: usize, value: T) {
        let at = match self.row_span(local_row) {
            None => {
                // Row was empty: insert before the next non-empty row.
                let at = self.row_ptr[local_row + 1..]
                    .iter()
                    .find(|&&p| p >= 0)
                    .copied()
                    .unwrap_or(self.values.len() as isize) as usize;
                self.row_ptr[local_row] = at as isize;
                at
            }
            Some((first, count)) => {
                let row_cols = &self.cols[first..first + count];
                let within = row_cols.partition_point(|&c| c < local_col);
                first + within
            }
        };

        self.values.insert(at, value);
        self.cols.insert(at, local_col);

        for ptr in &mut self.row_ptr[local_row + 1..] {
            if *ptr >= 0 {
                *ptr += 1;
            }
        }
    }

    fn delete_slot(&mut self, local_row: usize, at: usize) {
        let (_, count) = self.row_span(local_row).expect("slot in non-empty row");

        if count == 1 {
            self.row_ptr[local_row] = -1;
        }

        self.values.remove(at);
        self.cols.remove(at);

        for ptr in &mut self.row_ptr[local_row + 1..] {
            if *ptr >= 0 {
                *ptr -= 1;
            }
        }
    }
}

impl<T: Element> Submatrix<T> for CrsSubmatrix<T> {
    fn id(&self) -> usize {
        self.id
    }

    fn local_rows(&self) -> usize {
        self.local_rows
    }

    fn local_cols(&self) -> usize {
        self.local_cols
    }

    fn row_start(&self) -> usize {
        self.row_start
    }

    fn col_start(&self) -> usize {
        self.col_start
    }

    fn get(&self, local_row: usize, local_col: usize) -> T {
        match self.slot_of(local_row, local_col) {
            Some(at) => self.values[at].clone(),
            None => self.zero.clone(),
        }
    }

    fn set(&mut self, value: T, local_row: usize, local_col: usize) {
        match self.slot_of(local_row, local_col) {
            // Present and overwritten with zero: delete and re-point.
            Some(at) if value == self.zero => self.delete_slot(local_row, at),
            // Present: replace in place.
            Some(at) => self.values[at] = value,
            // Absent and zero: nothing to store.
            None if value == self.zero => {}
            // Absent: insert and shift the following rows.
            None => self.insert_slot(local_row, local_col, value),
        }
    }

    fn stored(&self) -> usize {
        self.values.len()
    }

    fn value_at(&self, k: usize) -> T {
        self.values[k].clone()
    }

    fn local_row_of(&self, k: usize) -> usize {
        // The row whose span covers slot k; a linear scan over the row
        // pointers, skipping empty rows.
        let mut row = 0;
        for (at, &ptr) in self.row_ptr[..self.local_rows].iter().enumerate() {
            if ptr >= 0 && ptr as usize <= k {
                row = at;
            }
        }
        row
    }

    fn local_col_of(&self, k: usize) -> usize {
        self.cols[k]
    }

    fn set_value_at(&mut self, value: T, k: usize) {
        self.values[k] = value;
    }

    fn pack(&mut self) {
        for k in (0..self.values.len()).rev() {
            if self.values[k] == self.zero {
                let row = self.local_row_of(k);
                self.delete_slot(row, k);
            }
        }
    }

    fn nonzero_count(&self) -> usize {
        self.values.iter().filter(|v| **v != self.zero).count()
    }

    fn clone_box(&self) -> Box<dyn Submatrix<T>> {
        Box::new(CrsSubmatrix {
            id: self.id,
            local_rows: self.local_rows,
            local_cols: self.local_cols,
            row_start: self.row_start,
            col_start: self.col_start,
            zero: self.zero.clone(),
            values: self.values.clone(),
            cols: self.cols.clone(),
            row_ptr: self.row_ptr.clone(),
        })
    }

    fn make(
        &self,
        id: usize,
        local_rows: usize,
        local_cols: usize,
        row_start: usize,
        col_start: usize,
    ) -> Box<dyn Submatrix<T>> {
        Box::new(CrsSubmatrix::empty(
            self.zero.clone(),
            id,
            local_rows,
            local_cols,
            row_start,
            col_start,
        ))
    }
}

/// Dense row-major block storage. Every slot is stored, zeros included;
/// access is O(1) and `pack` has nothing to do.
pub struct BlockSubmatrix<T> {
    id: usize,
    local_rows: usize,
    local_cols: usize,
    row_start: usize,
    col_start: usize,
    zero: T,
    values: Vec<T>,
}

impl<T: Element> BlockSubmatrix<T> {
    pub fn prototype(zero: T) -> Self {
        BlockSubmatrix {
            id: 0,
            local_rows: 0,
            local_cols: 0,
            row_start: 0,
            col_start: 0,
            zero,
            values: Vec::new(),
        }
    }

    pub fn empty(
        zero: T,
        id: usize,
        local_rows: usize,
        local_cols: usize,
        row_start: usize,
        col_start: usize,
    ) -> Self {
        BlockSubmatrix {
            id,
            local_rows,
            local_cols,
            row_start,
            col_start,
            values: vec![zero.clone(); local_rows * local_cols],
            zero,
        }
    }

    fn slot(&self, local_row: usize, local_col: usize) -> usize {
        local_row * self.local_cols + local_col
    }
}

impl<T: Element> Submatrix<T> for BlockSubmatrix<T> {
    fn id(&self) -> usize {
        self.id
    }

    fn local_rows(&self) -> usize {
        self.local_rows
    }

    fn local_cols(&self) -> usize {
        self.local_cols
    }

    fn row_start(&self) -> usize {
        self.row_start
    }

    fn col_start(&self) -> usize {
        self.col_start
    }

    fn get(&self, local_row: usize, local_col: usize) -> T {
        self.values[self.slot(local_row, local_col)].clone()
    }

    fn set(&mut self, value: T, local_row: usize, local_col: usize) {
        let at = self.slot(local_row, local_col);
        self.values[at] = value;
    }

    fn stored(&self) -> usize {
        self.values.len()
    }

    fn value_at(&self, k: usize) -> T {
        self.values[k].clone()
    }

    fn local_row_of(&self, k: usize) -> usize {
        k / self.local_cols
    }

    fn local_col_of(&self, k: usize) -> usize {
        k % self.local_cols
    }

    fn set_value_at(&mut self, value: T, k: usize) {
        self.values[k] = value;
    }

    fn pack(&mut self) {}

    fn nonzero_count(&self) -> usize {
        self.values.iter().filter(|v| **v != self.zero).count()
    }

    fn clone_box(&self) -> Box<dyn Submatrix<T>> {
        Box::new(BlockSubmatrix {
            id: self.id,
            local_rows: self.local_rows,
            local_cols: self.local_cols,
            row_start: self.row_start,
            col_start: self.col_start,
            zero: self.zero.clone(),
            values: self.values.clone(),
        })
    }

    fn make(
        &self,
        id: usize,
        local_rows: usize,
        local_cols: usize,
        row_start: usize,
        col_start: usize,
    ) -> Box<dyn Submatrix<T>> {
        Box::new(BlockSubmatrix::empty(
            self.zero.clone(),
            id,
            local_rows,
            local_cols,
            row_start,
            col_start,
        ))
    }
}
