//! Distributed sparse matrix.
//!
//! An n x m matrix is partitioned into r x c submatrices, numbered
//! row-major over the grid and distributed across all processes by a
//! pluggable policy. A submatrix holding only zeros is not stored at all.
//! Every skeleton applies its user function to the locally stored
//! submatrices on a fork-join thread pool and then synchronizes with a
//! collective over the point-to-point transport, so all participating
//! processes must call the same skeletons in the same order.

pub mod distribution;
pub mod index;
pub mod submatrix;

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::collective::{allgather, allreduce, allreduce_index, broadcast};
use crate::error::{Result, SkeletonError};
use crate::matrix::distribution::{Distribution, Layout};
use crate::matrix::index::Partition;
use crate::matrix::submatrix::Submatrix;
use crate::runtime::ProcessCtx;
use crate::serialize::Payload;
use crate::transport::{Endpoint, ProcessId, Tag};

/// Everything a matrix element must support: byte transport, comparison
/// against the zero element and travel between fork-join threads.
pub trait Element: Payload + Clone + PartialEq + Send + Sync + 'static {}

impl<T: Payload + Clone + PartialEq + Send + Sync + 'static> Element for T {}

pub struct DistributedSparseMatrix<'a, T: Element> {
    endpoint: &'a Endpoint,
    /// Participating process ids; position k is matrix rank k.
    ids: Vec<ProcessId>,
    rank: usize,
    layout: Layout,
    zero: T,
    distribution: Box<dyn Distribution>,
    prototype: Box<dyn Submatrix<T>>,
    submatrices: BTreeMap<usize, Box<dyn Submatrix<T>>>,
}

impl<'a, T: Element> DistributedSparseMatrix<'a, T> {
    /// Creates an empty matrix spanning all processes of the runtime.
    pub fn new(
        ctx: &'a ProcessCtx,
        rows: usize,
        cols: usize,
        submatrix_rows: usize,
        submatrix_cols: usize,
        zero: T,
        distribution: Box<dyn Distribution>,
        prototype: Box<dyn Submatrix<T>>,
    ) -> Self {
        let ids: Vec<ProcessId> = (0..ctx.processes()).collect();
        let layout = Layout {
            processes: ids.len(),
            partition: Partition::new(rows, cols, submatrix_rows, submatrix_cols),
        };

        DistributedSparseMatrix {
            endpoint: ctx.endpoint(),
            rank: ctx.id(),
            ids,
            layout,
            zero,
            distribution,
            prototype,
            submatrices: BTreeMap::new(),
        }
    }

    /// Creates a matrix from a dense source; every process extracts the
    /// submatrices it owns, skipping the all-zero ones.
    #[allow(clippy::too_many_arguments)]
    pub fn from_dense(
        ctx: &'a ProcessCtx,
        dense: &[Vec<T>],
        submatrix_rows: usize,
        submatrix_cols: usize,
        zero: T,
        distribution: Box<dyn Distribution>,
        prototype: Box<dyn Submatrix<T>>,
    ) -> Self {
        let rows = dense.len();
        let cols = dense.first().map_or(0, Vec::len);

        let mut matrix = Self::new(
            ctx,
            rows,
            cols,
            submatrix_rows,
            submatrix_cols,
            zero,
            distribution,
            prototype,
        );

        for id in 0..matrix.layout.max_submatrices() {
            if !matrix.is_local(id) {
                continue;
            }

            let part = matrix.layout.partition;
            let mut smx = matrix.prototype.make(
                id,
                part.rows_of(id),
                part.cols_of(id),
                part.row_start(id),
                part.col_start(id),
            );

            for i in 0..part.rows_of(id) {
                for j in 0..part.cols_of(id) {
                    let value = dense[part.row_start(id) + i][part.col_start(id) + j].clone();
                    if value != matrix.zero {
                        smx.set(value, i, j);
                    }
                }
            }

            if smx.nonzero_count() > 0 {
                matrix.submatrices.insert(id, smx);
            }
        }

        matrix
    }

    /// An empty matrix with the same shape, zero, policy and encoding.
    fn derived(&self) -> Self {
        DistributedSparseMatrix {
            endpoint: self.endpoint,
            ids: self.ids.clone(),
            rank: self.rank,
            layout: self.layout,
            zero: self.zero.clone(),
            distribution: self.distribution.clone_box(),
            prototype: self.prototype.clone_box(),
            submatrices: BTreeMap::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.layout.partition.rows
    }

    pub fn cols(&self) -> usize {
        self.layout.partition.cols
    }

    pub fn zero(&self) -> &T {
        &self.zero
    }

    pub fn submatrix_count(&self) -> usize {
        self.submatrices.len()
    }

    /// Matrix rank of the process owning the given submatrix id.
    pub fn owner_of(&self, submatrix: usize) -> usize {
        self.distribution.owner(submatrix, &self.layout)
    }

    fn is_local(&self, submatrix: usize) -> bool {
        self.owner_of(submatrix) == self.rank
    }

    fn check_bounds(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.rows() || col >= self.cols() {
            return Err(SkeletonError::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            });
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Fork-join plumbing
    // ----------------------------------------------------------------

    /// Folds all local submatrices on a fork-join pool: every worker
    /// thread accumulates its slice into an accumulator created by `init`,
    /// the per-thread accumulators are merged single-threaded.
    fn par_fold_local<A: Send>(
        &self,
        init: impl Fn() -> A + Sync,
        per: impl Fn(&mut A, &dyn Submatrix<T>) + Sync,
        merge: impl Fn(A, A) -> A,
    ) -> A {
        let smxs: Vec<&Box<dyn Submatrix<T>>> = self.submatrices.values().collect();

        if smxs.is_empty() {
            return init();
        }

        let threads = num_cpus::get().clamp(1, smxs.len());
        let chunk = smxs.len().div_ceil(threads);
        let init = &init;
        let per = &per;

        let partials = std::thread::scope(|scope| {
            let handles: Vec<_> = smxs
                .chunks(chunk)
                .map(|batch| {
                    scope.spawn(move || {
                        let mut acc = init();
                        for smx in batch {
                            per(&mut acc, smx.as_ref());
                        }
                        acc
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("fork-join worker panicked"))
                .collect::<Vec<A>>()
        });

        partials
            .into_iter()
            .reduce(merge)
            .unwrap_or_else(init)
    }

    /// Runs `apply` over every local submatrix on a fork-join pool.
    fn par_each_mut(&mut self, apply: impl Fn(&mut dyn Submatrix<T>) + Sync) {
        let mut smxs: Vec<&mut Box<dyn Submatrix<T>>> =
            self.submatrices.values_mut().collect();

        if smxs.is_empty() {
            return;
        }

        let threads = num_cpus::get().clamp(1, smxs.len());
        let chunk = smxs.len().div_ceil(threads);
        let apply = &apply;

        std::thread::scope(|scope| {
            for batch in smxs.chunks_mut(chunk) {
                scope.spawn(move || {
                    for smx in batch.iter_mut() {
                        apply(smx.as_mut());
                    }
                });
            }
        });
    }

    // ----------------------------------------------------------------
    // Element access
    // ----------------------------------------------------------------

    /// Global access: the owner broadcasts the element to everyone.
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        self.check_bounds(row, col)?;

        let at = self.layout.partition.locate(row, col);
        let owner = self.owner_of(at.submatrix);
        let mut value = [self.local_value(row, col)];

        broadcast(self.endpoint, &self.ids, self.ids[owner], &mut value)?;
        let [value] = value;
        Ok(value)
    }

    /// Local access: the stored element on the owner, the zero element on
    /// everyone else. Involves no communication.
    pub fn get_local(&self, row: usize, col: usize) -> Result<T> {
        self.check_bounds(row, col)?;
        Ok(self.local_value(row, col))
    }

    fn local_value(&self, row: usize, col: usize) -> T {
        let at = self.layout.partition.locate(row, col);

        if !self.is_local(at.submatrix) {
            return self.zero.clone();
        }

        match self.submatrices.get(&at.submatrix) {
            Some(smx) => smx.get(at.local_row, at.local_col),
            None => self.zero.clone(),
        }
    }

    /// Stores `value`; only the owning process mutates anything. A missing
    /// submatrix is materialized on demand, one written empty is dropped.
    pub fn set(&mut self, value: T, row: usize, col: usize) -> Result<()> {
        self.check_bounds(row, col)?;

        let at = self.layout.partition.locate(row, col);
        if !self.is_local(at.submatrix) {
            return Ok(());
        }

        if let Some(smx) = self.submatrices.get_mut(&at.submatrix) {
            smx.set(value, at.local_row, at.local_col);
            if smx.nonzero_count() == 0 {
                self.submatrices.remove(&at.submatrix);
            }
            return Ok(());
        }

        if value != self.zero {
            let part = self.layout.partition;
            let mut smx = self.prototype.make(
                at.submatrix,
                part.rows_of(at.submatrix),
                part.cols_of(at.submatrix),
                part.row_start(at.submatrix),
                part.col_start(at.submatrix),
            );
            smx.set(value, at.local_row, at.local_col);
            self.submatrices.insert(at.submatrix, smx);
        }

        Ok(())
    }

    /// Re-compresses all local submatrices and drops the empty ones.
    pub fn pack(&mut self) {
        self.par_each_mut(|smx| smx.pack());
        self.submatrices.retain(|_, smx| smx.nonzero_count() > 0);
    }

    /// Global number of stored non-zero elements.
    pub fn element_count(&self) -> Result<usize> {
        self.element_count_by(|_| true)
    }

    /// Global number of stored non-zero elements matching the predicate.
    pub fn element_count_by(&self, pred: impl Fn(&T) -> bool + Sync) -> Result<usize> {
        let zero = &self.zero;
        let local = self.par_fold_local(
            || 0u64,
            |acc, smx| {
                for k in 0..smx.stored() {
                    let value = smx.value_at(k);
                    if value != *zero && pred(&value) {
                        *acc += 1;
                    }
                }
            },
            |a, b| a + b,
        );

        let mut buf = [local];
        allreduce(self.endpoint, &self.ids, &mut buf, |a, b| a + b)?;
        Ok(buf[0] as usize)
    }

    // ----------------------------------------------------------------
    // Map
    // ----------------------------------------------------------------

    /// Applies `f` to every stored element into a fresh matrix of the same
    /// shape and distribution. Zero outputs are not stored.
    pub fn map(&self, f: impl Fn(&T) -> T + Sync) -> Self {
        self.map_index(|value, _, _| f(value))
    }

    /// Like [`map`](Self::map), passing the global (row, col) as well.
    pub fn map_index(&self, f: impl Fn(&T, usize, usize) -> T + Sync) -> Self {
        let mut result = self.derived();
        let zero = &self.zero;
        let prototype = &self.prototype;

        let mapped = self.par_fold_local(
            Vec::new,
            |out: &mut Vec<(usize, Box<dyn Submatrix<T>>)>, smx| {
                let mut fresh = prototype.make(
                    smx.id(),
                    smx.local_rows(),
                    smx.local_cols(),
                    smx.row_start(),
                    smx.col_start(),
                );

                for k in 0..smx.stored() {
                    let value = smx.value_at(k);
                    if value == *zero {
                        continue;
                    }

                    let mapped = f(&value, smx.global_row_of(k), smx.global_col_of(k));
                    if mapped != *zero {
                        fresh.set(mapped, smx.local_row_of(k), smx.local_col_of(k));
                    }
                }

                if fresh.nonzero_count() > 0 {
                    out.push((smx.id(), fresh));
                }
            },
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
        );

        result.submatrices.extend(mapped);
        result
    }

    /// In-place variant of [`map`](Self::map).
    pub fn map_in_place(&mut self, f: impl Fn(&T) -> T + Sync) {
        self.map_index_in_place(|value, _, _| f(value));
    }

    /// In-place variant of [`map_index`](Self::map_index).
    pub fn map_index_in_place(&mut self, f: impl Fn(&T, usize, usize) -> T + Sync) {
        self.par_each_mut(|smx| {
            for k in 0..smx.stored() {
                let value = smx.value_at(k);
                let mapped = f(&value, smx.global_row_of(k), smx.global_col_of(k));
                smx.set_value_at(mapped, k);
            }
            smx.pack();
        });
        self.submatrices.retain(|_, smx| smx.nonzero_count() > 0);
    }

    /// Applies `f` to the stored elements of one global row.
    pub fn map_in_place_row(&mut self, f: impl Fn(&T) -> T + Sync, row: usize) -> Result<()> {
        self.check_bounds(row, 0)?;

        self.par_each_mut(|smx| {
            if !smx.row_is_local(row) {
                return;
            }

            for k in 0..smx.stored() {
                if smx.global_row_of(k) == row {
                    let mapped = f(&smx.value_at(k));
                    smx.set_value_at(mapped, k);
                }
            }
            smx.pack();
        });
        self.submatrices.retain(|_, smx| smx.nonzero_count() > 0);

        Ok(())
    }

    // ----------------------------------------------------------------
    // Fold
    // ----------------------------------------------------------------

    /// Folds all stored elements with `f` and allreduces the per-process
    /// results. `f` must be associative with the zero element as identity;
    /// sparse storage omits zeros, so anything else folds undefined.
    pub fn fold(&self, f: impl Fn(&T, &T) -> T + Sync) -> Result<T> {
        let zero = &self.zero;
        let local = self.par_fold_local(
            || zero.clone(),
            |acc, smx| {
                for k in 0..smx.stored() {
                    *acc = f(acc, &smx.value_at(k));
                }
            },
            |a, b| f(&a, &b),
        );

        let mut buf = [local];
        allreduce(self.endpoint, &self.ids, &mut buf, &f)?;
        let [folded] = buf;
        Ok(folded)
    }

    /// Indexed fold: locally `f` sees the element's global (row, col);
    /// during the cross-process reduction both indices are -1.
    pub fn fold_index(&self, f: impl Fn(&T, &T, i64, i64) -> T + Sync) -> Result<T> {
        let zero = &self.zero;
        let local = self.par_fold_local(
            || zero.clone(),
            |acc, smx| {
                for k in 0..smx.stored() {
                    *acc = f(
                        acc,
                        &smx.value_at(k),
                        smx.global_row_of(k) as i64,
                        smx.global_col_of(k) as i64,
                    );
                }
            },
            |a, b| f(&a, &b, -1, -1),
        );

        let mut buf = [local];
        allreduce(self.endpoint, &self.ids, &mut buf, |a, b| f(a, b, -1, -1))?;
        let [folded] = buf;
        Ok(folded)
    }

    /// Folds every column into a length-m vector.
    pub fn fold_columns(&self, f: impl Fn(&T, &T) -> T + Sync) -> Result<Vec<T>> {
        let cols = self.cols();
        let zero = &self.zero;

        let mut local = self.par_fold_local(
            || vec![zero.clone(); cols],
            |acc, smx| {
                for k in 0..smx.stored() {
                    let at = smx.global_col_of(k);
                    acc[at] = f(&acc[at], &smx.value_at(k));
                }
            },
            |mut a, b| {
                for (slot, value) in a.iter_mut().zip(&b) {
                    *slot = f(slot, value);
                }
                a
            },
        );

        allreduce(self.endpoint, &self.ids, &mut local, &f)?;
        Ok(local)
    }

    /// Folds every row into a length-n vector.
    pub fn fold_rows(&self, f: impl Fn(&T, &T) -> T + Sync) -> Result<Vec<T>> {
        let rows = self.rows();
        let zero = &self.zero;

        let mut local = self.par_fold_local(
            || vec![zero.clone(); rows],
            |acc, smx| {
                for k in 0..smx.stored() {
                    let at = smx.global_row_of(k);
                    acc[at] = f(&acc[at], &smx.value_at(k));
                }
            },
            |mut a, b| {
                for (slot, value) in a.iter_mut().zip(&b) {
                    *slot = f(slot, value);
                }
                a
            },
        );

        allreduce(self.endpoint, &self.ids, &mut local, &f)?;
        Ok(local)
    }

    /// Indexed column fold; during the cross-process merge `f` receives
    /// the buffer position as the column and -1 for the row.
    pub fn fold_columns_index(
        &self,
        f: impl Fn(&T, &T, i64, i64) -> T + Sync,
    ) -> Result<Vec<T>> {
        let cols = self.cols();
        let zero = &self.zero;

        let mut local = self.par_fold_local(
            || vec![zero.clone(); cols],
            |acc, smx| {
                for k in 0..smx.stored() {
                    let at = smx.global_col_of(k);
                    acc[at] = f(
                        &acc[at],
                        &smx.value_at(k),
                        smx.global_row_of(k) as i64,
                        at as i64,
                    );
                }
            },
            |mut a, b| {
                for (at, (slot, value)) in a.iter_mut().zip(&b).enumerate() {
                    *slot = f(slot, value, -1, at as i64);
                }
                a
            },
        );

        allreduce_index(self.endpoint, &self.ids, &mut local, |a, b, at| {
            f(a, b, -1, at as i64)
        })?;
        Ok(local)
    }

    /// Indexed row fold; mirror image of
    /// [`fold_columns_index`](Self::fold_columns_index).
    pub fn fold_rows_index(&self, f: impl Fn(&T, &T, i64, i64) -> T + Sync) -> Result<Vec<T>> {
        let rows = self.rows();
        let zero = &self.zero;

        let mut local = self.par_fold_local(
            || vec![zero.clone(); rows],
            |acc, smx| {
                for k in 0..smx.stored() {
                    let at = smx.global_row_of(k);
                    acc[at] = f(
                        &acc[at],
                        &smx.value_at(k),
                        at as i64,
                        smx.global_col_of(k) as i64,
                    );
                }
            },
            |mut a, b| {
                for (at, (slot, value)) in a.iter_mut().zip(&b).enumerate() {
                    *slot = f(slot, value, at as i64, -1);
                }
                a
            },
        );

        allreduce_index(self.endpoint, &self.ids, &mut local, |a, b, at| {
            f(a, b, at as i64, -1)
        })?;
        Ok(local)
    }

    // ----------------------------------------------------------------
    // Zip
    // ----------------------------------------------------------------

    /// Combines two matrices of identical shape and partitioning
    /// elementwise into a new matrix. Positions where both sides hold the
    /// zero element are skipped entirely.
    pub fn zip(&self, other: &Self, f: impl Fn(&T, &T) -> T + Sync) -> Self {
        self.zip_index(other, |a, b, _, _| f(a, b))
    }

    /// Like [`zip`](Self::zip), passing the global (row, col) as well.
    pub fn zip_index(&self, other: &Self, f: impl Fn(&T, &T, usize, usize) -> T + Sync) -> Self {
        assert_eq!(
            self.layout.partition, other.layout.partition,
            "zip requires matching dimensions and partitioning"
        );

        let mut result = self.derived();

        // Submatrix ids present on either side and owned here.
        let candidates: Vec<usize> = self
            .submatrices
            .keys()
            .chain(other.submatrices.keys())
            .copied()
            .filter(|&id| self.is_local(id))
            .sorted_unstable()
            .dedup()
            .collect();

        if candidates.is_empty() {
            return result;
        }

        let part = self.layout.partition;
        let zero = &self.zero;
        let prototype = &self.prototype;
        let mine = &self.submatrices;
        let theirs = &other.submatrices;
        let f = &f;

        let threads = num_cpus::get().clamp(1, candidates.len());
        let chunk = candidates.len().div_ceil(threads);

        let zipped = std::thread::scope(|scope| {
            let handles: Vec<_> = candidates
                .chunks(chunk)
                .map(|batch| {
                    scope.spawn(move || {
                        let mut out: Vec<(usize, Box<dyn Submatrix<T>>)> = Vec::new();

                        for &id in batch {
                            let a_smx = mine.get(&id);
                            let b_smx = theirs.get(&id);
                            let mut fresh = prototype.make(
                                id,
                                part.rows_of(id),
                                part.cols_of(id),
                                part.row_start(id),
                                part.col_start(id),
                            );

                            for i in 0..part.rows_of(id) {
                                for j in 0..part.cols_of(id) {
                                    let a = a_smx.map_or(zero.clone(), |smx| smx.get(i, j));
                                    let b = b_smx.map_or(zero.clone(), |smx| smx.get(i, j));

                                    if a == *zero && b == *zero {
                                        continue;
                                    }

                                    let value = f(
                                        &a,
                                        &b,
                                        part.row_start(id) + i,
                                        part.col_start(id) + j,
                                    );
                                    if value != *zero {
                                        fresh.set(value, i, j);
                                    }
                                }
                            }

                            if fresh.nonzero_count() > 0 {
                                out.push((id, fresh));
                            }
                        }

                        out
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|h| h.join().expect("fork-join worker panicked"))
                .collect::<Vec<_>>()
        });

        result.submatrices.extend(zipped);
        result
    }

    /// In-place variant of [`zip`](Self::zip); mutates the callee.
    pub fn zip_in_place(&mut self, other: &Self, f: impl Fn(&T, &T) -> T + Sync) {
        self.zip_index_in_place(other, |a, b, _, _| f(a, b));
    }

    /// In-place variant of [`zip_index`](Self::zip_index).
    pub fn zip_index_in_place(
        &mut self,
        other: &Self,
        f: impl Fn(&T, &T, usize, usize) -> T + Sync,
    ) {
        assert_eq!(
            self.layout.partition, other.layout.partition,
            "zip requires matching dimensions and partitioning"
        );

        // Materialize submatrices that only the peer has, so the parallel
        // pass below can mutate a fixed local set.
        let part = self.layout.partition;
        for (&id, _) in other.submatrices.iter() {
            if self.is_local(id) && !self.submatrices.contains_key(&id) {
                let fresh = self.prototype.make(
                    id,
                    part.rows_of(id),
                    part.cols_of(id),
                    part.row_start(id),
                    part.col_start(id),
                );
                self.submatrices.insert(id, fresh);
            }
        }

        let zero = self.zero.clone();
        let peer = &other.submatrices;

        self.par_each_mut(|smx| {
            let theirs = peer.get(&smx.id());

            for i in 0..smx.local_rows() {
                for j in 0..smx.local_cols() {
                    let a = smx.get(i, j);
                    let b = theirs.map_or(zero.clone(), |t| t.get(i, j));

                    if a == zero && b == zero {
                        continue;
                    }

                    let row = smx.row_start() + i;
                    let col = smx.col_start() + j;
                    smx.set(f(&a, &b, row, col), i, j);
                }
            }
        });

        self.submatrices.retain(|_, smx| smx.nonzero_count() > 0);
    }

    // ----------------------------------------------------------------
    // Filter
    // ----------------------------------------------------------------

    /// Collects the non-zero outputs of `f` over all stored non-zero
    /// elements, globally. Every process broadcasts its local catch in
    /// turn, terminated by a zero-element sentinel, so all processes end
    /// up with the same array; ordering across processes follows rank, not
    /// row-major position.
    pub fn filter(&self, f: impl Fn(&T) -> T + Sync) -> Result<Vec<T>> {
        self.filter_slots(|smx, k| Some(f(&smx.value_at(k))))
    }

    /// Like [`filter`](Self::filter), passing the global (row, col).
    pub fn filter_index(&self, f: impl Fn(&T, usize, usize) -> T + Sync) -> Result<Vec<T>> {
        self.filter_slots(|smx, k| {
            Some(f(&smx.value_at(k), smx.global_row_of(k), smx.global_col_of(k)))
        })
    }

    /// Restricts the scan to one global row.
    pub fn filter_row(
        &self,
        f: impl Fn(&T, usize, usize) -> T + Sync,
        row: usize,
    ) -> Result<Vec<T>> {
        self.check_bounds(row, 0)?;
        self.filter_slots(|smx, k| {
            (smx.global_row_of(k) == row)
                .then(|| f(&smx.value_at(k), smx.global_row_of(k), smx.global_col_of(k)))
        })
    }

    /// Restricts the scan to one global column.
    pub fn filter_column(
        &self,
        f: impl Fn(&T, usize, usize) -> T + Sync,
        col: usize,
    ) -> Result<Vec<T>> {
        self.check_bounds(0, col)?;
        self.filter_slots(|smx, k| {
            (smx.global_col_of(k) == col)
                .then(|| f(&smx.value_at(k), smx.global_row_of(k), smx.global_col_of(k)))
        })
    }

    fn filter_slots(
        &self,
        f: impl Fn(&dyn Submatrix<T>, usize) -> Option<T> + Sync,
    ) -> Result<Vec<T>> {
        let zero = &self.zero;

        let local = self.par_fold_local(
            Vec::new,
            |out: &mut Vec<T>, smx| {
                for k in 0..smx.stored() {
                    if smx.value_at(k) == *zero {
                        continue;
                    }

                    if let Some(value) = f(smx, k) {
                        if value != *zero {
                            out.push(value);
                        }
                    }
                }
            },
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
        );

        // Round-robin broadcast: each process in rank order publishes its
        // catch, closed off by the zero sentinel.
        let mut collected = Vec::new();

        for sender in 0..self.ids.len() {
            if sender == self.rank {
                for value in &local {
                    let mut buf = [value.clone()];
                    broadcast(self.endpoint, &self.ids, self.ids[sender], &mut buf)?;
                    let [value] = buf;
                    collected.push(value);
                }

                let mut sentinel = [self.zero.clone()];
                broadcast(self.endpoint, &self.ids, self.ids[sender], &mut sentinel)?;
            } else {
                loop {
                    let mut buf = [self.zero.clone()];
                    broadcast(self.endpoint, &self.ids, self.ids[sender], &mut buf)?;
                    let [value] = buf;

                    if value == self.zero {
                        break;
                    }
                    collected.push(value);
                }
            }
        }

        Ok(collected)
    }

    // ----------------------------------------------------------------
    // Rotate
    // ----------------------------------------------------------------

    /// Moves the element at (row, c) to (row, (c + steps) mod m) for every
    /// column c. Negative steps rotate leftwards.
    pub fn rotate_row(&mut self, row: usize, steps: i64) -> Result<()> {
        self.check_bounds(row, 0)?;
        self.rotate(row, true, steps)
    }

    /// Moves the element at (r, col) to ((r + steps) mod n, col) for every
    /// row r.
    pub fn rotate_column(&mut self, col: usize, steps: i64) -> Result<()> {
        self.check_bounds(0, col)?;
        self.rotate(col, false, steps)
    }

    /// Rotates every row by a per-row step.
    pub fn rotate_rows(&mut self, f: impl Fn(usize) -> i64) -> Result<()> {
        for row in 0..self.rows() {
            self.rotate(row, true, f(row))?;
        }
        Ok(())
    }

    /// Rotates every column by a per-column step.
    pub fn rotate_columns(&mut self, f: impl Fn(usize) -> i64) -> Result<()> {
        for col in 0..self.cols() {
            self.rotate(col, false, f(col))?;
        }
        Ok(())
    }

    fn rotate(&mut self, fixed: usize, is_row: bool, steps: i64) -> Result<()> {
        let extent = if is_row { self.cols() } else { self.rows() };
        let steps = steps.rem_euclid(extent as i64) as usize;
        if steps == 0 {
            return Ok(());
        }

        let part = self.layout.partition;
        let locate = move |at: usize| {
            if is_row {
                part.locate(fixed, at)
            } else {
                part.locate(at, fixed)
            }
        };

        // Processes storing no part of the line stay out entirely.
        let involved = (0..extent).any(|at| self.is_local(locate(at).submatrix));
        if !involved {
            return Ok(());
        }

        // Snapshot the locally stored values before anything is overwritten.
        let mut line = vec![self.zero.clone(); extent];
        for at in 0..extent {
            let index = locate(at);
            if self.is_local(index.submatrix) {
                if let Some(smx) = self.submatrices.get(&index.submatrix) {
                    line[at] = smx.get(index.local_row, index.local_col);
                }
            }
        }

        for at in 0..extent {
            let target = (at + steps) % extent;
            let sender = self.owner_of(locate(at).submatrix);
            let receiver = self.owner_of(locate(target).submatrix);

            let (row, col) = if is_row {
                (fixed, target)
            } else {
                (target, fixed)
            };

            if self.rank == sender {
                let value = line[at].clone();
                if sender == receiver {
                    self.set(value, row, col)?;
                } else {
                    self.endpoint.send(self.ids[receiver], &value, Tag::Rotate)?;
                }
            } else if self.rank == receiver && sender != receiver {
                let value: T = self.endpoint.receive(self.ids[sender], Tag::Rotate)?;
                self.set(value, row, col)?;
            }
        }

        Ok(())
    }

    // ----------------------------------------------------------------
    // Combine / multiply
    // ----------------------------------------------------------------

    /// For every stored non-zero element at (i, j), folds `f(value,
    /// vector[j])` into position i of the result under `g`. `g` must treat
    /// the zero element as identity. The length-n result is identical on
    /// every process.
    pub fn combine(
        &self,
        vector: &[T],
        f: impl Fn(&T, &T) -> T + Sync,
        g: impl Fn(&T, &T) -> T + Sync,
    ) -> Result<Vec<T>> {
        assert_eq!(vector.len(), self.cols(), "vector length must match columns");

        let rows = self.rows();
        let zero = &self.zero;

        let mut local = self.par_fold_local(
            || vec![zero.clone(); rows],
            |acc, smx| {
                for k in 0..smx.stored() {
                    let value = smx.value_at(k);
                    if value == *zero {
                        continue;
                    }

                    let col = smx.global_col_of(k);
                    if vector[col] == *zero {
                        continue;
                    }

                    let row = smx.global_row_of(k);
                    acc[row] = g(&acc[row], &f(&value, &vector[col]));
                }
            },
            |mut a, b| {
                for (slot, value) in a.iter_mut().zip(&b) {
                    *slot = g(slot, value);
                }
                a
            },
        );

        allreduce(self.endpoint, &self.ids, &mut local, &g)?;
        Ok(local)
    }

    /// Matrix-vector product: [`combine`](Self::combine) with
    /// multiplication and addition.
    pub fn multiply(&self, vector: &[T]) -> Result<Vec<T>>
    where
        T: std::ops::Mul<Output = T> + std::ops::Add<Output = T>,
    {
        self.combine(
            vector,
            |a, b| a.clone() * b.clone(),
            |a, b| a.clone() + b.clone(),
        )
    }

    // ----------------------------------------------------------------
    // Row / column collection
    // ----------------------------------------------------------------

    /// Assembles one global row on every process.
    pub fn get_row(&self, row: usize) -> Result<Vec<T>> {
        self.check_bounds(row, 0)?;

        let mut local = vec![self.zero.clone(); self.cols()];
        for smx in self.submatrices.values() {
            if !smx.row_is_local(row) {
                continue;
            }

            let local_row = row - smx.row_start();
            for j in 0..smx.local_cols() {
                local[smx.col_start() + j] = smx.get(local_row, j);
            }
        }

        self.first_nonzero_across(local)
    }

    /// Assembles one global column on every process.
    pub fn get_column(&self, col: usize) -> Result<Vec<T>> {
        self.check_bounds(0, col)?;

        let mut local = vec![self.zero.clone(); self.rows()];
        for smx in self.submatrices.values() {
            if !smx.col_is_local(col) {
                continue;
            }

            let local_col = col - smx.col_start();
            for i in 0..smx.local_rows() {
                local[smx.row_start() + i] = smx.get(i, local_col);
            }
        }

        self.first_nonzero_across(local)
    }

    /// Allgathers per-process line buffers and keeps, per position, the
    /// first non-zero contribution. Ownership is unique, so at most one
    /// process contributes a non-zero value per position.
    fn first_nonzero_across(&self, local: Vec<T>) -> Result<Vec<T>> {
        let len = local.len();
        let mut gathered = vec![self.zero.clone(); len * self.ids.len()];
        allgather(self.endpoint, &self.ids, &local, &mut gathered)?;

        let mut line = vec![self.zero.clone(); len];
        for (at, slot) in line.iter_mut().enumerate() {
            for contributor in 0..self.ids.len() {
                let value = &gathered[contributor * len + at];
                if *value != self.zero {
                    *slot = value.clone();
                    break;
                }
            }
        }

        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::distribution::{
        distributions_equal, ColumnDistribution, RoundRobinDistribution, RowDistribution,
    };
    use super::submatrix::{BlockSubmatrix, CrsSubmatrix};
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::run;

    /// The 4x4 corner matrix used across the scenarios: value 10 at
    /// (0,0), (0,3), (3,0) and (3,3).
    fn corner_dense() -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; 4]; 4];
        dense[0][0] = 10.0;
        dense[0][3] = 10.0;
        dense[3][0] = 10.0;
        dense[3][3] = 10.0;
        dense
    }

    fn corner_matrix<'a>(ctx: &'a ProcessCtx) -> DistributedSparseMatrix<'a, f64> {
        DistributedSparseMatrix::from_dense(
            ctx,
            &corner_dense(),
            2,
            2,
            0.0,
            Box::new(RoundRobinDistribution),
            Box::new(CrsSubmatrix::prototype(0.0)),
        )
    }

    fn on_four_processes<R: Send>(
        body: impl Fn(&ProcessCtx) -> Result<R> + Send + Sync,
    ) -> Vec<R> {
        run(RuntimeConfig::new(4), body).unwrap()
    }

    #[test]
    fn test_partitioned_corner_matrix() {
        let results = on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            assert_eq!(matrix.get(0, 0)?, 10.0);
            assert_eq!(matrix.get(1, 1)?, 0.0);
            assert_eq!(matrix.get(3, 3)?, 10.0);
            assert_eq!(matrix.element_count()?, 4);
            assert_eq!(matrix.fold(|a, b| a + b)?, 40.0);
            assert_eq!(matrix.fold_rows(|a, b| a + b)?, vec![20.0, 0.0, 0.0, 20.0]);
            assert_eq!(
                matrix.fold_columns(|a, b| a + b)?,
                vec![20.0, 0.0, 0.0, 20.0]
            );
            Ok(())
        });
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn test_matches_dense_source_everywhere() {
        on_four_processes(|ctx| {
            let dense = corner_dense();
            let matrix = corner_matrix(ctx);

            for (i, row) in dense.iter().enumerate() {
                for (j, expected) in row.iter().enumerate() {
                    assert_eq!(matrix.get(i, j)?, *expected);
                }
            }
            Ok(())
        });
    }

    #[test]
    fn test_rotate_row_wraps_and_round_trips() {
        on_four_processes(|ctx| {
            let mut matrix = corner_matrix(ctx);

            // (0,3) wraps to (0,0), displacing (0,0) to (0,1).
            matrix.rotate_row(0, 1)?;
            assert_eq!(matrix.get_row(0)?, vec![10.0, 10.0, 0.0, 0.0]);
            assert_eq!(matrix.get(0, 0)?, 10.0);
            assert_eq!(matrix.get(0, 1)?, 10.0);
            assert_eq!(matrix.get(0, 3)?, 0.0);

            // Rotating back restores the original row.
            matrix.rotate_row(0, -1)?;
            assert_eq!(matrix.get_row(0)?, vec![10.0, 0.0, 0.0, 10.0]);
            Ok(())
        });
    }

    #[test]
    fn test_rotate_column() {
        on_four_processes(|ctx| {
            let mut matrix = corner_matrix(ctx);

            matrix.rotate_column(0, 2)?;
            assert_eq!(matrix.get_column(0)?, vec![0.0, 10.0, 10.0, 0.0]);
            Ok(())
        });
    }

    #[test]
    fn test_map_identity_and_composition() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            let identity = matrix.map(|v| v.clone());
            for i in 0..4 {
                for j in 0..4 {
                    assert_eq!(identity.get(i, j)?, matrix.get(i, j)?);
                }
            }

            // map(f) . map(g) == map(f . g)
            let two_steps = matrix.map(|v| v + 1.0).map(|v| v * 2.0);
            let one_step = matrix.map(|v| (v + 1.0) * 2.0);
            for i in 0..4 {
                for j in 0..4 {
                    assert_eq!(two_steps.get(i, j)?, one_step.get(i, j)?);
                }
            }

            // Folding a mapped matrix folds the mapped elements.
            assert_eq!(matrix.map(|v| v * 3.0).fold(|a, b| a + b)?, 120.0);
            Ok(())
        });
    }

    #[test]
    fn test_map_drops_zero_outputs() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            let cleared = matrix.map(|_| 0.0);
            assert_eq!(cleared.element_count()?, 0);
            assert_eq!(cleared.submatrix_count(), 0);

            let mut in_place = corner_matrix(ctx);
            in_place.map_in_place(|_| 0.0);
            assert_eq!(in_place.element_count()?, 0);
            Ok(())
        });
    }

    #[test]
    fn test_map_index_sees_global_positions() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            // Keep only the main diagonal.
            let diagonal = matrix.map_index(|v, i, j| if i == j { v.clone() } else { 0.0 });
            assert_eq!(diagonal.fold(|a, b| a + b)?, 20.0);
            Ok(())
        });
    }

    #[test]
    fn test_zip_and_zip_in_place() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);
            let doubled = matrix.map(|v| v * 2.0);

            let sum = matrix.zip(&doubled, |a, b| a + b);
            assert_eq!(sum.get(0, 0)?, 30.0);
            assert_eq!(sum.get(1, 1)?, 0.0);
            assert_eq!(sum.fold(|a, b| a + b)?, 120.0);

            // Zipping with the negation cancels everything out.
            let mut cancelled = corner_matrix(ctx);
            let negated = matrix.map(|v| -v);
            cancelled.zip_in_place(&negated, |a, b| a + b);
            assert_eq!(cancelled.element_count()?, 0);
            Ok(())
        });
    }

    #[test]
    fn test_filter_collects_globally() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            let mut caught = matrix.filter(|v| v / 2.0)?;
            caught.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(caught, vec![5.0, 5.0, 5.0, 5.0]);

            let row0 = matrix.filter_row(|v, _, _| v.clone(), 0)?;
            assert_eq!(row0.len(), 2);

            let col1 = matrix.filter_column(|v, _, _| v.clone(), 1)?;
            assert!(col1.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_multiply_basis_vector_extracts_column() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            for k in 0..4 {
                let mut basis = vec![0.0; 4];
                basis[k] = 1.0;

                let product = matrix.multiply(&basis)?;
                assert_eq!(product, matrix.get_column(k)?);
            }
            Ok(())
        });
    }

    #[test]
    fn test_combine_with_custom_operators() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);
            let ones = vec![1.0; 4];

            // f = min(value, x), g = + degenerates to a row-sum of 1s per
            // stored non-zero.
            let result = matrix.combine(&ones, |v, x| v.min(*x), |a, b| a + b)?;
            assert_eq!(result, vec![2.0, 0.0, 0.0, 2.0]);
            Ok(())
        });
    }

    #[test]
    fn test_set_and_pack_maintain_sparsity() {
        on_four_processes(|ctx| {
            let mut matrix = corner_matrix(ctx);

            matrix.set(7.0, 1, 1)?;
            assert_eq!(matrix.get(1, 1)?, 7.0);
            assert_eq!(matrix.element_count()?, 5);

            matrix.set(0.0, 1, 1)?;
            assert_eq!(matrix.get(1, 1)?, 0.0);
            assert_eq!(matrix.element_count()?, 4);

            // Clearing a whole submatrix removes it from the map.
            matrix.set(0.0, 0, 0)?;
            matrix.pack();
            assert_eq!(matrix.element_count()?, 3);
            Ok(())
        });
    }

    #[test]
    fn test_index_out_of_bounds() {
        on_four_processes(|ctx| {
            let matrix = corner_matrix(ctx);

            assert!(matches!(
                matrix.get_local(4, 0),
                Err(SkeletonError::IndexOutOfBounds { row: 4, .. })
            ));
            assert!(matches!(
                matrix.get_local(0, 9),
                Err(SkeletonError::IndexOutOfBounds { col: 9, .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn test_block_encoding_and_other_policies() {
        on_four_processes(|ctx| {
            let matrix = DistributedSparseMatrix::from_dense(
                ctx,
                &corner_dense(),
                2,
                2,
                0.0,
                Box::new(RowDistribution),
                Box::new(BlockSubmatrix::prototype(0.0)),
            );

            assert_eq!(matrix.get(0, 0)?, 10.0);
            assert_eq!(matrix.get(2, 2)?, 0.0);
            assert_eq!(matrix.fold(|a, b| a + b)?, 40.0);
            assert_eq!(matrix.element_count()?, 4);

            let layout = matrix.layout;
            assert!(!distributions_equal(
                &RowDistribution,
                &ColumnDistribution,
                &layout,
            ));
            Ok(())
        });
    }

    #[test]
    fn test_boundary_partition_with_uneven_blocks() {
        run(RuntimeConfig::new(3), |ctx| {
            // 5x7 at 2x3: boundary blocks are smaller.
            let mut dense = vec![vec![0i64; 7]; 5];
            dense[0][0] = 1;
            dense[4][6] = 2;
            dense[2][5] = 3;

            let matrix = DistributedSparseMatrix::from_dense(
                ctx,
                &dense,
                2,
                3,
                0,
                Box::new(RoundRobinDistribution),
                Box::new(CrsSubmatrix::prototype(0)),
            );

            for (i, row) in dense.iter().enumerate() {
                for (j, expected) in row.iter().enumerate() {
                    assert_eq!(matrix.get(i, j)?, *expected);
                }
            }

            assert_eq!(matrix.fold(|a, b| a + b)?, 6);
            assert_eq!(matrix.get_row(2)?, vec![0, 0, 0, 0, 0, 3, 0]);
            assert_eq!(matrix.get_column(6)?, vec![0, 0, 0, 0, 2]);
            Ok(())
        })
        .unwrap();
    }
}
