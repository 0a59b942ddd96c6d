//! Distribution policies: which process owns which submatrix.
//!
//! A policy is a pure function of the submatrix id and the layout
//! parameters. Policies are cloneable prototype objects so a matrix can
//! carry its policy around and hand copies to derived matrices.

use crate::matrix::index::Partition;
use crate::transport::ProcessId;

/// Layout parameters a policy may consult.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub processes: usize,
    pub partition: Partition,
}

impl Layout {
    pub fn max_submatrices(&self) -> usize {
        self.partition.max_submatrices()
    }
}

pub trait Distribution: Send + Sync {
    /// The process id owning the submatrix with the given id; always in
    /// `[0, layout.processes)`.
    fn owner(&self, submatrix: usize, layout: &Layout) -> ProcessId;

    fn clone_box(&self) -> Box<dyn Distribution>;
}

/// Two policies are equal iff they assign the same owner to every
/// submatrix id of the layout.
pub fn distributions_equal(
    a: &dyn Distribution,
    b: &dyn Distribution,
    layout: &Layout,
) -> bool {
    (0..layout.max_submatrices()).all(|id| a.owner(id, layout) == b.owner(id, layout))
}

/// Deals submatrices out one by one: `owner(id) = id mod np`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinDistribution;

impl Distribution for RoundRobinDistribution {
    fn owner(&self, submatrix: usize, layout: &Layout) -> ProcessId {
        submatrix % layout.processes
    }

    fn clone_box(&self) -> Box<dyn Distribution> {
        Box::new(*self)
    }
}

/// All submatrices of one grid row share an owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowDistribution;

impl Distribution for RowDistribution {
    fn owner(&self, submatrix: usize, layout: &Layout) -> ProcessId {
        (submatrix / layout.partition.per_row()) % layout.processes
    }

    fn clone_box(&self) -> Box<dyn Distribution> {
        Box::new(*self)
    }
}

/// All submatrices of one grid column share an owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnDistribution;

impl Distribution for ColumnDistribution {
    fn owner(&self, submatrix: usize, layout: &Layout) -> ProcessId {
        (submatrix % layout.partition.per_row()) % layout.processes
    }

    fn clone_box(&self) -> Box<dyn Distribution> {
        Box::new(*self)
    }
}

/// Splits the id range into `np` contiguous blocks: leading blocks hold
/// ceil(max/np) ids, trailing blocks floor(max/np).
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockDistribution;

impl BlockDistribution {
    fn big_block_size(layout: &Layout) -> usize {
        layout.max_submatrices().div_ceil(layout.processes)
    }

    fn big_block_count(layout: &Layout) -> usize {
        let max = layout.max_submatrices();
        let np = layout.processes;

        if max % np == 0 {
            max / Self::big_block_size(layout)
        } else {
            let small = max / np;
            (max - np * small) / (Self::big_block_size(layout) - small)
        }
    }
}

impl Distribution for BlockDistribution {
    fn owner(&self, submatrix: usize, layout: &Layout) -> ProcessId {
        let big = Self::big_block_size(layout);
        let big_blocks = Self::big_block_count(layout);
        let in_big_blocks = big_blocks * big;

        if submatrix < in_big_blocks {
            submatrix / big
        } else {
            let small = layout.max_submatrices() / layout.processes;
            (submatrix - in_big_blocks) / small + big_blocks
        }
    }

    fn clone_box(&self) -> Box<dyn Distribution> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(np: usize, n: usize, m: usize, r: usize, c: usize) -> Layout {
        Layout {
            processes: np,
            partition: Partition::new(n, m, r, c),
        }
    }

    fn policies() -> Vec<Box<dyn Distribution>> {
        vec![
            Box::new(RoundRobinDistribution),
            Box::new(RowDistribution),
            Box::new(ColumnDistribution),
            Box::new(BlockDistribution),
        ]
    }

    #[test]
    fn test_every_owner_is_a_valid_process() {
        let layouts = [
            layout(1, 4, 4, 2, 2),
            layout(3, 10, 10, 3, 3),
            layout(4, 16, 16, 2, 2),
            layout(5, 7, 9, 2, 4),
            layout(7, 20, 5, 6, 1),
        ];

        for layout in &layouts {
            for policy in policies() {
                for id in 0..layout.max_submatrices() {
                    let owner = policy.owner(id, layout);
                    assert!(
                        owner < layout.processes,
                        "owner {} out of range for id {}",
                        owner,
                        id
                    );
                }
            }
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let layout = layout(3, 8, 8, 2, 2);
        let owners: Vec<_> = (0..8)
            .map(|id| RoundRobinDistribution.owner(id, &layout))
            .collect();
        assert_eq!(owners, vec![0, 1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_row_and_column_distributions() {
        // 4x4 at 2x2 over 2 processes: grid row 0 holds ids 0, 1.
        let layout = layout(2, 4, 4, 2, 2);

        assert_eq!(RowDistribution.owner(0, &layout), 0);
        assert_eq!(RowDistribution.owner(1, &layout), 0);
        assert_eq!(RowDistribution.owner(2, &layout), 1);
        assert_eq!(RowDistribution.owner(3, &layout), 1);

        assert_eq!(ColumnDistribution.owner(0, &layout), 0);
        assert_eq!(ColumnDistribution.owner(1, &layout), 1);
        assert_eq!(ColumnDistribution.owner(2, &layout), 0);
        assert_eq!(ColumnDistribution.owner(3, &layout), 1);
    }

    #[test]
    fn test_block_distribution_sizes() {
        // 10 ids over 4 processes: blocks of 3, 3, 2, 2.
        let layout = layout(4, 10, 2, 1, 2);
        assert_eq!(layout.max_submatrices(), 10);

        let owners: Vec<_> = (0..10)
            .map(|id| BlockDistribution.owner(id, &layout))
            .collect();
        assert_eq!(owners, vec![0, 0, 0, 1, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_policy_equality_is_pointwise() {
        // On a single-column grid, row-major ids make the row policy agree
        // with round-robin.
        let single_column = layout(2, 8, 2, 2, 2);
        assert!(distributions_equal(
            &RowDistribution,
            &RoundRobinDistribution,
            &single_column,
        ));

        let square = layout(2, 8, 8, 2, 2);
        assert!(!distributions_equal(
            &RowDistribution,
            &RoundRobinDistribution,
            &square,
        ));
    }
}
