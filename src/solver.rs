//! Decentralized solver skeletons.
//!
//! A solver skeleton groups several cooperating solver processes. The first
//! solver is the master: it accepts top-level problems from the stage's
//! predecessors and emits finished solutions to its successors. All solvers
//! exchange subproblems, partial solutions and control messages among each
//! other while the computation runs.

pub mod bb;
pub mod dc;
pub mod stream;

use crate::serialize::Payload;
use crate::transport::ProcessId;

/// User functions of the branch-and-bound skeleton.
pub trait BranchBound: Send + Sync {
    type Problem: Payload + Clone;

    /// Splits a problem into subproblems. Returning an empty vector marks
    /// the problem as infeasible.
    fn branch(&self, problem: &Self::Problem) -> Vec<Self::Problem>;

    /// Tightens the problem's lower bound in place. May turn the problem
    /// into a solution.
    fn bound(&self, problem: &mut Self::Problem);

    /// Strict ordering: true if `a` must be preferred over `b`.
    fn better_than(&self, a: &Self::Problem, b: &Self::Problem) -> bool;

    fn is_solution(&self, problem: &Self::Problem) -> bool;

    fn lower_bound(&self, problem: &Self::Problem) -> i64;
}

/// User functions of the divide-and-conquer skeletons.
pub trait DivideConquer: Send + Sync {
    type Problem: Payload + Clone;
    type Solution: Payload + Clone;

    fn is_simple(&self, problem: &Self::Problem) -> bool;

    /// Splits a problem into exactly `fan_out` subproblems.
    fn divide(&self, problem: Self::Problem) -> Vec<Self::Problem>;

    /// Solves a simple problem.
    fn solve(&self, problem: Self::Problem) -> Self::Solution;

    /// Folds a complete sibling group, ordered by node id.
    fn combine(&self, parts: Vec<Self::Solution>) -> Self::Solution;
}

/// Load-balancing neighbourhood of the branch-and-bound solvers. Incumbents
/// and STOP always travel all-to-all; only work exchange is restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    AllToAll,
    /// Requires a power-of-two solver count.
    Hypercube,
    /// Bidirectional ring.
    Ring,
}

impl Topology {
    /// The workmate entrances of the solver at `position` among `peers`.
    pub(crate) fn workmates(self, peers: &[ProcessId], position: usize) -> Vec<ProcessId> {
        let n = peers.len();

        match self {
            Topology::AllToAll => peers.to_vec(),
            Topology::Hypercube => {
                assert!(n.is_power_of_two(), "hypercube needs 2^k solvers");
                (0..n.trailing_zeros())
                    .map(|bit| peers[position ^ (1 << bit)])
                    .collect()
            }
            Topology::Ring => {
                vec![peers[(position + n - 1) % n], peers[(position + 1) % n]]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hypercube_workmates() {
        let peers: Vec<ProcessId> = (10..18).collect();

        let mates = Topology::Hypercube.workmates(&peers, 5);
        // 5 ^ 1 = 4, 5 ^ 2 = 7, 5 ^ 4 = 1
        assert_eq!(mates, vec![14, 17, 11]);
    }

    #[test]
    fn test_ring_workmates() {
        let peers: Vec<ProcessId> = (0..4).collect();

        assert_eq!(Topology::Ring.workmates(&peers, 0), vec![3, 1]);
        assert_eq!(Topology::Ring.workmates(&peers, 2), vec![1, 3]);
    }

    #[test]
    fn test_all_to_all_includes_everyone() {
        let peers: Vec<ProcessId> = vec![2, 5, 9];
        assert_eq!(Topology::AllToAll.workmates(&peers, 1), peers);
    }
}
