//! Routing frames wrapped around user payloads.
//!
//! Node ids form an implicit D-ary tree: the root is 0 and the children of
//! node k are `k*D + 1 ..= k*D + D`. Frames produced by dividing a problem
//! inherit root-node id, originator and pool id unchanged.

use crate::serialize::{get_i32, get_i64, put_i32, put_i64, Payload};

/// Sentinel for "no node" / "no process" in frame routing fields.
pub const NONE: i64 = -1;

/// Frame used by the divide-and-conquer solvers.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    /// Node id of this (sub)problem within the computation tree.
    pub id: i64,
    /// Node id under which the owning process expects the solution back.
    pub root_id: i64,
    /// Process that expects to receive the solution for this subtree.
    pub originator: i64,
    /// Which concurrent top-level problem this frame belongs to.
    pub pool_id: i64,
    pub payload: T,
}

impl<T> Frame<T> {
    pub fn new(id: i64, root_id: i64, originator: i64, pool_id: i64, payload: T) -> Self {
        Frame {
            id,
            root_id,
            originator,
            pool_id,
            payload,
        }
    }

    /// Wraps a freshly accepted top-level problem.
    pub fn root(payload: T, pool_id: i64) -> Self {
        Frame::new(0, NONE, NONE, pool_id, payload)
    }

    /// Node id of the first (leftmost) child of `parent` under fan-out `d`.
    pub fn first_child(parent: i64, d: i64) -> i64 {
        parent * d + 1
    }

    /// Node id of the parent of `child` under fan-out `d`.
    pub fn parent_of(child: i64, d: i64) -> i64 {
        (child - 1) / d
    }
}

const FRAME_HEADER: usize = 32;

impl<T: Payload> Payload for Frame<T> {
    fn size(&self) -> usize {
        FRAME_HEADER + self.payload.size()
    }

    fn reduce(&self, buf: &mut [u8]) {
        let at = put_i64(buf, 0, self.id);
        let at = put_i64(buf, at, self.root_id);
        let at = put_i64(buf, at, self.originator);
        let at = put_i64(buf, at, self.pool_id);
        self.payload.reduce(&mut buf[at..]);
    }

    fn expand(buf: &[u8]) -> Self {
        let (id, at) = get_i64(buf, 0);
        let (root_id, at) = get_i64(buf, at);
        let (originator, at) = get_i64(buf, at);
        let (pool_id, at) = get_i64(buf, at);

        Frame {
            id,
            root_id,
            originator,
            pool_id,
            payload: T::expand(&buf[at..]),
        }
    }
}

/// Frame used by the branch-and-bound solver. On top of the routing fields
/// it tracks how many subproblems a branched node generated and how many of
/// them have been solved; the problem tracker uses these counts for
/// distributed termination detection.
#[derive(Debug, Clone, PartialEq)]
pub struct BbFrame<T> {
    pub id: i64,
    /// Arena handle of the parent node in the originator's tracker.
    pub parent: i64,
    pub originator: i64,
    pub subproblems: i32,
    pub solved: i32,
    pub payload: T,
}

impl<T> BbFrame<T> {
    pub fn new(id: i64, parent: i64, originator: i64, payload: T) -> Self {
        BbFrame {
            id,
            parent,
            originator,
            subproblems: 0,
            solved: 0,
            payload,
        }
    }

    /// The fixed-size accounting part of this frame.
    pub fn note(&self) -> SolvedNote {
        SolvedNote {
            id: self.id,
            parent: self.parent,
            originator: self.originator,
        }
    }
}

const BB_HEADER: usize = 32;

impl<T: Payload> Payload for BbFrame<T> {
    fn size(&self) -> usize {
        BB_HEADER + self.payload.size()
    }

    fn reduce(&self, buf: &mut [u8]) {
        let at = put_i64(buf, 0, self.id);
        let at = put_i64(buf, at, self.parent);
        let at = put_i64(buf, at, self.originator);
        let at = put_i32(buf, at, self.subproblems);
        let at = put_i32(buf, at, self.solved);
        self.payload.reduce(&mut buf[at..]);
    }

    fn expand(buf: &[u8]) -> Self {
        let (id, at) = get_i64(buf, 0);
        let (parent, at) = get_i64(buf, at);
        let (originator, at) = get_i64(buf, at);
        let (subproblems, at) = get_i32(buf, at);
        let (solved, at) = get_i32(buf, at);

        BbFrame {
            id,
            parent,
            originator,
            subproblems,
            solved,
            payload: T::expand(&buf[at..]),
        }
    }
}

/// The payload-free notification that a subproblem has been fully solved,
/// shipped back to its originator for tracker accounting. Fixed 24 bytes,
/// so it travels without a handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolvedNote {
    pub id: i64,
    pub parent: i64,
    pub originator: i64,
}

impl Payload for SolvedNote {
    fn size(&self) -> usize {
        24
    }

    fn reduce(&self, buf: &mut [u8]) {
        let at = put_i64(buf, 0, self.id);
        let at = put_i64(buf, at, self.parent);
        put_i64(buf, at, self.originator);
    }

    fn expand(buf: &[u8]) -> Self {
        let (id, at) = get_i64(buf, 0);
        let (parent, at) = get_i64(buf, at);
        let (originator, _) = get_i64(buf, at);

        SolvedNote {
            id,
            parent,
            originator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_id_arithmetic() {
        let cases: Vec<(i64, i64, i64)> = vec![
            // (parent, fan-out, first child)
            (0, 2, 1),
            (0, 3, 1),
            (1, 2, 3),
            (2, 2, 5),
            (4, 3, 13),
        ];

        for (parent, d, first) in cases {
            assert_eq!(Frame::<()>::first_child(parent, d), first);
            for child in first..first + d {
                assert_eq!(Frame::<()>::parent_of(child, d), parent);
            }
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::new(7, 1, 3, 0, -42i64);
        let mut buf = vec![0u8; frame.size()];
        frame.reduce(&mut buf);
        assert_eq!(Frame::<i64>::expand(&buf), frame);
    }

    #[test]
    fn test_bb_frame_round_trip() {
        let mut frame = BbFrame::new(9, 2, 1, 5.5f64);
        frame.subproblems = 4;
        frame.solved = 3;

        let mut buf = vec![0u8; frame.size()];
        frame.reduce(&mut buf);
        assert_eq!(BbFrame::<f64>::expand(&buf), frame);
    }

    #[test]
    fn test_solved_note_is_fixed_size() {
        let note = SolvedNote {
            id: 3,
            parent: 0,
            originator: 2,
        };
        assert_eq!(note.size(), 24);

        let mut buf = vec![0u8; 24];
        note.reduce(&mut buf);
        assert_eq!(SolvedNote::expand(&buf), note);
    }
}
