//! Distributed termination bookkeeping for the branch-and-bound solver.
//!
//! Every branched problem is registered here together with the number of
//! subproblems it generated. Solving a subproblem bumps its parent's solved
//! count; once all children of a node are accounted for, the node itself
//! counts as solved and the notification climbs towards the root. A node
//! whose originator is another process is not resolved locally: its note is
//! queued for shipping back to the originator instead.
//!
//! Parents are referenced through arena indices, not pointers. The index is
//! only meaningful on the originating process, which is the sole process
//! that ever dereferences it; frames migrating elsewhere carry it as an
//! opaque handle.

use std::collections::VecDeque;

use crate::frame::{SolvedNote, NONE};

struct Tracked {
    id: i64,
    parent: i64,
    originator: i64,
    subproblems: i32,
    solved: i32,
}

pub struct ProblemTracker {
    slots: Vec<Option<Tracked>>,
    free: Vec<usize>,
    live: usize,
    solved_queue: VecDeque<SolvedNote>,
    me: i64,
}

impl ProblemTracker {
    pub fn new(me: i64) -> Self {
        ProblemTracker {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            solved_queue: VecDeque::new(),
            me,
        }
    }

    /// No problem is waiting for children anymore.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// Registers a branched problem and returns its arena handle; children
    /// carry the handle in their parent field.
    pub fn add_problem(&mut self, note: SolvedNote, subproblems: i32) -> i64 {
        let tracked = Tracked {
            id: note.id,
            parent: note.parent,
            originator: note.originator,
            subproblems,
            solved: 0,
        };

        let at = match self.free.pop() {
            Some(at) => {
                self.slots[at] = Some(tracked);
                at
            }
            None => {
                self.slots.push(Some(tracked));
                self.slots.len() - 1
            }
        };

        self.live += 1;
        at as i64
    }

    /// Accounts one solved subproblem, collapsing completed parents all the
    /// way up. Notes belonging to a remote originator are queued for
    /// shipment instead of being resolved here.
    pub fn problem_solved(&mut self, mut note: SolvedNote) {
        loop {
            if note.id == 0 {
                // The root has no tracked parent.
                return;
            }

            if note.originator != self.me {
                self.solved_queue.push_back(note);
                return;
            }

            debug_assert!(note.parent != NONE, "non-root frame without parent");
            let at = note.parent as usize;
            let entry = self.slots[at].as_mut().expect("tracked parent handle");
            entry.solved += 1;

            if entry.solved < entry.subproblems {
                return;
            }

            // Parent complete: free its slot and climb.
            let done = self.slots[at].take().expect("tracked parent handle");
            self.free.push(at);
            self.live -= 1;
            note = SolvedNote {
                id: done.id,
                parent: done.parent,
                originator: done.originator,
            };
        }
    }

    pub fn solved_queue_is_empty(&self) -> bool {
        self.solved_queue.is_empty()
    }

    pub fn peek_outgoing(&self) -> Option<&SolvedNote> {
        self.solved_queue.front()
    }

    pub fn pop_outgoing(&mut self) -> Option<SolvedNote> {
        self.solved_queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: i64, parent: i64, originator: i64) -> SolvedNote {
        SolvedNote {
            id,
            parent,
            originator,
        }
    }

    #[test]
    fn test_local_chain_collapses_to_root() {
        let mut tracker = ProblemTracker::new(0);

        // Root 0 branches into 1 and 2; node 1 branches into 3 and 4.
        let root = tracker.add_problem(note(0, NONE, 0), 2);
        let one = tracker.add_problem(note(1, root, 0), 2);
        assert_eq!(tracker.len(), 2);

        tracker.problem_solved(note(3, one, 0));
        assert!(!tracker.is_empty());

        // Node 4 completes node 1, which completes half of the root.
        tracker.problem_solved(note(4, one, 0));
        assert_eq!(tracker.len(), 1);

        tracker.problem_solved(note(2, root, 0));
        assert!(tracker.is_empty());
        assert!(tracker.solved_queue_is_empty());
    }

    #[test]
    fn test_remote_origin_goes_to_solved_queue() {
        let mut tracker = ProblemTracker::new(1);

        // A problem stolen from process 0: handle 7 indexes process 0's
        // arena and must travel back untouched.
        tracker.problem_solved(note(5, 7, 0));

        assert!(tracker.is_empty());
        let out = tracker.pop_outgoing().unwrap();
        assert_eq!((out.id, out.parent, out.originator), (5, 7, 0));
    }

    #[test]
    fn test_remote_subtree_resolves_through_local_parent() {
        let mut tracker = ProblemTracker::new(1);

        // Process 1 branched a problem it stole from process 0.
        let stolen = tracker.add_problem(note(5, 40, 0), 2);
        tracker.problem_solved(note(11, stolen, 1));
        tracker.problem_solved(note(12, stolen, 1));

        // Both children solved locally: the stolen node is complete and its
        // note (with process 0's arena handle) is owed to process 0.
        assert!(tracker.is_empty());
        let out = tracker.pop_outgoing().unwrap();
        assert_eq!((out.id, out.parent, out.originator), (5, 40, 0));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut tracker = ProblemTracker::new(0);

        let a = tracker.add_problem(note(0, NONE, 0), 1);
        tracker.problem_solved(note(1, a, 0));
        assert!(tracker.is_empty());

        let b = tracker.add_problem(note(0, NONE, 0), 1);
        assert_eq!(a, b);
    }
}
