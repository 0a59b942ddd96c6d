//! Local problem and solution stores of the solver processes.
//!
//! Three containers, all single-process local:
//! - [`Workpool`]: priority heap of branch-and-bound frames, ordered by the
//!   user's better-than relation on the payload.
//! - [`DcWorkpool`]: list of divide-and-conquer frames; new work is taken
//!   from the front, load for peers is given away from the back.
//! - [`SolutionPool`]: stack of solution frames kept sorted by node id,
//!   combining complete sibling groups as they appear, plus the send queue
//!   for solutions owed to other processes.

use std::collections::VecDeque;

use crate::error::{Result, SkeletonError};
use crate::frame::{BbFrame, Frame};

/// Priority heap over branch-and-bound frames. The comparator is passed per
/// call; `better(a, b)` means problem `a` should be explored before `b`.
pub struct Workpool<T> {
    heap: Vec<BbFrame<T>>,
}

impl<T> Workpool<T> {
    pub fn new() -> Self {
        Workpool {
            heap: Vec::with_capacity(8),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn top(&self) -> Result<&BbFrame<T>> {
        self.heap.first().ok_or(SkeletonError::EmptyContainer {
            container: "workpool",
        })
    }

    pub fn insert(&mut self, frame: BbFrame<T>, better: impl Fn(&T, &T) -> bool) {
        self.heap.push(frame);
        let mut at = self.heap.len() - 1;

        while at > 0 {
            let up = (at - 1) / 2;
            if better(&self.heap[at].payload, &self.heap[up].payload) {
                self.heap.swap(at, up);
                at = up;
            } else {
                break;
            }
        }
    }

    pub fn pop(&mut self, better: impl Fn(&T, &T) -> bool) -> Result<BbFrame<T>> {
        if self.heap.is_empty() {
            return Err(SkeletonError::EmptyContainer {
                container: "workpool",
            });
        }

        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let result = self.heap.pop().expect("non-empty heap");

        let mut at = 0;
        loop {
            let left = 2 * at + 1;
            if left >= self.heap.len() {
                break;
            }

            let mut best = left;
            let right = left + 1;
            if right < self.heap.len()
                && better(&self.heap[right].payload, &self.heap[left].payload)
            {
                best = right;
            }

            if better(&self.heap[best].payload, &self.heap[at].payload) {
                self.heap.swap(at, best);
                at = best;
            } else {
                break;
            }
        }

        Ok(result)
    }

    pub fn reset(&mut self) {
        self.heap.clear();
    }
}

impl<T> Default for Workpool<T> {
    fn default() -> Self {
        Workpool::new()
    }
}

/// Divide-and-conquer work queue. Popping from the front keeps the
/// exploration depth-first; giving load away from the back hands out the
/// oldest (largest) subproblems. Load is only shared while at least
/// `LOAD_THRESHOLD` frames remain, so the original problem cannot leave the
/// master before it was ever branched.
pub struct DcWorkpool<T> {
    frames: VecDeque<Frame<T>>,
}

impl<T> DcWorkpool<T> {
    const LOAD_THRESHOLD: usize = 2;

    pub fn new() -> Self {
        DcWorkpool {
            frames: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn has_load(&self) -> bool {
        self.frames.len() >= Self::LOAD_THRESHOLD
    }

    pub fn insert(&mut self, frame: Frame<T>) {
        self.frames.push_front(frame);
    }

    pub fn get(&mut self) -> Result<Frame<T>> {
        self.frames.pop_front().ok_or(SkeletonError::EmptyContainer {
            container: "dc workpool",
        })
    }

    pub fn get_load(&mut self) -> Result<Frame<T>> {
        if !self.has_load() {
            return Err(SkeletonError::EmptyContainer {
                container: "dc workpool load",
            });
        }

        self.frames.pop_back().ok_or(SkeletonError::EmptyContainer {
            container: "dc workpool load",
        })
    }
}

impl<T> Default for DcWorkpool<T> {
    fn default() -> Self {
        DcWorkpool::new()
    }
}

/// Solution stack of one divide-and-conquer pool, sorted ascending by node
/// id, plus the queue of solutions owed to remote originators.
pub struct SolutionPool<S> {
    stack: Vec<Frame<S>>,
    send_queue: VecDeque<Frame<S>>,
    fan_out: i64,
}

impl<S> SolutionPool<S> {
    pub fn new(fan_out: usize) -> Self {
        SolutionPool {
            stack: Vec::with_capacity(8),
            send_queue: VecDeque::new(),
            fan_out: fan_out as i64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// True once the only solution left carries the root node id.
    pub fn has_solution(&self) -> bool {
        self.stack.last().map_or(false, |f| f.id == 0)
    }

    pub fn top(&self) -> Result<&Frame<S>> {
        self.stack.last().ok_or(SkeletonError::EmptyContainer {
            container: "solution pool",
        })
    }

    pub fn pop(&mut self) -> Result<Frame<S>> {
        self.stack.pop().ok_or(SkeletonError::EmptyContainer {
            container: "solution pool",
        })
    }

    /// Pushes a frame, keeping the stack sorted by node id.
    pub fn insert(&mut self, frame: Frame<S>) {
        let at = self
            .stack
            .iter()
            .rposition(|f| f.id <= frame.id)
            .map_or(0, |i| i + 1);
        self.stack.insert(at, frame);
    }

    /// A combine is possible when the top of the stack is a rightmost child
    /// and its complete sibling group sits directly below it. The stack is
    /// sorted, so checking the expected position of the leftmost sibling
    /// suffices.
    pub fn combine_ready(&self) -> bool {
        let top = match self.stack.last() {
            Some(f) if f.id > 0 && f.id % self.fan_out == 0 => f,
            _ => return false,
        };

        let d = self.fan_out as usize;
        self.stack.len() >= d && self.stack[self.stack.len() - d].id + self.fan_out - 1 == top.id
    }

    /// Combines complete sibling groups at the top of the stack until none
    /// remains. Parent frames whose new node id equals the root node id go
    /// to the send queue instead of back onto the stack.
    pub fn combine(&mut self, comb: impl Fn(Vec<S>) -> S) {
        while self.combine_ready() {
            let d = self.fan_out as usize;
            let group: Vec<Frame<S>> = self.stack.drain(self.stack.len() - d..).collect();
            self.finish_group(group, &comb);
        }
    }

    /// Scans deeper in the stack for one sibling-complete group left behind
    /// by out-of-order arrivals and combines it. Returns whether a combine
    /// happened; the caller repeats until it returns false.
    pub fn deep_combine(&mut self, comb: impl Fn(Vec<S>) -> S) -> bool {
        let d = self.fan_out as usize;
        if self.stack.len() < d {
            return false;
        }

        for at in 0..=self.stack.len() - d {
            let id = self.stack[at].id;
            let left_son = id % self.fan_out == 1;

            if left_son && self.stack[at + d - 1].id == id + self.fan_out - 1 {
                let group: Vec<Frame<S>> = self.stack.drain(at..at + d).collect();
                self.finish_group(group, &comb);
                return true;
            }
        }

        false
    }

    fn finish_group(&mut self, group: Vec<Frame<S>>, comb: &impl Fn(Vec<S>) -> S) {
        let parent_id = (group[0].id - 1) / self.fan_out;
        let root_id = group[0].root_id;
        let originator = group[0].originator;
        let pool_id = group[0].pool_id;

        let solution = comb(group.into_iter().map(|f| f.payload).collect());
        let frame = Frame::new(parent_id, root_id, originator, pool_id, solution);

        if parent_id == root_id {
            self.send_queue.push_back(frame);
        } else {
            self.insert(frame);
        }
    }

    pub fn send_queue_is_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    pub fn push_outgoing(&mut self, frame: Frame<S>) {
        self.send_queue.push_back(frame);
    }

    pub fn outgoing(&self) -> Result<&Frame<S>> {
        self.send_queue.front().ok_or(SkeletonError::EmptyContainer {
            container: "send queue",
        })
    }

    pub fn pop_outgoing(&mut self) -> Result<Frame<S>> {
        self.send_queue.pop_front().ok_or(SkeletonError::EmptyContainer {
            container: "send queue",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(id: i64, lb: i64) -> BbFrame<i64> {
        BbFrame::new(id, -1, 0, lb)
    }

    fn smaller(a: &i64, b: &i64) -> bool {
        a < b
    }

    #[test]
    fn test_workpool_orders_by_better_than() {
        let mut pool = Workpool::new();
        for (id, lb) in [(1, 9), (2, 3), (3, 7), (4, 1), (5, 5)] {
            pool.insert(bb(id, lb), smaller);
        }

        let mut bounds = Vec::new();
        while !pool.is_empty() {
            bounds.push(pool.pop(smaller).unwrap().payload);
        }
        assert_eq!(bounds, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_workpool_top_and_reset() {
        let mut pool = Workpool::new();
        assert!(pool.top().is_err());

        pool.insert(bb(1, 4), smaller);
        pool.insert(bb(2, 2), smaller);
        assert_eq!(pool.top().unwrap().payload, 2);

        pool.reset();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_dc_workpool_front_back_discipline() {
        let mut pool = DcWorkpool::new();
        assert!(pool.get_load().is_err());

        for id in 0..4 {
            pool.insert(Frame::new(id, -1, -1, 0, id));
        }

        // Load is taken from the back: the oldest insert.
        assert_eq!(pool.get_load().unwrap().id, 0);
        // Work is taken from the front: the newest insert.
        assert_eq!(pool.get().unwrap().id, 3);

        pool.get().unwrap();
        assert!(!pool.has_load());
        assert!(pool.get_load().is_err());
    }

    fn sol(id: i64, value: i64) -> Frame<i64> {
        Frame::new(id, -1, -1, 0, value)
    }

    #[test]
    fn test_solution_pool_combines_sibling_groups() {
        // Fan-out 2: leaves 3, 4 combine to 1; leaves 5, 6 combine to 2;
        // then 1, 2 combine to the root.
        let mut pool = SolutionPool::new(2);
        let add = |parts: Vec<i64>| parts.iter().sum();

        for (id, value) in [(3, 8), (4, 4), (5, 2), (6, 1)] {
            pool.insert(sol(id, value));
            pool.combine(add);
        }

        assert!(pool.has_solution());
        assert_eq!(pool.top().unwrap().payload, 15);
    }

    #[test]
    fn test_deep_combine_handles_out_of_order_arrivals() {
        // Fan-out 2 tree of depth 2. The group {3, 4} completes while 6 is
        // already on the stack above it; the top-of-stack check alone never
        // fires, deep combine must find the buried group.
        let mut pool = SolutionPool::new(2);
        let add = |parts: Vec<i64>| parts.iter().sum::<i64>();

        pool.insert(sol(6, 1));
        pool.insert(sol(3, 8));
        pool.insert(sol(4, 4));
        assert!(!pool.combine_ready());

        assert!(pool.deep_combine(add));
        // {3,4} -> 1; stack is now [1, 6], nothing more to deep-combine.
        assert!(!pool.deep_combine(add));

        pool.insert(sol(5, 2));
        pool.combine(add);
        assert!(pool.has_solution());
        assert_eq!(pool.top().unwrap().payload, 15);
    }

    #[test]
    fn test_root_routed_solutions_go_to_send_queue() {
        // A stolen subtree rooted at node 5 (fan-out 2): its children are
        // 11 and 12; the combined frame carries the root node id and must
        // land in the send queue, not on the stack.
        let mut pool = SolutionPool::new(2);
        let add = |parts: Vec<i64>| parts.iter().sum::<i64>();

        pool.insert(Frame::new(11, 5, 3, 0, 20));
        pool.insert(Frame::new(12, 5, 3, 0, 22));
        pool.combine(add);

        assert!(pool.is_empty());
        let out = pool.pop_outgoing().unwrap();
        assert_eq!((out.id, out.originator, out.payload), (5, 3, 42));
    }
}
