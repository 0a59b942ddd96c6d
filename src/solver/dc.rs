//! Decentralized divide-and-conquer solver.
//!
//! Simpler than branch-and-bound: there is no bound function and no
//! incumbent. Problems split recursively until simple, solutions climb back
//! up through the solution pool's sibling combines. A solver that runs out
//! of work asks a random peer; a problem handed over roots a remote subtree
//! whose combined solution is routed back to the originator through the
//! send queue, under the usual lower-id-sends-first handshake.

use std::sync::Arc;

use fastrand::Rng;
use log::debug;

use crate::error::Result;
use crate::frame::Frame;
use crate::pool::{DcWorkpool, SolutionPool};
use crate::process::{await_any, Backoff, Ports, ReceiverCursor, Stage};
use crate::runtime::ProcessCtx;
use crate::solver::DivideConquer;
use crate::transport::{Endpoint, ProcessId, Tag};

#[derive(Debug, Default)]
struct DcStats {
    problems_processed: u64,
    simple_solved: u64,
    subproblems_sent: u64,
    subproblems_received: u64,
    work_requests: u64,
    rejections: u64,
}

pub struct DcSolver<U: DivideConquer> {
    user: Arc<U>,
    fan_out: usize,
    slot: ProcessId,
    ports: Ports,
    /// Entrances of all solvers; index 0 is the master.
    peers: Vec<ProcessId>,
}

impl<U: DivideConquer> DcSolver<U> {
    pub fn new(ctx: &ProcessCtx, user: Arc<U>, fan_out: usize) -> Self {
        let slot = ctx.alloc_slots(1);
        DcSolver {
            user,
            fan_out,
            slot,
            ports: Ports::single(slot),
            peers: vec![slot],
        }
    }

    pub fn entrance(&self) -> ProcessId {
        self.slot
    }

    fn set_workmates(&mut self, peers: &[ProcessId]) {
        self.peers = peers.to_vec();
    }
}

impl<U: DivideConquer> Stage for DcSolver<U> {
    fn entrances(&self) -> &[ProcessId] {
        &self.ports.entrances
    }

    fn exits(&self) -> &[ProcessId] {
        &self.ports.exits
    }

    fn set_predecessors(&mut self, sources: &[ProcessId]) {
        self.ports.predecessors = sources.to_vec();
    }

    fn set_successors(&mut self, sinks: &[ProcessId]) {
        self.ports.successors = sinks.to_vec();
    }

    fn start(&mut self, ctx: &ProcessCtx) -> Result<()> {
        if ctx.id() != self.slot {
            return Ok(());
        }

        let mut machine = Machine {
            user: &*self.user,
            ctx,
            endpoint: ctx.endpoint(),
            me: self.slot,
            master: self.peers[0],
            peers: &self.peers,
            ports: &self.ports,
            fan_out: self.fan_out as i64,
            rng: Rng::new(),
            out_cursor: ReceiverCursor::new(),
            pred_cursor: 0,
            finished: false,
            blocked: false,
            received_stops: 0,
            work_request_sent: false,
            request_target: 0,
            send_request_sent: false,
            deep_combine_needed: false,
            workpool: DcWorkpool::new(),
            solutions: SolutionPool::new(self.fan_out),
            progress: false,
            stats: DcStats::default(),
        };

        machine.run()
    }
}

struct Machine<'a, U: DivideConquer> {
    user: &'a U,
    ctx: &'a ProcessCtx,
    endpoint: &'a Endpoint,
    me: ProcessId,
    master: ProcessId,
    peers: &'a [ProcessId],
    ports: &'a Ports,
    fan_out: i64,
    rng: Rng,
    out_cursor: ReceiverCursor,
    pred_cursor: usize,

    finished: bool,
    blocked: bool,
    received_stops: usize,

    /// A work request is out and unanswered; its target process id.
    work_request_sent: bool,
    request_target: ProcessId,
    /// A send-request for a solution frame is outstanding.
    send_request_sent: bool,
    deep_combine_needed: bool,

    workpool: DcWorkpool<U::Problem>,
    solutions: SolutionPool<U::Solution>,
    progress: bool,
    stats: DcStats,
}

impl<U: DivideConquer> Machine<'_, U> {
    fn run(&mut self) -> Result<()> {
        let mut backoff = Backoff::new();

        while !self.finished {
            self.progress = false;

            self.master_phase()?;
            if self.peers.len() > 1 && !self.finished {
                self.comm_phase()?;
            }
            self.processing_phase()?;
            self.termination_phase()?;

            if self.progress {
                backoff.reset();
            } else {
                backoff.wait();
            }
        }

        debug!(
            "dc solver {}: processed={} simple={} load sent/recv={}/{} requests={} rejections={}",
            self.me,
            self.stats.problems_processed,
            self.stats.simple_solved,
            self.stats.subproblems_sent,
            self.stats.subproblems_received,
            self.stats.work_requests,
            self.stats.rejections,
        );
        Ok(())
    }

    fn combine(&mut self) {
        let user = self.user;
        self.solutions.combine(|parts| user.combine(parts));
    }

    /// Master inbound: blocks until a top-level problem or the final STOP.
    fn master_phase(&mut self) -> Result<()> {
        if self.me != self.master || self.blocked {
            return Ok(());
        }

        while !self.blocked && !self.finished {
            let envelope = await_any(self.ctx, &self.ports.predecessors, &mut self.pred_cursor);
            self.progress = true;

            match envelope.tag {
                Tag::TerminationTest => {
                    self.endpoint.receive_tag(envelope.src, Tag::TerminationTest)?;
                }
                Tag::Stop => {
                    self.endpoint.receive_tag(envelope.src, Tag::Stop)?;
                    self.received_stops += 1;

                    if self.received_stops == self.ports.predecessors.len() {
                        for &peer in self.peers {
                            if peer != self.me {
                                self.endpoint.send_tag(peer, Tag::Stop)?;
                            }
                        }
                        for &sink in &self.ports.successors {
                            self.endpoint.send_tag(sink, Tag::Stop)?;
                        }
                        self.received_stops = 0;
                        self.finished = true;
                    }
                }
                tag => {
                    let problem: U::Problem = self.endpoint.receive(envelope.src, tag)?;
                    self.stats.subproblems_received += 1;

                    if self.user.is_simple(&problem) {
                        let solution = self.user.solve(problem);
                        let dst = self.out_cursor.pick(
                            &self.ports.successors,
                            self.ctx.config().rotation,
                            &mut self.rng,
                        );
                        self.endpoint.send(dst, &solution, Tag::Data)?;
                    } else {
                        self.blocked = true;
                        self.workpool
                            .insert(Frame::root(problem, self.master as i64));
                    }
                }
            }
        }

        Ok(())
    }

    fn comm_phase(&mut self) -> Result<()> {
        self.accept_solutions()?;

        if self.deep_combine_needed {
            let user = self.user;
            self.deep_combine_needed =
                self.solutions.deep_combine(|parts| user.combine(parts));
        }

        self.drain_send_queue()?;
        self.answer_work_requests()?;
        self.request_work()?;

        // STOP forwarded by the master once upstream shut down.
        if self.me != self.master && self.endpoint.probe(self.master, Tag::Stop).is_some() {
            self.endpoint.receive_tag(self.master, Tag::Stop)?;
            self.finished = true;
        }

        Ok(())
    }

    /// Takes in partial solutions from peers. Lower-id peers send directly,
    /// higher-id peers announce with a send-request first.
    fn accept_solutions(&mut self) -> Result<()> {
        for &peer in self.peers {
            let mut frame: Option<Frame<U::Solution>> = None;

            if self.endpoint.probe(peer, Tag::Solution).is_some() {
                frame = Some(self.endpoint.receive(peer, Tag::Solution)?);
            }

            if self.endpoint.probe(peer, Tag::SendRequest).is_some() {
                self.endpoint.receive_tag(peer, Tag::SendRequest)?;
                self.endpoint.send_tag(peer, Tag::ReadySignal)?;
                frame = Some(self.endpoint.receive(peer, Tag::Solution)?);
            }

            if let Some(frame) = frame {
                self.progress = true;
                self.solutions.insert(frame);
                self.combine();
                self.deep_combine_needed = true;
            }
        }

        Ok(())
    }

    /// Ships at most the front of the send queue. Skipped entirely while a
    /// work request is unanswered: the answer might be a subproblem that
    /// also needs a handshake, and the two handshakes could deadlock.
    fn drain_send_queue(&mut self) -> Result<()> {
        if self.solutions.send_queue_is_empty() || self.work_request_sent {
            return Ok(());
        }

        let originator = self.solutions.outgoing()?.originator as ProcessId;

        if self.me < originator {
            let frame = self.solutions.pop_outgoing()?;
            self.endpoint.send(originator, &frame, Tag::Solution)?;
            self.progress = true;
        } else if !self.send_request_sent {
            self.endpoint.send_tag(originator, Tag::SendRequest)?;
            self.send_request_sent = true;
        } else if self.endpoint.probe(originator, Tag::ReadySignal).is_some() {
            self.endpoint.receive_tag(originator, Tag::ReadySignal)?;
            let frame = self.solutions.pop_outgoing()?;
            self.endpoint.send(originator, &frame, Tag::Solution)?;
            self.send_request_sent = false;
            self.progress = true;
        }

        Ok(())
    }

    /// Answers pending work requests, giving away the oldest subproblem
    /// while the pool holds enough work. Deferred while a solution
    /// handshake is in progress, for the same reason as above.
    fn answer_work_requests(&mut self) -> Result<()> {
        for &peer in self.peers {
            if self.endpoint.probe(peer, Tag::WorkRequest).is_none() || self.send_request_sent {
                continue;
            }

            self.endpoint.receive_tag(peer, Tag::WorkRequest)?;
            self.progress = true;

            if !self.workpool.has_load() {
                self.endpoint.send_tag(peer, Tag::Rejection)?;
                self.stats.rejections += 1;
            } else {
                let frame = self.workpool.get_load()?;
                self.endpoint.send(peer, &frame, Tag::Subproblem)?;
                self.stats.subproblems_sent += 1;
            }
        }

        Ok(())
    }

    /// With an empty pool, asks one random peer for work and waits for
    /// either a rejection or a subproblem. The received frame is re-rooted
    /// here: its own id becomes the root node id and the sender the
    /// originator, so the combined solution finds its way back.
    fn request_work(&mut self) -> Result<()> {
        if !self.workpool.is_empty() || self.send_request_sent {
            return Ok(());
        }

        if !self.work_request_sent {
            let mut target = self.peers[self.rng.usize(0..self.peers.len())];
            while target == self.me {
                target = self.peers[self.rng.usize(0..self.peers.len())];
            }

            self.endpoint.send_tag(target, Tag::WorkRequest)?;
            self.request_target = target;
            self.work_request_sent = true;
            self.stats.work_requests += 1;
            return Ok(());
        }

        if self.endpoint.probe(self.request_target, Tag::Rejection).is_some() {
            self.endpoint.receive_tag(self.request_target, Tag::Rejection)?;
            self.work_request_sent = false;
            self.progress = true;
            return Ok(());
        }

        if self.endpoint.probe(self.request_target, Tag::Subproblem).is_some() {
            let mut frame: Frame<U::Problem> =
                self.endpoint.receive(self.request_target, Tag::Subproblem)?;
            frame.originator = self.request_target as i64;
            frame.root_id = frame.id;

            self.workpool.insert(frame);
            self.work_request_sent = false;
            self.progress = true;
            self.stats.subproblems_received += 1;
        }

        Ok(())
    }

    /// Pops one frame: divide complex problems back into the pool, solve
    /// simple ones into the solution pool (or straight to the send queue
    /// when the frame roots a remote subtree).
    fn processing_phase(&mut self) -> Result<()> {
        if self.finished || self.workpool.is_empty() {
            return Ok(());
        }

        self.progress = true;
        let frame = self.workpool.get()?;
        self.stats.problems_processed += 1;

        let Frame {
            id,
            root_id,
            originator,
            pool_id,
            payload: problem,
        } = frame;

        if !self.user.is_simple(&problem) {
            let children = self.user.divide(problem);
            debug_assert_eq!(children.len(), self.fan_out as usize);

            // Last child first, so the lowest-numbered child tops the pool.
            let first_child = Frame::<U::Problem>::first_child(id, self.fan_out);
            for (offset, child) in children.into_iter().enumerate().rev() {
                self.workpool.insert(Frame::new(
                    first_child + offset as i64,
                    root_id,
                    originator,
                    pool_id,
                    child,
                ));
            }
        } else {
            let solution = self.user.solve(problem);
            self.stats.simple_solved += 1;
            let frame = Frame::new(id, root_id, originator, pool_id, solution);

            if id == root_id {
                self.solutions.push_outgoing(frame);
            } else {
                self.solutions.insert(frame);
                self.combine();
            }
        }

        Ok(())
    }

    /// Master only: the computation is done once the solution with node id
    /// 0 surfaces.
    fn termination_phase(&mut self) -> Result<()> {
        if self.me != self.master || self.finished || !self.solutions.has_solution() {
            return Ok(());
        }

        let frame = self.solutions.pop()?;
        let dst = self.out_cursor.pick(
            &self.ports.successors,
            self.ctx.config().rotation,
            &mut self.rng,
        );
        self.endpoint.send(dst, &frame.payload, Tag::Data)?;
        self.blocked = false;
        self.progress = true;

        Ok(())
    }
}

/// The distributed divide-and-conquer skeleton stage: `solvers` cooperating
/// [`DcSolver`] processes, entered through the master.
pub struct DistributedDc<U: DivideConquer> {
    solvers: Vec<DcSolver<U>>,
    ports: Ports,
}

impl<U: DivideConquer> DistributedDc<U> {
    /// `fan_out` is the number of subproblems `divide` produces; it is
    /// fixed per problem instance.
    pub fn new(ctx: &ProcessCtx, user: U, solvers: usize, fan_out: usize) -> Self {
        assert!(solvers > 0, "need at least one solver");
        let user = Arc::new(user);

        let mut solvers: Vec<DcSolver<U>> = (0..solvers)
            .map(|_| DcSolver::new(ctx, user.clone(), fan_out))
            .collect();

        let peers: Vec<ProcessId> = solvers.iter().map(|s| s.entrance()).collect();
        for solver in solvers.iter_mut() {
            solver.set_workmates(&peers);
        }

        let ports = Ports::single(peers[0]);
        DistributedDc { solvers, ports }
    }
}

impl<U: DivideConquer> Stage for DistributedDc<U> {
    fn entrances(&self) -> &[ProcessId] {
        &self.ports.entrances
    }

    fn exits(&self) -> &[ProcessId] {
        &self.ports.exits
    }

    fn set_predecessors(&mut self, sources: &[ProcessId]) {
        self.ports.predecessors = sources.to_vec();
        self.solvers[0].set_predecessors(sources);
    }

    fn set_successors(&mut self, sinks: &[ProcessId]) {
        self.ports.successors = sinks.to_vec();
        for solver in &mut self.solvers {
            solver.set_successors(sinks);
        }
    }

    fn start(&mut self, ctx: &ProcessCtx) -> Result<()> {
        for solver in &mut self.solvers {
            solver.start(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::run;
    use crate::serialize::{get_i64, put_i64, Payload};
    use crate::stage::{Final, Initial, Pipe};
    use std::cell::RefCell;

    /// Sums an integer range by splitting it in half until single elements
    /// remain. The combined total must come out right no matter how the
    /// workers interleave.
    #[derive(Debug, Clone, PartialEq)]
    struct Span {
        lo: i64,
        hi: i64,
    }

    impl Payload for Span {
        fn size(&self) -> usize {
            16
        }

        fn reduce(&self, buf: &mut [u8]) {
            let at = put_i64(buf, 0, self.lo);
            put_i64(buf, at, self.hi);
        }

        fn expand(buf: &[u8]) -> Self {
            let (lo, at) = get_i64(buf, 0);
            let (hi, _) = get_i64(buf, at);
            Span { lo, hi }
        }
    }

    struct SumSpan;

    impl DivideConquer for SumSpan {
        type Problem = Span;
        type Solution = i64;

        fn is_simple(&self, p: &Span) -> bool {
            p.lo == p.hi
        }

        fn divide(&self, p: Span) -> Vec<Span> {
            let mid = (p.lo + p.hi) / 2;
            vec![
                Span { lo: p.lo, hi: mid },
                Span {
                    lo: mid + 1,
                    hi: p.hi,
                },
            ]
        }

        fn solve(&self, p: Span) -> i64 {
            p.lo
        }

        fn combine(&self, parts: Vec<i64>) -> i64 {
            parts.into_iter().sum()
        }
    }

    fn sum_spans(solvers: usize, problems: Vec<Span>) -> Vec<i64> {
        let expected = problems.len();
        let config = RuntimeConfig::new(2 + solvers);

        let results = run(config, |ctx| {
            let feed = RefCell::new({
                let mut p = problems.clone();
                p.reverse();
                p
            });
            let found = RefCell::new(Vec::new());

            let initial = Initial::new(ctx, || feed.borrow_mut().pop());
            let engine = DistributedDc::new(ctx, SumSpan, solvers, 2);
            let sink = Final::new(ctx, |s: i64| found.borrow_mut().push(s));

            let mut pipe = Pipe::new(vec![Box::new(initial), Box::new(engine), Box::new(sink)]);
            pipe.start(ctx)?;
            drop(pipe);

            Ok(found.into_inner())
        })
        .unwrap();

        let collected = results[1 + solvers].clone();
        assert_eq!(collected.len(), expected);
        collected
    }

    #[test]
    fn test_single_solver_sums_range() {
        // Array [8, 4, 2, 1] modelled as leaves; here: sum of 1..=4.
        assert_eq!(sum_spans(1, vec![Span { lo: 1, hi: 4 }]), vec![10]);
    }

    #[test]
    fn test_four_leaves_sum_is_interleaving_independent() {
        // Fan-out 2 over four leaves; result is 15 regardless of which
        // worker solves which leaf.
        for _ in 0..3 {
            assert_eq!(sum_spans(3, vec![Span { lo: 1, hi: 4 }]), vec![10]);
        }
    }

    #[test]
    fn test_two_solvers_large_range() {
        let total: i64 = (1..=64).sum();
        assert_eq!(sum_spans(2, vec![Span { lo: 1, hi: 64 }]), vec![total]);
    }

    #[test]
    fn test_simple_problem_solved_inline() {
        // A problem that is already simple never enters the workpool.
        assert_eq!(sum_spans(2, vec![Span { lo: 9, hi: 9 }]), vec![9]);
    }

    #[test]
    fn test_stream_of_problems() {
        let sums = sum_spans(
            3,
            vec![
                Span { lo: 1, hi: 8 },
                Span { lo: 5, hi: 12 },
                Span { lo: 100, hi: 103 },
            ],
        );
        assert_eq!(sums, vec![36, 68, 406]);
    }
}
