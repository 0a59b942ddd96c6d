//! Decentralized branch-and-bound solver.
//!
//! Every solver keeps a local workpool ordered by the user's better-than
//! relation and a local view of the best complete solution found anywhere
//! (the incumbent). Solvers exchange three kinds of traffic: incumbents
//! (broadcast to all peers), load (subproblems moving towards idle or
//! poorly-loaded peers) and solved notes (termination accounting flowing
//! back to each subproblem's originator).
//!
//! All handshakes follow one rule: the lower-id process sends directly, the
//! higher-id process announces with a send-request and transmits only after
//! the ready-signal. This breaks the cyclic wait that blocking sends could
//! otherwise form.

use std::sync::Arc;

use fastrand::Rng;
use log::debug;

use crate::error::Result;
use crate::frame::{BbFrame, SolvedNote, NONE};
use crate::pool::Workpool;
use crate::process::{await_any, Backoff, Ports, ReceiverCursor, Stage};
use crate::runtime::ProcessCtx;
use crate::solver::{BranchBound, Topology};
use crate::tracker::ProblemTracker;
use crate::transport::{Endpoint, ProcessId, Tag};

#[derive(Debug, Default)]
struct BbStats {
    problems_received: u64,
    branched: u64,
    bounded: u64,
    solved: u64,
    incumbents_sent: u64,
    incumbents_accepted: u64,
    incumbents_discarded: u64,
    hints_sent: u64,
    hints_answered: u64,
    problems_sent: u64,
    problems_stolen: u64,
}

pub struct BbSolver<U: BranchBound> {
    user: Arc<U>,
    fan_out: usize,
    slot: ProcessId,
    ports: Ports,
    /// Entrances of all solvers of the skeleton; index 0 is the master.
    peers: Vec<ProcessId>,
    /// Load-balancing neighbourhood within `peers`.
    workmates: Vec<ProcessId>,
}

impl<U: BranchBound> BbSolver<U> {
    pub fn new(ctx: &ProcessCtx, user: Arc<U>, fan_out: usize) -> Self {
        let slot = ctx.alloc_slots(1);
        BbSolver {
            user,
            fan_out,
            slot,
            ports: Ports::single(slot),
            peers: vec![slot],
            workmates: vec![slot],
        }
    }

    pub fn entrance(&self) -> ProcessId {
        self.slot
    }

    fn set_workmates(&mut self, peers: &[ProcessId], position: usize, topology: Topology) {
        self.peers = peers.to_vec();
        self.workmates = topology.workmates(peers, position);
    }
}

impl<U: BranchBound> Stage for BbSolver<U> {
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
            workmates: &self.workmates,
            ports: &self.ports,
            fan_out: self.fan_out as i64,
            steal_percent: ctx.config().steal_percent,
            rng: Rng::new(),
            out_cursor: ReceiverCursor::new(),
            pred_cursor: 0,
            finished: false,
            blocked: false,
            received_stops: 0,
            incumbent: None,
            outgoing_incumbent: None,
            new_incumbent: false,
            sent_incumbent_request: false,
            incumbent_acks: 0,
            sent_hint: false,
            hint_target: 0,
            sent_problem_request: false,
            pending_load: None,
            request_from: 0,
            pool: Workpool::new(),
            tracker: ProblemTracker::new(self.slot as i64),
            progress: false,
            stats: BbStats::default(),
        };

        machine.run()
    }
}

struct Machine<'a, U: BranchBound> {
    user: &'a U,
    ctx: &'a ProcessCtx,
    endpoint: &'a Endpoint,
    me: ProcessId,
    master: ProcessId,
    peers: &'a [ProcessId],
    workmates: &'a [ProcessId],
    ports: &'a Ports,
    fan_out: i64,
    steal_percent: u32,
    rng: Rng,
    out_cursor: ReceiverCursor,
    pred_cursor: usize,

    finished: bool,
    /// Master only: a top-level problem is in flight, no new ones accepted.
    blocked: bool,
    received_stops: usize,

    incumbent: Option<U::Problem>,
    /// Snapshot used to fulfil incumbent handshakes even after the master
    /// has already shipped its result.
    outgoing_incumbent: Option<U::Problem>,
    new_incumbent: bool,
    sent_incumbent_request: bool,
    incumbent_acks: usize,

    /// A lower-bound hint has been published and not yet answered.
    sent_hint: bool,
    /// Index into `workmates` the hint went to.
    hint_target: usize,
    /// A problem send-request is outstanding; the frame waits here.
    sent_problem_request: bool,
    pending_load: Option<BbFrame<U::Problem>>,
    /// Rotation cursor over workmates for answering incoming hints.
    request_from: usize,

    pool: Workpool<U::Problem>,
    tracker: ProblemTracker,
    progress: bool,
    stats: BbStats,
}

impl<U: BranchBound> Machine<'_, U> {
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

        self.exchange_stats()
    }

    /// After shutdown the workers ship their counters to the master, which
    /// logs the per-solver summary. Pure telemetry; runs strictly after the
    /// protocol, so it cannot disturb message ordering.
    fn exchange_stats(&mut self) -> Result<()> {
        let log_counters = |solver: ProcessId, c: &[u64]| {
            debug!(
                "bb solver {}: recv={} branched={} bounded={} solved={} inc sent/acc/drop={}/{}/{} \
                 hints sent/answered={}/{} load sent/stolen={}/{}",
                solver, c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7], c[8], c[9], c[10],
            );
        };

        let counters = [
            self.stats.problems_received,
            self.stats.branched,
            self.stats.bounded,
            self.stats.solved,
            self.stats.incumbents_sent,
            self.stats.incumbents_accepted,
            self.stats.incumbents_discarded,
            self.stats.hints_sent,
            self.stats.hints_answered,
            self.stats.problems_sent,
            self.stats.problems_stolen,
        ];

        if self.me != self.master {
            return self.endpoint.send_slice(self.master, &counters, Tag::Statistics);
        }

        log_counters(self.me, &counters);
        for &peer in self.peers {
            if peer != self.me {
                let remote: Vec<u64> = self.endpoint.receive_vec(peer, Tag::Statistics)?;
                log_counters(peer, &remote);
            }
        }

        Ok(())
    }

    fn pool_insert(&mut self, frame: BbFrame<U::Problem>) {
        let user = self.user;
        self.pool.insert(frame, |a, b| user.better_than(a, b));
    }

    fn pool_pop(&mut self) -> Result<BbFrame<U::Problem>> {
        let user = self.user;
        self.pool.pop(|a, b| user.better_than(a, b))
    }

    /// True if `candidate` could still improve on the incumbent.
    fn maybe_better(&self, candidate: &U::Problem) -> bool {
        match self.incumbent.as_ref() {
            Some(incumbent) => self.user.better_than(candidate, incumbent),
            None => true,
        }
    }

    fn offer_incumbent(&mut self, candidate: U::Problem) {
        if self.maybe_better(&candidate) {
            self.incumbent = Some(candidate);
            self.new_incumbent = true;
        }
        self.stats.solved += 1;
    }

    fn random_workmate(&mut self) -> usize {
        loop {
            let at = self.rng.usize(0..self.workmates.len());
            if self.workmates[at] != self.me {
                return at;
            }
        }
    }

    /// Master inbound: blocks on the predecessors until either a new
    /// top-level problem or the final STOP arrives.
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
                        self.blocked = true;
                        self.finished = true;
                    }
                }
                tag => {
                    let mut problem: U::Problem = self.endpoint.receive(envelope.src, tag)?;
                    self.stats.problems_received += 1;
                    self.user.bound(&mut problem);

                    if self.user.is_solution(&problem) {
                        let dst = self.out_cursor.pick(
                            &self.ports.successors,
                            self.ctx.config().rotation,
                            &mut self.rng,
                        );
                        self.endpoint.send(dst, &problem, Tag::Data)?;
                    } else {
                        self.blocked = true;
                        let frame = BbFrame::new(0, NONE, self.me as i64, problem);
                        self.pool_insert(frame);
                    }
                }
            }
        }

        Ok(())
    }

    fn comm_phase(&mut self) -> Result<()> {
        self.distribute_incumbent()?;
        self.accept_incumbents()?;
        self.accept_solved_notes()?;
        self.ship_solved_notes()?;
        self.steal_work()?;
        self.reject_hints_while_empty()?;
        self.complete_deferred_load_send()?;

        // STOP forwarded by the master after upstream shut down.
        if self.me != self.master && self.endpoint.probe(self.master, Tag::Stop).is_some() {
            self.endpoint.receive_tag(self.master, Tag::Stop)?;
            self.finished = true;
        }

        Ok(())
    }

    /// Announces a strictly improving incumbent to every peer: direct send
    /// to higher ids, send-request first towards lower ids.
    fn distribute_incumbent(&mut self) -> Result<()> {
        if self.new_incumbent && !self.sent_incumbent_request {
            self.outgoing_incumbent = self.incumbent.clone();

            if let Some(incumbent) = self.outgoing_incumbent.clone() {
                self.incumbent_acks = 0;

                for &peer in self.peers {
                    if peer == self.me {
                        continue;
                    }

                    if self.me < peer {
                        self.endpoint.send(peer, &incumbent, Tag::Incumbent)?;
                        self.incumbent_acks += 1;
                    } else {
                        self.endpoint.send_tag(peer, Tag::IncumbentSendRequest)?;
                        self.sent_incumbent_request = true;
                    }
                }

                self.new_incumbent = false;
                self.stats.incumbents_sent += 1;
            }
        }

        if self.sent_incumbent_request {
            for &peer in self.peers {
                if self.endpoint.probe(peer, Tag::IncumbentReadySignal).is_some() {
                    self.endpoint.receive_tag(peer, Tag::IncumbentReadySignal)?;

                    if let Some(incumbent) = self.outgoing_incumbent.clone() {
                        self.endpoint.send(peer, &incumbent, Tag::Incumbent)?;
                    }
                    self.incumbent_acks += 1;
                }
            }

            if self.incumbent_acks >= self.peers.len() - 1 {
                self.sent_incumbent_request = false;
            }
        }

        Ok(())
    }

    fn accept_incumbents(&mut self) -> Result<()> {
        for at in 0..self.peers.len() {
            let peer = self.peers[at];
            let mut candidate: Option<U::Problem> = None;

            // Lower-id peers send directly.
            if self.endpoint.probe(peer, Tag::Incumbent).is_some() {
                candidate = Some(self.endpoint.receive(peer, Tag::Incumbent)?);
            }

            // Higher-id peers announce first.
            if self.endpoint.probe(peer, Tag::IncumbentSendRequest).is_some() {
                self.endpoint.receive_tag(peer, Tag::IncumbentSendRequest)?;
                self.endpoint.send_tag(peer, Tag::IncumbentReadySignal)?;
                candidate = Some(self.endpoint.receive(peer, Tag::Incumbent)?);
            }

            if let Some(candidate) = candidate {
                self.progress = true;

                if self.maybe_better(&candidate) {
                    self.incumbent = Some(candidate);
                    self.new_incumbent = true;
                    self.stats.incumbents_accepted += 1;
                } else {
                    self.stats.incumbents_discarded += 1;
                }
            }
        }

        Ok(())
    }

    fn accept_solved_notes(&mut self) -> Result<()> {
        for &peer in self.peers {
            while self.endpoint.probe(peer, Tag::ProblemSolved).is_some() {
                let note: SolvedNote = self.endpoint.receive(peer, Tag::ProblemSolved)?;
                self.tracker.problem_solved(note);
                self.progress = true;
            }
        }

        Ok(())
    }

    /// Solved notes are fixed-size and travel without a handshake, but not
    /// towards a peer with an unanswered work request of ours, so that the
    /// two message flows cannot interleave into a handshake cycle.
    fn ship_solved_notes(&mut self) -> Result<()> {
        while let Some(note) = self.tracker.peek_outgoing().copied() {
            let dst = note.originator as ProcessId;

            if self.sent_hint && self.workmates[self.hint_target] == dst {
                break;
            }

            self.endpoint.send(dst, &note, Tag::ProblemSolved)?;
            self.tracker.pop_outgoing();
        }

        Ok(())
    }

    /// Publishes a lower-bound hint to a random workmate: unconditionally
    /// when the own pool has run dry, with configured probability otherwise.
    /// At most one hint is in flight at a time.
    fn steal_work(&mut self) -> Result<()> {
        if !self.sent_hint {
            if self.sent_incumbent_request {
                return Ok(());
            }

            if self.pool.is_empty() {
                self.hint_target = self.random_workmate();
                self.endpoint
                    .send(self.workmates[self.hint_target], &i64::MAX, Tag::LowerBoundHint)?;
                self.sent_hint = true;
                self.stats.hints_sent += 1;
            } else if self.rng.u32(1..=100) <= self.steal_percent {
                let hint = self.user.lower_bound(&self.pool.top()?.payload);
                self.hint_target = self.random_workmate();
                self.endpoint
                    .send(self.workmates[self.hint_target], &hint, Tag::LowerBoundHint)?;
                self.sent_hint = true;
                self.stats.hints_sent += 1;
            }

            return Ok(());
        }

        let target = self.workmates[self.hint_target];

        if self.endpoint.probe(target, Tag::HintRejection).is_some() {
            self.endpoint.receive_tag(target, Tag::HintRejection)?;
            self.sent_hint = false;
            self.progress = true;
        }

        let mut load: Option<BbFrame<U::Problem>> = None;

        // Lower-id responders ship directly.
        if self.endpoint.probe(target, Tag::Problem).is_some() {
            load = Some(self.endpoint.receive(target, Tag::Problem)?);
        }

        // Higher-id responders announce first.
        if self.endpoint.probe(target, Tag::ProblemSendRequest).is_some() {
            self.endpoint.receive_tag(target, Tag::ProblemSendRequest)?;
            self.endpoint.send_tag(target, Tag::ProblemReadySignal)?;
            load = Some(self.endpoint.receive(target, Tag::Problem)?);
        }

        if let Some(frame) = load {
            self.progress = true;
            self.stats.problems_stolen += 1;

            // Admit only if the offer could still beat the incumbent;
            // otherwise account it as solved so the books stay right.
            if self.maybe_better(&frame.payload) {
                self.pool_insert(frame);
            } else {
                self.tracker.problem_solved(frame.note());
            }
            self.sent_hint = false;
        }

        Ok(())
    }

    /// An empty pool can never serve load: turn down every pending hint.
    fn reject_hints_while_empty(&mut self) -> Result<()> {
        if !self.pool.is_empty() {
            return Ok(());
        }

        for &mate in self.workmates {
            if self.endpoint.probe(mate, Tag::LowerBoundHint).is_some() {
                let _hint: i64 = self.endpoint.receive(mate, Tag::LowerBoundHint)?;
                self.endpoint.send_tag(mate, Tag::HintRejection)?;
            }
        }

        Ok(())
    }

    fn complete_deferred_load_send(&mut self) -> Result<()> {
        if !self.sent_problem_request {
            return Ok(());
        }

        let mate = self.workmates[self.request_from];

        if self.endpoint.probe(mate, Tag::ProblemReadySignal).is_some() {
            self.endpoint.receive_tag(mate, Tag::ProblemReadySignal)?;

            if let Some(frame) = self.pending_load.take() {
                self.endpoint.send(mate, &frame, Tag::Problem)?;
                self.stats.problems_sent += 1;
            }
            self.sent_problem_request = false;
            self.progress = true;
        }

        Ok(())
    }

    /// Pops the best local problem and either prunes it against the
    /// incumbent or branches it, registering the children with the tracker.
    fn processing_phase(&mut self) -> Result<()> {
        if self.finished || self.pool.is_empty() {
            return Ok(());
        }

        self.progress = true;
        let working = self.pool_pop()?;

        if self.peers.len() > 1 && !self.sent_problem_request && !self.sent_incumbent_request {
            self.answer_hint()?;
        }

        // If the incumbent dominates the best local problem it dominates
        // the whole pool: everything local counts as solved.
        if let Some(incumbent) = self.incumbent.as_ref() {
            if self.user.better_than(incumbent, &working.payload) {
                while !self.pool.is_empty() {
                    let frame = self.pool_pop()?;
                    self.tracker.problem_solved(frame.note());
                    self.stats.solved += 1;
                }
                self.tracker.problem_solved(working.note());
                self.stats.solved += 1;
                return Ok(());
            }
        }

        let children = self.user.branch(&working.payload);
        self.stats.branched += 1;

        let parent_handle = if children.is_empty() {
            // No feasible subproblems: the node itself counts as solved.
            self.tracker.problem_solved(working.note());
            NONE
        } else {
            self.tracker.add_problem(working.note(), children.len() as i32)
        };

        // Child ids run from high to low so the lowest-numbered child ends
        // up on top among equals: deterministic depth-first exploration
        // tie-broken by better-than.
        let mut child_id = working.id * self.fan_out + self.fan_out;

        for mut child in children {
            let id = child_id;
            child_id -= 1;

            if self.user.is_solution(&child) {
                self.offer_incumbent(child);
                self.tracker.problem_solved(SolvedNote {
                    id,
                    parent: parent_handle,
                    originator: self.me as i64,
                });
                continue;
            }

            self.user.bound(&mut child);
            self.stats.bounded += 1;

            if self.user.is_solution(&child) {
                self.offer_incumbent(child);
                self.tracker.problem_solved(SolvedNote {
                    id,
                    parent: parent_handle,
                    originator: self.me as i64,
                });
                continue;
            }

            if self.maybe_better(&child) {
                self.pool_insert(BbFrame::new(id, parent_handle, self.me as i64, child));
            } else {
                self.tracker.problem_solved(SolvedNote {
                    id,
                    parent: parent_handle,
                    originator: self.me as i64,
                });
                self.stats.solved += 1;
            }
        }

        Ok(())
    }

    /// Answers at most one pending lower-bound hint per processed problem.
    /// Called right after the working frame was popped, so the pool's top
    /// is the second-best local problem.
    fn answer_hint(&mut self) -> Result<()> {
        let n = self.workmates.len();
        let mut found = None;

        for step in 1..=n {
            let at = (self.request_from + step) % n;
            if self
                .endpoint
                .probe(self.workmates[at], Tag::LowerBoundHint)
                .is_some()
            {
                found = Some(at);
                break;
            }
        }

        let at = match found {
            Some(at) => at,
            None => return Ok(()),
        };

        self.request_from = at;
        let mate = self.workmates[at];
        let hint: i64 = self.endpoint.receive(mate, Tag::LowerBoundHint)?;
        self.stats.hints_answered += 1;

        if self.pool.is_empty() {
            return self.endpoint.send_tag(mate, Tag::HintRejection);
        }

        let second_best = self.user.lower_bound(&self.pool.top()?.payload);
        if second_best >= hint {
            return self.endpoint.send_tag(mate, Tag::HintRejection);
        }

        let frame = self.pool_pop()?;

        if !self.maybe_better(&frame.payload) {
            // Already dominated; nothing worth shipping.
            self.endpoint.send_tag(mate, Tag::HintRejection)?;
            self.tracker.problem_solved(frame.note());
            return Ok(());
        }

        if self.me < mate {
            self.endpoint.send(mate, &frame, Tag::Problem)?;
            self.stats.problems_sent += 1;
        } else {
            self.endpoint.send_tag(mate, Tag::ProblemSendRequest)?;
            self.sent_problem_request = true;
            self.pending_load = Some(frame);
        }

        Ok(())
    }

    /// Master only: once the tracker has emptied, the incumbent is the
    /// final solution of the current top-level problem.
    fn termination_phase(&mut self) -> Result<()> {
        // Hold the result back while an incumbent announcement is still
        // in flight towards the peers.
        let announcing =
            self.peers.len() > 1 && (self.new_incumbent || self.sent_incumbent_request);

        if self.me != self.master
            || !self.blocked
            || self.finished
            || announcing
            || !self.tracker.is_empty()
        {
            return Ok(());
        }

        if let Some(incumbent) = self.incumbent.take() {
            let dst = self.out_cursor.pick(
                &self.ports.successors,
                self.ctx.config().rotation,
                &mut self.rng,
            );
            self.endpoint.send(dst, &incumbent, Tag::Data)?;
            self.blocked = false;
            self.progress = true;
        }

        Ok(())
    }
}

/// The branch-and-bound skeleton stage: `solvers` cooperating
/// [`BbSolver`] processes, entered through the master.
pub struct BranchAndBound<U: BranchBound> {
    solvers: Vec<BbSolver<U>>,
    ports: Ports,
}

impl<U: BranchBound> BranchAndBound<U> {
    /// `fan_out` is the maximum number of subproblems `branch` generates;
    /// node-id arithmetic depends on it.
    pub fn new(
        ctx: &ProcessCtx,
        user: U,
        solvers: usize,
        fan_out: usize,
        topology: Topology,
    ) -> Self {
        assert!(solvers > 0, "need at least one solver");
        let user = Arc::new(user);

        let mut solvers: Vec<BbSolver<U>> = (0..solvers)
            .map(|_| BbSolver::new(ctx, user.clone(), fan_out))
            .collect();

        let peers: Vec<ProcessId> = solvers.iter().map(|s| s.entrance()).collect();
        for (at, solver) in solvers.iter_mut().enumerate() {
            solver.set_workmates(&peers, at, topology);
        }

        let ports = Ports::single(peers[0]);
        BranchAndBound { solvers, ports }
    }
}

impl<U: BranchBound> Stage for BranchAndBound<U> {
    fn entrances(&self) -> &[ProcessId] {
        &self.ports.entrances
    }

    fn exits(&self) -> &[ProcessId] {
        &self.ports.exits
    }

    fn set_predecessors(&mut self, sources: &[ProcessId]) {
        self.ports.predecessors = sources.to_vec();
        // Only the master talks to the outside world on the way in.
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

    /// A toy minimization problem: an interval of leaf values. Branching
    /// halves the interval; a single-value interval is a solution whose
    /// value is its bound. The optimum is the smallest leaf.
    #[derive(Debug, Clone, PartialEq)]
    struct Range {
        lo: i64,
        hi: i64,
    }

    impl Payload for Range {
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
            Range { lo, hi }
        }
    }

    struct MinLeaf;

    impl BranchBound for MinLeaf {
        type Problem = Range;

        fn branch(&self, p: &Range) -> Vec<Range> {
            let mid = (p.lo + p.hi) / 2;
            vec![
                Range { lo: p.lo, hi: mid },
                Range {
                    lo: mid + 1,
                    hi: p.hi,
                },
            ]
        }

        fn bound(&self, _p: &mut Range) {}

        fn better_than(&self, a: &Range, b: &Range) -> bool {
            a.lo < b.lo
        }

        fn is_solution(&self, p: &Range) -> bool {
            p.lo == p.hi
        }

        fn lower_bound(&self, p: &Range) -> i64 {
            p.lo
        }
    }

    fn solve_ranges(
        solvers: usize,
        topology: Topology,
        problems: Vec<Range>,
    ) -> Vec<Range> {
        let np = problems.len();
        let config = RuntimeConfig::new(2 + solvers).steal_percent(40);

        let results = run(config, |ctx| {
            let feed = RefCell::new({
                let mut p = problems.clone();
                p.reverse();
                p
            });
            let found = RefCell::new(Vec::new());

            let initial = Initial::new(ctx, || feed.borrow_mut().pop());
            let engine = BranchAndBound::new(ctx, MinLeaf, solvers, 2, topology);
            let sink = Final::new(ctx, |r: Range| found.borrow_mut().push(r));

            let mut pipe = Pipe::new(vec![Box::new(initial), Box::new(engine), Box::new(sink)]);
            pipe.start(ctx)?;
            drop(pipe);

            Ok(found.into_inner())
        })
        .unwrap();

        let sink_slot = 1 + solvers;
        let collected = results[sink_slot].clone();
        assert_eq!(collected.len(), np, "one solution per submitted problem");
        collected
    }

    #[test]
    fn test_single_solver_finds_minimum() {
        let found = solve_ranges(1, Topology::AllToAll, vec![Range { lo: 5, hi: 36 }]);
        assert_eq!(found, vec![Range { lo: 5, hi: 5 }]);
    }

    #[test]
    fn test_two_solvers_scenario() {
        // Better-than is strictly-smaller, every non-winning leaf is
        // accounted to the tracker; the final incumbent is the leaf 3.
        let found = solve_ranges(2, Topology::AllToAll, vec![Range { lo: 3, hi: 7 }]);
        assert_eq!(found, vec![Range { lo: 3, hi: 3 }]);
    }

    #[test]
    fn test_four_solvers_with_stealing() {
        let found = solve_ranges(4, Topology::AllToAll, vec![Range { lo: 17, hi: 272 }]);
        assert_eq!(found, vec![Range { lo: 17, hi: 17 }]);
    }

    #[test]
    fn test_hypercube_topology() {
        let found = solve_ranges(4, Topology::Hypercube, vec![Range { lo: 1, hi: 64 }]);
        assert_eq!(found, vec![Range { lo: 1, hi: 1 }]);
    }

    #[test]
    fn test_ring_topology_with_problem_stream() {
        let found = solve_ranges(
            3,
            Topology::Ring,
            vec![Range { lo: 9, hi: 40 }, Range { lo: 2, hi: 17 }],
        );
        assert_eq!(
            found,
            vec![Range { lo: 9, hi: 9 }, Range { lo: 2, hi: 2 }]
        );
    }
}
