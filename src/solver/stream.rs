//! Stream-optimized divide-and-conquer solver.
//!
//! Several solvers act as masters at once, each accepting its own stream of
//! top-level problems; the start-up and wind-down phases of consecutive
//! problems overlap across masters. Every in-flight frame carries the pool
//! id of the master it belongs to, and each solver keeps one solution pool
//! per master. A master that has collected STOP from all its predecessors
//! surrenders the master role and continues as a plain worker; the whole
//! skeleton terminates once every master has surrendered, which each solver
//! detects by counting one internal STOP per master.

use std::sync::Arc;

use fastrand::Rng;
use log::debug;

use crate::error::Result;
use crate::frame::Frame;
use crate::pool::{DcWorkpool, SolutionPool};
use crate::process::{Backoff, Ports, ReceiverCursor, Stage};
use crate::runtime::ProcessCtx;
use crate::solver::DivideConquer;
use crate::transport::{Endpoint, ProcessId, Tag};

pub struct DcStreamSolver<U: DivideConquer> {
    user: Arc<U>,
    fan_out: usize,
    slot: ProcessId,
    ports: Ports,
    peers: Vec<ProcessId>,
    /// The first `masters` peers accept external problems.
    masters: usize,
    is_master: bool,
}

impl<U: DivideConquer> DcStreamSolver<U> {
    pub fn new(ctx: &ProcessCtx, user: Arc<U>, fan_out: usize) -> Self {
        let slot = ctx.alloc_slots(1);
        DcStreamSolver {
            user,
            fan_out,
            slot,
            ports: Ports::single(slot),
            peers: vec![slot],
            masters: 1,
            is_master: false,
        }
    }

    pub fn entrance(&self) -> ProcessId {
        self.slot
    }

    fn set_workmates(&mut self, peers: &[ProcessId], masters: usize) {
        self.peers = peers.to_vec();
        self.masters = masters;
        let position = peers.iter().position(|&p| p == self.slot);
        self.is_master = position.map_or(false, |at| at < masters);
    }
}

impl<U: DivideConquer> Stage for DcStreamSolver<U> {
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
            peers: &self.peers,
            ports: &self.ports,
            fan_out: self.fan_out as i64,
            masters: self.masters,
            is_master: self.is_master,
            primary_pool: (self.slot - self.peers[0]) as i64,
            rng: Rng::new(),
            out_cursor: ReceiverCursor::new(),
            finished: false,
            blocked: false,
            received_stops: 0,
            internal_stops: 0,
            work_request_sent: false,
            request_target: 0,
            send_request_sent: false,
            deep_combine_needed: false,
            workpool: DcWorkpool::new(),
            pools: (0..self.masters)
                .map(|_| SolutionPool::new(self.fan_out))
                .collect(),
            progress: false,
            solutions_returned: 0,
        };

        machine.run()
    }
}

struct Machine<'a, U: DivideConquer> {
    user: &'a U,
    ctx: &'a ProcessCtx,
    endpoint: &'a Endpoint,
    me: ProcessId,
    peers: &'a [ProcessId],
    ports: &'a Ports,
    fan_out: i64,
    masters: usize,
    is_master: bool,
    /// Pool id of this master's own problems.
    primary_pool: i64,
    rng: Rng,
    out_cursor: ReceiverCursor,

    finished: bool,
    blocked: bool,
    received_stops: usize,
    /// One per master that has surrendered, own surrender included.
    internal_stops: usize,

    work_request_sent: bool,
    request_target: ProcessId,
    send_request_sent: bool,
    deep_combine_needed: bool,

    workpool: DcWorkpool<U::Problem>,
    /// One solution pool per master, indexed by pool id.
    pools: Vec<SolutionPool<U::Solution>>,
    progress: bool,
    solutions_returned: u64,
}

impl<U: DivideConquer> Machine<'_, U> {
    fn run(&mut self) -> Result<()> {
        let mut backoff = Backoff::new();

        while !self.finished {
            self.progress = false;

            self.master_phase()?;
            self.comm_phase()?;
            self.processing_phase()?;
            self.termination_phase()?;

            if self.progress {
                backoff.reset();
            } else {
                backoff.wait();
            }
        }

        debug!(
            "stream solver {}: returned {} solution(s)",
            self.me, self.solutions_returned
        );
        Ok(())
    }

    fn combine(&mut self, pool: usize) {
        let user = self.user;
        self.pools[pool].combine(|parts| user.combine(parts));
    }

    /// Non-blocking inbound sweep. A master only admits new external
    /// traffic while its pool is drained and no work request is pending, so
    /// accepted problems cannot get buried under foreign load.
    fn master_phase(&mut self) -> Result<()> {
        if !self.is_master || self.blocked || !self.workpool.is_empty() || self.work_request_sent
        {
            return Ok(());
        }

        let envelope = self
            .ports
            .predecessors
            .iter()
            .find_map(|&src| self.endpoint.probe_from(src));

        let envelope = match envelope {
            Some(envelope) => envelope,
            None => return Ok(()),
        };
        self.progress = true;

        match envelope.tag {
            Tag::TerminationTest => {
                self.endpoint.receive_tag(envelope.src, Tag::TerminationTest)?;
            }
            Tag::Stop => {
                self.endpoint.receive_tag(envelope.src, Tag::Stop)?;
                self.received_stops += 1;

                if self.received_stops == self.ports.predecessors.len() {
                    // No further problems will arrive: give up the master
                    // role, tell everyone, and keep working as a helper
                    // until all masters have done the same.
                    for &peer in self.peers {
                        if peer != self.me {
                            self.endpoint.send_tag(peer, Tag::Stop)?;
                        }
                    }
                    self.internal_stops += 1;

                    for &sink in &self.ports.successors {
                        self.endpoint.send_tag(sink, Tag::Stop)?;
                    }

                    self.received_stops = 0;
                    self.blocked = true;
                    self.is_master = false;
                }
            }
            tag => {
                let problem: U::Problem = self.endpoint.receive(envelope.src, tag)?;

                if self.user.is_simple(&problem) {
                    let solution = self.user.solve(problem);
                    let dst = self.out_cursor.pick(
                        &self.ports.successors,
                        self.ctx.config().rotation,
                        &mut self.rng,
                    );
                    self.endpoint.send(dst, &solution, Tag::Data)?;
                    self.solutions_returned += 1;
                } else {
                    self.blocked = true;
                    self.workpool.insert(Frame::root(problem, self.primary_pool));
                }
            }
        }

        Ok(())
    }

    fn comm_phase(&mut self) -> Result<()> {
        if self.peers.len() > 1 {
            self.accept_solutions()?;

            if self.deep_combine_needed {
                let user = self.user;
                let mut any = false;
                for pool in self.pools.iter_mut() {
                    any |= pool.deep_combine(|parts| user.combine(parts));
                }
                self.deep_combine_needed = any;
            }

            self.drain_send_queues()?;
            self.answer_work_requests()?;
            self.request_work()?;
        }

        // Count surrender notices from the masters.
        for &master in &self.peers[..self.masters] {
            if master != self.me && self.endpoint.probe(master, Tag::Stop).is_some() {
                self.endpoint.receive_tag(master, Tag::Stop)?;
                self.internal_stops += 1;
                self.progress = true;
            }
        }

        Ok(())
    }

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
                let pool = frame.pool_id as usize;
                self.pools[pool].insert(frame);
                self.combine(pool);
                self.deep_combine_needed = true;
            }
        }

        Ok(())
    }

    /// Ships at most one queued solution per iteration, across all pools,
    /// honouring the work-request interlock.
    fn drain_send_queues(&mut self) -> Result<()> {
        if self.work_request_sent {
            return Ok(());
        }

        let pool = match (0..self.pools.len()).find(|&p| !self.pools[p].send_queue_is_empty()) {
            Some(pool) => pool,
            None => return Ok(()),
        };

        let originator = self.pools[pool].outgoing()?.originator as ProcessId;

        if self.me < originator {
            let frame = self.pools[pool].pop_outgoing()?;
            self.endpoint.send(originator, &frame, Tag::Solution)?;
            self.progress = true;
        } else if !self.send_request_sent {
            self.endpoint.send_tag(originator, Tag::SendRequest)?;
            self.send_request_sent = true;
        } else if self.endpoint.probe(originator, Tag::ReadySignal).is_some() {
            self.endpoint.receive_tag(originator, Tag::ReadySignal)?;
            let frame = self.pools[pool].pop_outgoing()?;
            self.endpoint.send(originator, &frame, Tag::Solution)?;
            self.send_request_sent = false;
            self.progress = true;
        }

        Ok(())
    }

    fn answer_work_requests(&mut self) -> Result<()> {
        for &peer in self.peers {
            if self.endpoint.probe(peer, Tag::WorkRequest).is_none() || self.send_request_sent {
                continue;
            }

            self.endpoint.receive_tag(peer, Tag::WorkRequest)?;
            self.progress = true;

            if !self.workpool.has_load() {
                self.endpoint.send_tag(peer, Tag::Rejection)?;
            } else {
                let frame = self.workpool.get_load()?;
                self.endpoint.send(peer, &frame, Tag::Subproblem)?;
            }
        }

        Ok(())
    }

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
        }

        Ok(())
    }

    fn processing_phase(&mut self) -> Result<()> {
        if self.finished || self.workpool.is_empty() {
            return Ok(());
        }

        self.progress = true;
        let frame = self.workpool.get()?;

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
            let frame = Frame::new(id, root_id, originator, pool_id, solution);

            if id == root_id {
                self.pools[pool_id as usize].push_outgoing(frame);
            } else {
                let pool = pool_id as usize;
                self.pools[pool].insert(frame);
                self.combine(pool);
            }
        }

        Ok(())
    }

    fn termination_phase(&mut self) -> Result<()> {
        // An active master returns the finished solution of its own pool.
        if self.is_master && !self.finished {
            let primary = self.primary_pool as usize;

            if self.pools[primary].has_solution() {
                let frame = self.pools[primary].pop()?;
                let dst = self.out_cursor.pick(
                    &self.ports.successors,
                    self.ctx.config().rotation,
                    &mut self.rng,
                );
                self.endpoint.send(dst, &frame.payload, Tag::Data)?;
                self.solutions_returned += 1;
                self.blocked = false;
                self.progress = true;
            }
        }

        // Everyone shuts down once every master has surrendered.
        if !self.is_master && self.internal_stops == self.masters {
            self.internal_stops = 0;
            self.finished = true;
        }

        Ok(())
    }
}

/// The streaming divide-and-conquer skeleton: `solvers` processes of which
/// the first `masters` accept external problem streams concurrently.
pub struct StreamDc<U: DivideConquer> {
    solvers: Vec<DcStreamSolver<U>>,
    ports: Ports,
}

impl<U: DivideConquer> StreamDc<U> {
    pub fn new(
        ctx: &ProcessCtx,
        user: U,
        solvers: usize,
        masters: usize,
        fan_out: usize,
    ) -> Self {
        assert!(solvers > 0, "need at least one solver");
        let masters = masters.clamp(1, solvers);
        let user = Arc::new(user);

        let mut solvers: Vec<DcStreamSolver<U>> = (0..solvers)
            .map(|_| DcStreamSolver::new(ctx, user.clone(), fan_out))
            .collect();

        let peers: Vec<ProcessId> = solvers.iter().map(|s| s.entrance()).collect();
        for solver in solvers.iter_mut() {
            solver.set_workmates(&peers, masters);
        }

        let ports = Ports {
            entrances: peers[..masters].to_vec(),
            exits: peers[..masters].to_vec(),
            predecessors: Vec::new(),
            successors: Vec::new(),
        };

        StreamDc { solvers, ports }
    }
}

impl<U: DivideConquer> Stage for StreamDc<U> {
    fn entrances(&self) -> &[ProcessId] {
        &self.ports.entrances
    }

    fn exits(&self) -> &[ProcessId] {
        &self.ports.exits
    }

    fn set_predecessors(&mut self, sources: &[ProcessId]) {
        self.ports.predecessors = sources.to_vec();
        let masters = self.ports.entrances.len();
        for solver in &mut self.solvers[..masters] {
            solver.set_predecessors(sources);
        }
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
