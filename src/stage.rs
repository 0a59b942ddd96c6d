//! Task-parallel composition operators: Pipe, Farm and the user-function
//! holder stages Initial, Final, Atomic and Filter.

use std::marker::PhantomData;

use fastrand::Rng;

use crate::error::{Result, SkeletonError};
use crate::process::{await_any, Ports, ReceiverCursor, Stage};
use crate::runtime::ProcessCtx;
use crate::serialize::Payload;
use crate::transport::{ProcessId, Tag};

/// Chains stages: the exit of each stage feeds the entrance of the next.
/// The pipe's entrance is the first stage's entrance, its exit the last
/// stage's exit.
pub struct Pipe<'a> {
    stages: Vec<Box<dyn Stage + 'a>>,
    entrances: Vec<ProcessId>,
    exits: Vec<ProcessId>,
}

impl<'a> Pipe<'a> {
    pub fn new(mut stages: Vec<Box<dyn Stage + 'a>>) -> Self {
        assert!(!stages.is_empty(), "a pipe needs at least one stage");

        for at in 0..stages.len() - 1 {
            let downstream = stages[at + 1].entrances().to_vec();
            let upstream = stages[at].exits().to_vec();
            stages[at].set_successors(&downstream);
            stages[at + 1].set_predecessors(&upstream);
        }

        let entrances = stages[0].entrances().to_vec();
        let exits = stages[stages.len() - 1].exits().to_vec();

        Pipe {
            stages,
            entrances,
            exits,
        }
    }
}

impl Stage for Pipe<'_> {
    fn entrances(&self) -> &[ProcessId] {
        &self.entrances
    }

    fn exits(&self) -> &[ProcessId] {
        &self.exits
    }

    fn set_predecessors(&mut self, sources: &[ProcessId]) {
        self.stages[0].set_predecessors(sources);
    }

    fn set_successors(&mut self, sinks: &[ProcessId]) {
        let last = self.stages.len() - 1;
        self.stages[last].set_successors(sinks);
    }

    fn start(&mut self, ctx: &ProcessCtx) -> Result<()> {
        for stage in &mut self.stages {
            stage.start(ctx)?;
        }
        Ok(())
    }
}

/// Replicates a worker stage. Every worker is both an entrance and an exit
/// of the farm; upstream stages rotate over the entrances according to the
/// process-wide receiver policy.
pub struct Farm<'a> {
    workers: Vec<Box<dyn Stage + 'a>>,
    entrances: Vec<ProcessId>,
    exits: Vec<ProcessId>,
}

impl<'a> Farm<'a> {
    /// Builds `count` workers. The builder is invoked once per replica and
    /// allocates fresh process slots each time.
    pub fn new(count: usize, mut build: impl FnMut() -> Box<dyn Stage + 'a>) -> Self {
        assert!(count > 0, "a farm needs at least one worker");
        let workers: Vec<_> = (0..count).map(|_| build()).collect();

        let entrances = workers
            .iter()
            .flat_map(|w| w.entrances().iter().copied())
            .collect();
        let exits = workers
            .iter()
            .flat_map(|w| w.exits().iter().copied())
            .collect();

        Farm {
            workers,
            entrances,
            exits,
        }
    }
}

impl Stage for Farm<'_> {
    fn entrances(&self) -> &[ProcessId] {
        &self.entrances
    }

    fn exits(&self) -> &[ProcessId] {
        &self.exits
    }

    fn set_predecessors(&mut self, sources: &[ProcessId]) {
        for worker in &mut self.workers {
            worker.set_predecessors(sources);
        }
    }

    fn set_successors(&mut self, sinks: &[ProcessId]) {
        for worker in &mut self.workers {
            worker.set_successors(sinks);
        }
    }

    fn start(&mut self, ctx: &ProcessCtx) -> Result<()> {
        for worker in &mut self.workers {
            worker.start(ctx)?;
        }
        Ok(())
    }
}

/// Produces a stream of values and closes it with STOP.
pub struct Initial<T, F> {
    slot: ProcessId,
    ports: Ports,
    produce: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F: FnMut() -> Option<T>> Initial<T, F> {
    pub fn new(ctx: &ProcessCtx, produce: F) -> Self {
        let slot = ctx.alloc_slots(1);
        Initial {
            slot,
            ports: Ports::single(slot),
            produce,
            _payload: PhantomData,
        }
    }
}

impl<T: Payload, F: FnMut() -> Option<T>> Stage for Initial<T, F> {
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

        let endpoint = ctx.endpoint();
        let mut cursor = ReceiverCursor::new();
        let mut rng = Rng::new();

        while let Some(value) = (self.produce)() {
            let dst = cursor.pick(&self.ports.successors, ctx.config().rotation, &mut rng);
            endpoint.send(dst, &value, Tag::Data)?;
        }

        for &sink in &self.ports.successors {
            endpoint.send_tag(sink, Tag::Stop)?;
        }

        Ok(())
    }
}

/// Consumes the stream arriving from its predecessors.
pub struct Final<T, F> {
    slot: ProcessId,
    ports: Ports,
    consume: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, F: FnMut(T)> Final<T, F> {
    pub fn new(ctx: &ProcessCtx, consume: F) -> Self {
        let slot = ctx.alloc_slots(1);
        Final {
            slot,
            ports: Ports::single(slot),
            consume,
            _payload: PhantomData,
        }
    }
}

impl<T: Payload, F: FnMut(T)> Stage for Final<T, F> {
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

        let endpoint = ctx.endpoint();
        let mut cursor = 0;
        let mut stops = 0;

        loop {
            let envelope = await_any(ctx, &self.ports.predecessors, &mut cursor);

            match envelope.tag {
                Tag::Stop => {
                    endpoint.receive_tag(envelope.src, Tag::Stop)?;
                    stops += 1;

                    if stops == self.ports.predecessors.len() {
                        for &sink in &self.ports.successors {
                            endpoint.send_tag(sink, Tag::Stop)?;
                        }
                        return Ok(());
                    }
                }
                Tag::TerminationTest => {
                    endpoint.receive_tag(envelope.src, Tag::TerminationTest)?;
                }
                tag => {
                    let value: T = endpoint.receive(envelope.src, tag)?;
                    (self.consume)(value);
                }
            }
        }
    }
}

/// Applies a user function to every datum passing through.
pub struct Atomic<I, O, F> {
    slot: ProcessId,
    ports: Ports,
    apply: F,
    _payload: PhantomData<fn(I) -> O>,
}

impl<I, O, F: FnMut(I) -> O> Atomic<I, O, F> {
    /// `slots` reserves that many process slots for the stage; only the
    /// entrance executes the user function.
    pub fn new(ctx: &ProcessCtx, slots: usize, apply: F) -> Self {
        let slot = ctx.alloc_slots(slots.max(1));
        Atomic {
            slot,
            ports: Ports::single(slot),
            apply,
            _payload: PhantomData,
        }
    }
}

impl<I: Payload, O: Payload, F: FnMut(I) -> O> Stage for Atomic<I, O, F> {
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

        let endpoint = ctx.endpoint();
        let mut pred_cursor = 0;
        let mut out_cursor = ReceiverCursor::new();
        let mut rng = Rng::new();
        let mut stops = 0;

        loop {
            let envelope = await_any(ctx, &self.ports.predecessors, &mut pred_cursor);

            match envelope.tag {
                Tag::Stop => {
                    endpoint.receive_tag(envelope.src, Tag::Stop)?;
                    stops += 1;

                    if stops == self.ports.predecessors.len() {
                        for &sink in &self.ports.successors {
                            endpoint.send_tag(sink, Tag::Stop)?;
                        }
                        return Ok(());
                    }
                }
                Tag::TerminationTest => {
                    endpoint.receive_tag(envelope.src, Tag::TerminationTest)?;
                }
                tag => {
                    let value: I = endpoint.receive(envelope.src, tag)?;
                    let out = (self.apply)(value);
                    let dst = out_cursor.pick(
                        &self.ports.successors,
                        ctx.config().rotation,
                        &mut rng,
                    );
                    endpoint.send(dst, &out, Tag::Data)?;
                }
            }
        }
    }
}

/// Stream access handle passed to a [`Filter`] user function. Fetching and
/// emitting are only possible through this handle, which exists exclusively
/// while the filter stage runs.
pub struct FilterCtx<'a, I, O> {
    ctx: &'a ProcessCtx,
    ports: &'a Ports,
    pred_cursor: usize,
    out_cursor: ReceiverCursor,
    rng: Rng,
    stops: usize,
    stopped: bool,
    _payload: PhantomData<fn(I) -> O>,
}

impl<I: Payload, O: Payload> FilterCtx<'_, I, O> {
    /// Blocks for the next upstream datum. Returns `None` once every
    /// predecessor has sent STOP; the STOPs are forwarded downstream before
    /// returning.
    pub fn fetch(&mut self) -> Result<Option<I>> {
        if self.stopped {
            return Ok(None);
        }

        let endpoint = self.ctx.endpoint();

        loop {
            let envelope = await_any(self.ctx, &self.ports.predecessors, &mut self.pred_cursor);

            match envelope.tag {
                Tag::Stop => {
                    endpoint.receive_tag(envelope.src, Tag::Stop)?;
                    self.stops += 1;

                    if self.stops == self.ports.predecessors.len() {
                        for &sink in &self.ports.successors {
                            endpoint.send_tag(sink, Tag::Stop)?;
                        }
                        self.stopped = true;
                        return Ok(None);
                    }
                }
                Tag::TerminationTest => {
                    endpoint.receive_tag(envelope.src, Tag::TerminationTest)?;
                }
                tag => return endpoint.receive(envelope.src, tag).map(Some),
            }
        }
    }

    /// Sends a result downstream, rotating over the successors.
    pub fn emit(&mut self, value: &O) -> Result<()> {
        if self.ports.successors.is_empty() {
            return Err(SkeletonError::IllegalFilterAccess {
                process: self.ctx.id(),
            });
        }

        let dst = self.out_cursor.pick(
            &self.ports.successors,
            self.ctx.config().rotation,
            &mut self.rng,
        );
        self.ctx.endpoint().send(dst, value, Tag::Data)
    }
}

/// A stage whose user function drives the stream itself: it may fetch any
/// number of inputs and emit any number of outputs through the explicit
/// [`FilterCtx`] handle.
pub struct Filter<I, O, F> {
    slot: ProcessId,
    ports: Ports,
    body: F,
    _payload: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Filter<I, O, F>
where
    F: FnMut(&mut FilterCtx<'_, I, O>) -> Result<()>,
{
    pub fn new(ctx: &ProcessCtx, slots: usize, body: F) -> Self {
        let slot = ctx.alloc_slots(slots.max(1));
        Filter {
            slot,
            ports: Ports::single(slot),
            body,
            _payload: PhantomData,
        }
    }
}

impl<I: Payload, O: Payload, F> Stage for Filter<I, O, F>
where
    F: FnMut(&mut FilterCtx<'_, I, O>) -> Result<()>,
{
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

        let mut filter_ctx = FilterCtx {
            ctx,
            ports: &self.ports,
            pred_cursor: 0,
            out_cursor: ReceiverCursor::new(),
            rng: Rng::new(),
            stops: 0,
            stopped: false,
            _payload: PhantomData,
        };

        (self.body)(&mut filter_ctx)?;

        // Drain remaining STOPs so downstream learns about the shutdown
        // even if the user function returned early.
        while !filter_ctx.stopped {
            if filter_ctx.fetch()?.is_none() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::run;
    use std::cell::RefCell;

    #[test]
    fn test_pipe_initial_atomic_final() {
        let results = run(RuntimeConfig::new(3), |ctx| {
            let mut inputs = vec![1i64, 2, 3, 4];
            inputs.reverse();
            let inputs = RefCell::new(inputs);
            let outputs = RefCell::new(Vec::new());

            let initial = Initial::new(ctx, || inputs.borrow_mut().pop());
            let double = Atomic::new(ctx, 1, |v: i64| v * 2);
            let sink = Final::new(ctx, |v: i64| outputs.borrow_mut().push(v));

            let mut pipe = Pipe::new(vec![Box::new(initial), Box::new(double), Box::new(sink)]);
            pipe.start(ctx)?;
            drop(pipe);

            Ok(outputs.into_inner())
        })
        .unwrap();

        // The sink ran on process slot 2.
        assert_eq!(results[2], vec![2, 4, 6, 8]);
        assert!(results[0].is_empty());
    }

    #[test]
    fn test_farm_processes_whole_stream() {
        let results = run(RuntimeConfig::new(4), |ctx| {
            let mut next = 0i64;
            let outputs = RefCell::new(Vec::new());

            let initial = Initial::new(ctx, move || {
                next += 1;
                (next <= 10).then_some(next)
            });
            let farm = Farm::new(2, || {
                Box::new(Atomic::new(ctx, 1, |v: i64| v * v)) as Box<dyn Stage>
            });
            let sink = Final::new(ctx, |v: i64| outputs.borrow_mut().push(v));

            let mut pipe = Pipe::new(vec![Box::new(initial), Box::new(farm), Box::new(sink)]);
            pipe.start(ctx)?;
            drop(pipe);

            Ok(outputs.into_inner())
        })
        .unwrap();

        let mut collected = results[3].clone();
        collected.sort_unstable();
        assert_eq!(collected, vec![1, 4, 9, 16, 25, 36, 49, 64, 81, 100]);
    }

    #[test]
    fn test_filter_fetch_emit() {
        let results = run(RuntimeConfig::new(3), |ctx| {
            let mut next = 0i64;
            let outputs = RefCell::new(Vec::new());

            let initial = Initial::new(ctx, move || {
                next += 1;
                (next <= 6).then_some(next)
            });
            // Emits only even inputs, halved.
            let filter = Filter::new(ctx, 1, |f: &mut FilterCtx<'_, i64, i64>| {
                while let Some(value) = f.fetch()? {
                    if value % 2 == 0 {
                        f.emit(&(value / 2))?;
                    }
                }
                Ok(())
            });
            let sink = Final::new(ctx, |v: i64| outputs.borrow_mut().push(v));

            let mut pipe = Pipe::new(vec![Box::new(initial), Box::new(filter), Box::new(sink)]);
            pipe.start(ctx)?;
            drop(pipe);

            Ok(outputs.into_inner())
        })
        .unwrap();

        assert_eq!(results[2], vec![1, 2, 3]);
    }
}
