//! SPMD runtime: one thread per process slot.
//!
//! [`run`] spawns `config.processes` threads, hands each a [`ProcessCtx`]
//! and executes the same program closure on all of them. The closure builds
//! the stage topology (allocating process slots deterministically, so every
//! thread derives the same layout) and starts it; stages whose slots do not
//! match the executing process return immediately from `start`.

use std::cell::Cell;
use std::time::{Duration, Instant};

use log::info;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::transport::{Endpoint, ProcessId};

pub struct ProcessCtx {
    config: RuntimeConfig,
    endpoint: Endpoint,
    next_slot: Cell<ProcessId>,
}

impl ProcessCtx {
    pub fn id(&self) -> ProcessId {
        self.endpoint.id()
    }

    pub fn processes(&self) -> usize {
        self.config.processes
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Claims `count` consecutive process slots for a stage and returns the
    /// first. Every process runs the same topology-building code, so slot
    /// assignment is identical across the whole runtime.
    pub fn alloc_slots(&self, count: usize) -> ProcessId {
        let first = self.next_slot.get();
        self.next_slot.set(first + count);
        first
    }
}

/// Launches the runtime and blocks until every process has finished.
/// Returns the per-process results of `program` in process-id order.
pub fn run<R, F>(config: RuntimeConfig, program: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(&ProcessCtx) -> Result<R> + Send + Sync,
{
    info!(
        "starting runtime with {} process slot(s)",
        config.processes
    );
    let started = Instant::now();
    let endpoints = Endpoint::full_mesh(config.processes);
    let program = &program;
    // No endpoint may be torn down while a peer could still address it:
    // every process parks here after its program ends, shutdown is joint.
    let shutdown = std::sync::Barrier::new(config.processes);
    let shutdown = &shutdown;

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let config = config.clone();
                scope.spawn(move || {
                    let ctx = ProcessCtx {
                        config,
                        endpoint,
                        next_slot: Cell::new(0),
                    };
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        program(&ctx)
                    }));
                    // Park until every process is done; tearing an endpoint
                    // down earlier would make sends to it fail spuriously.
                    shutdown.wait();
                    match result {
                        Ok(result) => result,
                        Err(payload) => std::panic::resume_unwind(payload),
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect::<Result<Vec<_>>>()
    })?;

    info!("runtime finished in {}", human_duration(started.elapsed()));
    Ok(results)
}

pub(crate) fn human_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 0.000_001 {
        format!("{:.1}ns", total_secs * 1_000_000_000.0)
    } else if total_secs < 0.001 {
        format!("{:.1}µs", total_secs * 1_000_000.0)
    } else if total_secs < 1.0 {
        format!("{:.1}ms", total_secs * 1000.0)
    } else {
        format!("{:.1}s", total_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Tag;

    #[test]
    fn test_run_returns_per_process_results() {
        let results = run(RuntimeConfig::new(4), |ctx| Ok(ctx.id() * 2)).unwrap();
        assert_eq!(results, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_slot_allocation_is_deterministic() {
        let results = run(RuntimeConfig::new(3), |ctx| {
            let a = ctx.alloc_slots(2);
            let b = ctx.alloc_slots(1);
            Ok((a, b))
        })
        .unwrap();

        assert!(results.iter().all(|&r| r == (0, 2)));
    }

    #[test]
    fn test_processes_can_message_each_other() {
        let results = run(RuntimeConfig::new(2), |ctx| {
            let ep = ctx.endpoint();
            if ctx.id() == 0 {
                ep.send(1, &123i32, Tag::Data)?;
                Ok(0)
            } else {
                ep.receive::<i32>(0, Tag::Data)
            }
        })
        .unwrap();

        assert_eq!(results[1], 123);
    }

    #[test]
    fn test_human_duration_units() {
        assert_eq!(human_duration(Duration::from_nanos(120)), "120.0ns");
        assert_eq!(human_duration(Duration::from_micros(42)), "42.0µs");
        assert_eq!(human_duration(Duration::from_millis(8)), "8.0ms");
        assert_eq!(human_duration(Duration::from_secs(3)), "3.0s");
    }
}
