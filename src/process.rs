//! Stage plumbing shared by all skeletons.
//!
//! A [`Stage`] occupies a contiguous range of process slots; the first slot
//! is its entrance. Composition operators wire exits to entrances through
//! [`Ports`]. Receiver rotation and STOP counting follow the same rules for
//! every stage: a stage forwards STOP downstream only once every
//! predecessor has stopped, and never sends data afterwards.

use fastrand::Rng;

use crate::config::ReceiverRotation;
use crate::error::Result;
use crate::runtime::ProcessCtx;
use crate::transport::ProcessId;

pub trait Stage {
    fn entrances(&self) -> &[ProcessId];
    fn exits(&self) -> &[ProcessId];
    fn set_predecessors(&mut self, sources: &[ProcessId]);
    fn set_successors(&mut self, sinks: &[ProcessId]);

    /// Runs this stage on the current process. Stages whose slots do not
    /// include the process id return immediately.
    fn start(&mut self, ctx: &ProcessCtx) -> Result<()>;
}

/// The wiring of one stage: where it can be entered and left, and which
/// processes it may talk to.
#[derive(Debug, Default, Clone)]
pub struct Ports {
    pub entrances: Vec<ProcessId>,
    pub exits: Vec<ProcessId>,
    pub predecessors: Vec<ProcessId>,
    pub successors: Vec<ProcessId>,
}

impl Ports {
    pub fn single(slot: ProcessId) -> Self {
        Ports {
            entrances: vec![slot],
            exits: vec![slot],
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }
}

/// Picks the receiver of the next outgoing message from a successor list,
/// either cyclically or at random.
pub struct ReceiverCursor {
    next: usize,
}

impl ReceiverCursor {
    pub fn new() -> Self {
        ReceiverCursor { next: 0 }
    }

    pub fn pick(
        &mut self,
        successors: &[ProcessId],
        rotation: ReceiverRotation,
        rng: &mut Rng,
    ) -> ProcessId {
        debug_assert!(!successors.is_empty(), "stage has no successors");

        match rotation {
            ReceiverRotation::Random => successors[rng.usize(0..successors.len())],
            ReceiverRotation::Cyclic => {
                let picked = successors[self.next % successors.len()];
                self.next = (self.next + 1) % successors.len();
                picked
            }
        }
    }
}

impl Default for ReceiverCursor {
    fn default() -> Self {
        ReceiverCursor::new()
    }
}

/// Tiered backoff for the non-blocking poll loops: spin first, then yield,
/// then sleep with exponential growth up to a cap. Reset whenever a poll
/// makes progress.
pub struct Backoff {
    spins: usize,
    yields: usize,
    sleep: std::time::Duration,
}

impl Backoff {
    const SPIN_LIMIT: usize = 64;
    const YIELD_LIMIT: usize = 256;
    const INITIAL_SLEEP: std::time::Duration = std::time::Duration::from_micros(10);
    const SLEEP_LIMIT: std::time::Duration = std::time::Duration::from_millis(2);

    pub fn new() -> Self {
        Backoff {
            spins: 0,
            yields: 0,
            sleep: Self::INITIAL_SLEEP,
        }
    }

    pub fn wait(&mut self) {
        if self.spins < Self::SPIN_LIMIT {
            std::hint::spin_loop();
            self.spins += 1;
        } else if self.yields < Self::YIELD_LIMIT {
            std::thread::yield_now();
            self.yields += 1;
        } else {
            std::thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(Self::SLEEP_LIMIT);
        }
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.sleep = Self::INITIAL_SLEEP;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

/// Blocks until any message from one of `sources` is pending, probing
/// fairly in rotation. Returns the source that has a message.
pub fn await_any(
    ctx: &ProcessCtx,
    sources: &[ProcessId],
    cursor: &mut usize,
) -> crate::transport::Envelope {
    let endpoint = ctx.endpoint();
    let mut backoff = Backoff::new();

    loop {
        for _ in 0..sources.len() {
            let src = sources[*cursor];
            *cursor = (*cursor + 1) % sources.len();

            if let Some(envelope) = endpoint.probe_from(src) {
                return envelope;
            }
        }

        backoff.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_rotation_visits_all_successors() {
        let successors = vec![4, 5, 6];
        let mut cursor = ReceiverCursor::new();
        let mut rng = Rng::with_seed(1);

        let picked: Vec<_> = (0..6)
            .map(|_| cursor.pick(&successors, ReceiverRotation::Cyclic, &mut rng))
            .collect();
        assert_eq!(picked, vec![4, 5, 6, 4, 5, 6]);
    }

    #[test]
    fn test_random_rotation_stays_in_successor_set() {
        let successors = vec![7, 9];
        let mut cursor = ReceiverCursor::new();
        let mut rng = Rng::with_seed(7);

        for _ in 0..32 {
            let picked = cursor.pick(&successors, ReceiverRotation::Random, &mut rng);
            assert!(successors.contains(&picked));
        }
    }
}
