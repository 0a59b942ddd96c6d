//! Process-wide configuration.
//!
//! Everything a stage needs to know about the run as a whole lives in one
//! value that the runtime hands to each process. There are no globals.

/// How a stage picks the successor for its next outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverRotation {
    /// Round-robin over the successor list.
    Cyclic,
    /// Uniformly random successor.
    Random,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Total number of process slots.
    pub processes: usize,
    /// Dominant receiver-rotation policy for all stages.
    pub rotation: ReceiverRotation,
    /// Whether payloads are shipped through the byte serializer. The
    /// transport always serializes; the flag is recorded for diagnostics.
    pub serialized: bool,
    /// Chance in percent that a busy branch-and-bound solver publishes a
    /// lower-bound hint to a random peer per iteration.
    pub steal_percent: u32,
}

impl RuntimeConfig {
    pub fn new(processes: usize) -> Self {
        RuntimeConfig {
            processes,
            rotation: ReceiverRotation::Cyclic,
            serialized: true,
            steal_percent: 50,
        }
    }

    pub fn rotation(mut self, rotation: ReceiverRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn steal_percent(mut self, percent: u32) -> Self {
        self.steal_percent = percent.min(100);
        self
    }
}
