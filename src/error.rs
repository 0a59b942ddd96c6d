use crate::transport::ProcessId;

/// Errors raised by the runtime, the transport and the distributed data
/// structures. None of these is recovered internally; an error reaching the
/// top of a process loop ends that process.
#[derive(Debug, thiserror::Error)]
pub enum SkeletonError {
    /// A send or receive named a process id that is not part of the network.
    #[error("process {process}: {peer} is not a valid message endpoint")]
    UndefinedPeer { process: ProcessId, peer: ProcessId },

    /// The peer's endpoint has been dropped while a transfer was pending.
    #[error("process {process}: peer {peer} has left the network")]
    PeerClosed { process: ProcessId, peer: ProcessId },

    /// `top`/`pop` on an empty pool, queue or stack. Callers are expected to
    /// guard with the corresponding `is_empty`.
    #[error("{container} is empty")]
    EmptyContainer { container: &'static str },

    /// A matrix access outside [0, n) x [0, m).
    #[error("index ({row}, {col}) lies outside a {rows}x{cols} matrix")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    /// A filter stage context was asked to emit without any wired successor.
    #[error("process {process}: filter stage has no successor to emit to")]
    IllegalFilterAccess { process: ProcessId },
}

pub type Result<T> = std::result::Result<T, SkeletonError>;
