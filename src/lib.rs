//! Distributed algorithmic skeletons: a process-group runtime with typed
//! message transport and hypercube collectives, decentralized
//! branch-and-bound and divide-and-conquer engines, and a distributed
//! sparse matrix with data-parallel skeletons.

pub mod collective;
pub mod config;
pub mod error;
pub mod frame;
pub mod matrix;
pub mod pool;
pub mod process;
pub mod runtime;
pub mod serialize;
pub mod solver;
pub mod stage;
pub mod tracker;
pub mod transport;

pub use config::{ReceiverRotation, RuntimeConfig};
pub use error::{Result, SkeletonError};
pub use runtime::{run, ProcessCtx};
pub use solver::{BranchBound, DivideConquer, Topology};
