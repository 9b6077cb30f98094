//! Dependency-graph scheduling for requested operations.
//!
//! - `builder` — graph construction and cycle detection
//! - `scheduler` — ready-queue topological state
//! - `executor` — bounded-concurrency execution plus the linear mode

pub mod builder;
pub mod executor;
pub mod scheduler;

pub use builder::{GraphBuilder, OperationGraph};
pub use executor::{DagExecutor, OperationExecutor};
pub use scheduler::{OpScheduler, OperationStatus};
