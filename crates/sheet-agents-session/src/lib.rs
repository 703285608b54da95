//! Session coordination for spreadsheet agents.
//!
//! Provides:
//! - `Controller` - Session table, command routing and event delivery
//! - `Scheduler` - Bounded-concurrency agent invocations
//! - Storage implementations (memory)

pub mod context;
pub mod controller;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use context::{SessionContext, SessionState};
pub use controller::{Controller, ControllerConfig, ControllerStats, SessionHandle};
pub use scheduler::{CancelOutcome, Completion, Outcome, Scheduler, SchedulerConfig, SchedulerError};
#[cfg(feature = "memory")]
pub use storage::MemoryStore;
