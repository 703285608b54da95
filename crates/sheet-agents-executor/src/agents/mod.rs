//! Agent runtime backends.

pub mod echo;
pub mod plan;

pub use echo::EchoAgent;
pub use plan::{ExecutionPlan, PlanAgent};
