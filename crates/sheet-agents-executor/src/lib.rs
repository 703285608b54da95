//! Agent runtimes and the tool-call boundary between agents and the sheet.
//!
//! Provides:
//! - `EchoAgent` and `PlanAgent` runtime backends
//! - Tool-call to command translation
//! - Approval handler trait for agent-requested writes

pub mod agents;
pub mod approvals;
pub mod tools;

pub use agents::{EchoAgent, ExecutionPlan, PlanAgent};
pub use approvals::{
    ApprovalError, ApprovalHandler, ApprovalStatus, AutoApproveHandler, CellLimitHandler,
    WritePreview,
};
pub use tools::{ToolError, to_command, to_commands};
