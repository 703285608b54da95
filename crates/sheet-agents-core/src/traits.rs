//! Capabilities the controller consumes: spreadsheet storage and agent execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    address::{CellAddr, CellRange, SheetBounds},
    command::AgentReply,
    value::CellValue,
};

/// Session identifier.
pub type SessionId = Uuid;

/// Invocation identifier, unique per process.
pub type InvocationId = Uuid;

/// Invocation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// Admitted, waiting for a concurrency slot.
    Pending,
    /// Agent is executing.
    Running,
    /// Agent returned a reply.
    Completed,
    /// Agent failed.
    Failed,
    /// Cancelled before running, or the agent acknowledged cancellation.
    Cancelled,
}

impl InvocationState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: InvocationId,
    /// Owning session, fixed for the invocation's lifetime.
    pub session_id: SessionId,
    pub input: String,
    pub state: InvocationState,
    /// Agent output or failure reason once terminal.
    pub result: Option<String>,
}

/// Storage error, passed through to the session unchanged.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
    #[error("Shape mismatch: expected {expected} cells, got {found}")]
    ShapeMismatch { expected: u64, found: u64 },
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for spreadsheet storage backends.
///
/// Consistency between concurrent writers of the same address is the
/// backend's contract; the controller never issues overlapping writes from
/// one session.
#[async_trait]
pub trait SpreadsheetStore: Send + Sync {
    /// Current sheet dimensions.
    async fn bounds(&self) -> Result<SheetBounds, StoreError>;

    async fn get_cell(&self, cell: CellAddr) -> Result<CellValue, StoreError>;

    /// Whole row, one value per column.
    async fn get_row(&self, row: u32) -> Result<Vec<CellValue>, StoreError>;

    /// Whole column, one value per row.
    async fn get_column(&self, col: u32) -> Result<Vec<CellValue>, StoreError>;

    /// Row-major grid.
    async fn get_range(&self, range: CellRange) -> Result<Vec<Vec<CellValue>>, StoreError>;

    async fn set_cell(&self, cell: CellAddr, value: CellValue) -> Result<(), StoreError>;

    /// Write from the first column onwards.
    async fn set_row(&self, row: u32, values: Vec<CellValue>) -> Result<(), StoreError>;

    /// Write from the first row onwards.
    async fn set_column(&self, col: u32, values: Vec<CellValue>) -> Result<(), StoreError>;

    async fn set_range(
        &self,
        range: CellRange,
        values: Vec<Vec<CellValue>>,
    ) -> Result<(), StoreError>;

    /// Evaluate a function or query against the sheet.
    async fn execute_function(&self, query: &str) -> Result<CellValue, StoreError>;
}

/// Agent failure.
#[derive(Debug, Clone, Error)]
pub enum AgentFailure {
    /// The agent observed cancellation and stopped.
    #[error("Cancelled")]
    Cancelled,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
}

/// Trait for agent runtimes.
///
/// Cancellation is cooperative: the runtime should watch `cancel` and return
/// [`AgentFailure::Cancelled`] once it stops. A runtime that ignores it runs to
/// completion and its reply is discarded.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Execute one invocation.
    async fn invoke(&self, input: &str, cancel: CancellationToken)
    -> Result<AgentReply, AgentFailure>;
}
