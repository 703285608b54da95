//! Approval of agent-requested writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sheet_agents_core::{Command, RefKind, SheetBounds, SpreadsheetRef, traits::InvocationId};
use thiserror::Error;

/// Default cell count above which a plan needs confirmation.
pub const DEFAULT_MAX_CELLS: u64 = 1000;

/// Outcome of reviewing a write plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Writes may proceed.
    Approved,
    /// Writes are refused.
    Denied { reason: String },
}

/// Approval error. Callers treat any error as a denial.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The handler could not reach a decision.
    #[error("Approval request failed: {0}")]
    RequestFailed(String),
    /// No decision arrived within the caller's deadline.
    #[error("Approval request timed out")]
    TimedOut,
}

/// Summary of what a batch of commands will write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePreview {
    /// Number of write commands.
    pub writes: usize,
    /// Cells touched by those writes.
    pub total_cells: u64,
    /// Addresses written, in plan order.
    pub addresses: Vec<String>,
}

impl WritePreview {
    /// Estimate the footprint of `commands`. Reads are ignored.
    #[must_use]
    pub fn summarize<'a>(commands: impl IntoIterator<Item = &'a Command>) -> Self {
        let mut preview = Self::default();
        for command in commands {
            let (address, cells) = match command {
                Command::SetCell { address, .. } => (address, footprint(RefKind::Cell, address, 1)),
                // Row and column writes only touch the cells they carry.
                Command::SetRow { address, values } | Command::SetColumn { address, values } => {
                    (address, values.len() as u64)
                }
                Command::SetRange { address, values } => {
                    let written = values.iter().map(|row| row.len() as u64).sum();
                    (address, footprint(RefKind::Range, address, written))
                }
                _ => continue,
            };
            preview.writes += 1;
            preview.total_cells += cells;
            preview.addresses.push(address.clone());
        }
        preview
    }

    #[must_use]
    pub const fn exceeds(&self, max_cells: u64) -> bool {
        self.total_cells > max_cells
    }
}

/// Cells covered by `address`, or `fallback` if it does not parse as `kind`.
///
/// Only cell and range kinds are passed, so the bounds never come into play.
fn footprint(kind: RefKind, address: &str, fallback: u64) -> u64 {
    SpreadsheetRef::parse_as(kind, address).map_or(fallback, |r| r.cell_count(SheetBounds::default()))
}

/// Trait for reviewing agent-requested writes before they are applied.
///
/// Implement this trait to integrate with your approval UI/system.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Review the writes an invocation wants to apply.
    async fn review(
        &self,
        invocation_id: InvocationId,
        preview: &WritePreview,
    ) -> Result<ApprovalStatus, ApprovalError>;
}

/// No-op approval handler that approves everything.
#[derive(Debug, Default, Clone)]
pub struct AutoApproveHandler;

#[async_trait]
impl ApprovalHandler for AutoApproveHandler {
    async fn review(
        &self,
        _invocation_id: InvocationId,
        _preview: &WritePreview,
    ) -> Result<ApprovalStatus, ApprovalError> {
        Ok(ApprovalStatus::Approved)
    }
}

/// Denies plans that write more than `max_cells` cells.
///
/// There is nobody to confirm a large operation interactively, so anything
/// that would need confirmation is refused.
#[derive(Debug, Clone)]
pub struct CellLimitHandler {
    max_cells: u64,
}

impl CellLimitHandler {
    #[must_use]
    pub const fn new(max_cells: u64) -> Self {
        Self { max_cells }
    }
}

impl Default for CellLimitHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CELLS)
    }
}

#[async_trait]
impl ApprovalHandler for CellLimitHandler {
    async fn review(
        &self,
        invocation_id: InvocationId,
        preview: &WritePreview,
    ) -> Result<ApprovalStatus, ApprovalError> {
        if preview.exceeds(self.max_cells) {
            tracing::warn!(
                "Invocation {invocation_id} wants to write {} cells (limit {})",
                preview.total_cells,
                self.max_cells
            );
            return Ok(ApprovalStatus::Denied {
                reason: format!(
                    "LARGE_OPERATION: {} cells exceeds the limit of {}",
                    preview.total_cells, self.max_cells
                ),
            });
        }
        Ok(ApprovalStatus::Approved)
    }
}
