//! Inbound commands and agent tool calls.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{error::ControllerError, traits::InvocationId, value::CellValue};

/// Longest text accepted in a single cell, in characters.
pub const MAX_TEXT_LEN: usize = 100_000;

/// Longest formula accepted, in characters. Applies to `execute_function`
/// queries and to cell text starting with `=`.
pub const MAX_FORMULA_LEN: usize = 50_000;

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    GetCell { address: String },
    GetRow { address: String },
    GetColumn { address: String },
    GetRange { address: String },
    SetCell { address: String, value: CellValue },
    /// Write `values` into the row, starting at the first column.
    SetRow { address: String, values: Vec<CellValue> },
    /// Write `values` into the column, starting at the first row.
    SetColumn { address: String, values: Vec<CellValue> },
    /// Write a row-major grid; its shape must match the range.
    SetRange { address: String, values: Vec<Vec<CellValue>> },
    ExecuteFunction { query: String },
    ScheduleAgent { input: String },
    CancelAgent { invocation_id: InvocationId },
}

impl Command {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetCell { .. } => "get_cell",
            Self::GetRow { .. } => "get_row",
            Self::GetColumn { .. } => "get_column",
            Self::GetRange { .. } => "get_range",
            Self::SetCell { .. } => "set_cell",
            Self::SetRow { .. } => "set_row",
            Self::SetColumn { .. } => "set_column",
            Self::SetRange { .. } => "set_range",
            Self::ExecuteFunction { .. } => "execute_function",
            Self::ScheduleAgent { .. } => "schedule_agent",
            Self::CancelAgent { .. } => "cancel_agent",
        }
    }

    /// Whether the command mutates the store.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(
            self,
            Self::SetCell { .. } | Self::SetRow { .. } | Self::SetColumn { .. } | Self::SetRange { .. }
        )
    }

    /// Reject oversized text values and formulas.
    ///
    /// # Errors
    /// Returns [`ControllerError::InvalidCommand`] naming the first value over
    /// its limit.
    pub fn check_limits(&self) -> Result<(), ControllerError> {
        match self {
            Self::SetCell { value, .. } => check_value(value),
            Self::SetRow { values, .. } | Self::SetColumn { values, .. } => {
                values.iter().try_for_each(check_value)
            }
            Self::SetRange { values, .. } => values.iter().flatten().try_for_each(check_value),
            Self::ExecuteFunction { query } => check_formula(query),
            _ => Ok(()),
        }
    }
}

fn check_value(value: &CellValue) -> Result<(), ControllerError> {
    match value {
        CellValue::Text(text) if text.starts_with('=') => check_formula(text),
        CellValue::Text(text) if text.chars().count() > MAX_TEXT_LEN => Err(
            ControllerError::InvalidCommand(format!("Text too long (max {MAX_TEXT_LEN} characters)")),
        ),
        _ => Ok(()),
    }
}

fn check_formula(formula: &str) -> Result<(), ControllerError> {
    if formula.chars().count() > MAX_FORMULA_LEN {
        return Err(ControllerError::InvalidCommand(format!(
            "Formula too long (max {MAX_FORMULA_LEN} characters)"
        )));
    }
    Ok(())
}

/// A command plus the client's correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Echoed back on the result or error event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: Command,
}

impl Envelope {
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            request_id: None,
            command,
        }
    }

    #[must_use]
    pub fn with_request_id(command: Command, request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            command,
        }
    }
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        Self::new(command)
    }
}

/// A spreadsheet side effect requested by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, JsonValue>,
}

impl ToolCall {
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Map<String, JsonValue>) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// What an agent invocation returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl AgentReply {
    #[must_use]
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tool_calls: Vec::new(),
        }
    }
}
