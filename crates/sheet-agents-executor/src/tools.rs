//! Translation of agent tool calls into controller commands.

use serde_json::Value as JsonValue;
use sheet_agents_core::{CellValue, Command, ToolCall};
use thiserror::Error;

/// Tool call error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("{tool}: missing argument '{name}'")]
    MissingArgument { tool: String, name: &'static str },
    #[error("{tool}: invalid argument '{name}': {reason}")]
    InvalidArgument {
        tool: String,
        name: &'static str,
        reason: String,
    },
}

/// Names of the tools an agent may call.
pub const TOOL_NAMES: &[&str] = &[
    "set_cell_text",
    "set_row_values",
    "set_column_values",
    "set_range_values",
    "get_cell",
    "get_range",
    "execute_function",
];

/// Translate one tool call.
///
/// Only spreadsheet reads and writes are reachable this way; an agent cannot
/// schedule or cancel other invocations.
///
/// # Errors
/// Returns [`ToolError`] for unknown tools or bad arguments.
pub fn to_command(call: &ToolCall) -> Result<Command, ToolError> {
    let args = Args { call };
    match call.name.as_str() {
        "set_cell_text" => Ok(Command::SetCell {
            address: args.string("address")?,
            value: args.cell_text("text")?,
        }),
        "set_row_values" => Ok(Command::SetRow {
            address: args.string("address")?,
            values: args.list("values")?,
        }),
        "set_column_values" => Ok(Command::SetColumn {
            address: args.string("address")?,
            values: args.list("values")?,
        }),
        "set_range_values" => Ok(Command::SetRange {
            address: args.string("range")?,
            values: args.grid("values")?,
        }),
        "get_cell" => Ok(Command::GetCell {
            address: args.string("address")?,
        }),
        "get_range" => Ok(Command::GetRange {
            address: args.string("range")?,
        }),
        "execute_function" => Ok(Command::ExecuteFunction {
            query: args.string("query")?,
        }),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

/// Translate a whole plan, keeping each call's id for correlation.
///
/// # Errors
/// Fails on the first call that cannot be translated.
pub fn to_commands(calls: &[ToolCall]) -> Result<Vec<(Option<String>, Command)>, ToolError> {
    calls
        .iter()
        .map(|call| to_command(call).map(|cmd| (call.id.clone(), cmd)))
        .collect()
}

struct Args<'a> {
    call: &'a ToolCall,
}

impl Args<'_> {
    fn get(&self, name: &'static str) -> Result<&JsonValue, ToolError> {
        self.call
            .arguments
            .get(name)
            .ok_or_else(|| ToolError::MissingArgument {
                tool: self.call.name.clone(),
                name,
            })
    }

    fn invalid(&self, name: &'static str, reason: impl Into<String>) -> ToolError {
        ToolError::InvalidArgument {
            tool: self.call.name.clone(),
            name,
            reason: reason.into(),
        }
    }

    fn string(&self, name: &'static str) -> Result<String, ToolError> {
        match self.get(name)? {
            JsonValue::String(s) if !s.trim().is_empty() => Ok(s.clone()),
            JsonValue::String(_) => Err(self.invalid(name, "empty string")),
            _ => Err(self.invalid(name, "expected a string")),
        }
    }

    /// Text is interpreted as typed-in input; JSON scalars are taken as-is.
    fn cell_text(&self, name: &'static str) -> Result<CellValue, ToolError> {
        match self.get(name)? {
            JsonValue::String(s) => Ok(CellValue::parse_input(s)),
            other => self.decode(name, other),
        }
    }

    fn list(&self, name: &'static str) -> Result<Vec<CellValue>, ToolError> {
        let value = self.get(name)?;
        self.decode(name, value)
    }

    fn grid(&self, name: &'static str) -> Result<Vec<Vec<CellValue>>, ToolError> {
        let value = self.get(name)?;
        self.decode(name, value)
    }

    fn decode<T: serde::de::DeserializeOwned>(
        &self,
        name: &'static str,
        value: &JsonValue,
    ) -> Result<T, ToolError> {
        serde_json::from_value(value.clone()).map_err(|e| self.invalid(name, e.to_string()))
    }
}
