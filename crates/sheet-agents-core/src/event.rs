//! Outbound events, each delivered to exactly one session.

use serde::{Deserialize, Serialize};

use crate::{
    error::{ControllerError, ErrorCode},
    traits::InvocationId,
    value::{CellValue, Value},
};

/// Unit of outbound information for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Result of a row, column, range or function read.
    QueryResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        value: Value,
    },
    /// Result of a single-cell read.
    CellValue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        address: String,
        value: CellValue,
    },
    /// A write was applied.
    WriteAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        address: String,
        cells: u64,
    },
    /// An agent invocation was admitted.
    AgentScheduled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        invocation_id: InvocationId,
    },
    /// Cancellation was requested; the terminal event follows separately.
    CancelRequested {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        invocation_id: InvocationId,
    },
    AgentOutput {
        invocation_id: InvocationId,
        output: String,
    },
    AgentError {
        invocation_id: InvocationId,
        message: String,
    },
    /// The invocation was cancelled, or finished after cancellation and its
    /// result was discarded.
    AgentCancelled { invocation_id: InvocationId },
    /// A command failed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
    Disconnected { reason: String },
}

impl Event {
    /// Error event for a failed command.
    #[must_use]
    pub fn error(request_id: Option<String>, err: &ControllerError) -> Self {
        Self::Error {
            request_id,
            code: err.code(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::AgentError { .. })
    }

    /// The client correlation id this event answers, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::QueryResult { request_id, .. }
            | Self::CellValue { request_id, .. }
            | Self::WriteAck { request_id, .. }
            | Self::AgentScheduled { request_id, .. }
            | Self::CancelRequested { request_id, .. }
            | Self::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// The invocation this event concerns, if any.
    #[must_use]
    pub const fn invocation_id(&self) -> Option<InvocationId> {
        match self {
            Self::AgentScheduled { invocation_id, .. }
            | Self::CancelRequested { invocation_id, .. }
            | Self::AgentOutput { invocation_id, .. }
            | Self::AgentError { invocation_id, .. }
            | Self::AgentCancelled { invocation_id } => Some(*invocation_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::CellValue {
            request_id: Some("7".into()),
            address: "A1".into(),
            value: CellValue::Number(5.0),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cell_value");
        assert_eq!(json["request_id"], "7");
        assert_eq!(json["value"], 5.0);

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_error_event_carries_code() {
        let err = ControllerError::Overloaded { pending: 3 };
        let event = Event::error(None, &err);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "overloaded");
        assert!(json.get("request_id").is_none());
        assert!(event.is_error());
    }
}
