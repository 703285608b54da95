//! Error taxonomy shared by the controller and the transport.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::AddressError,
    traits::{InvocationId, SessionId, StoreError},
};

/// Wire code for an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownSession,
    InvalidAddress,
    SessionClosing,
    Overloaded,
    AgentFailure,
    ResourceExhausted,
    StoreError,
    UnknownInvocation,
    InvalidCommand,
    Denied,
}

/// Error attributed to the session that caused it.
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("Session {0} is closing")]
    SessionClosing(SessionId),
    #[error("Scheduler overloaded: {pending} invocations already pending")]
    Overloaded { pending: usize },
    #[error("Agent failure: {0}")]
    AgentFailure(String),
    #[error("Session limit reached ({limit})")]
    ResourceExhausted { limit: usize },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Unknown invocation: {0}")]
    UnknownInvocation(InvocationId),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Denied: {0}")]
    Denied(String),
}

impl ControllerError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownSession(_) => ErrorCode::UnknownSession,
            Self::InvalidAddress(_) => ErrorCode::InvalidAddress,
            Self::SessionClosing(_) => ErrorCode::SessionClosing,
            Self::Overloaded { .. } => ErrorCode::Overloaded,
            Self::AgentFailure(_) => ErrorCode::AgentFailure,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Self::Store(_) => ErrorCode::StoreError,
            Self::UnknownInvocation(_) => ErrorCode::UnknownInvocation,
            Self::InvalidCommand(_) => ErrorCode::InvalidCommand,
            Self::Denied(_) => ErrorCode::Denied,
        }
    }
}
