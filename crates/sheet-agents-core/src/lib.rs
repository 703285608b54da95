//! Core vocabulary for agent-controlled spreadsheet sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `SpreadsheetRef` - A1-style addressing with bounds checks
//! - `Command` / `Event` - What sessions send and receive
//! - `Outbound` - Ordered per-session event sink
//! - `SpreadsheetStore` and `AgentRuntime` traits

pub mod address;
pub mod command;
pub mod error;
pub mod event;
pub mod outbound;
pub mod traits;
pub mod value;

pub use address::{AddressError, CellAddr, CellRange, RefKind, SheetBounds, SpreadsheetRef};
pub use command::{AgentReply, Command, Envelope, MAX_FORMULA_LEN, MAX_TEXT_LEN, ToolCall};
pub use error::{ControllerError, ErrorCode};
pub use event::Event;
pub use outbound::{EventReceiver, Outbound};
pub use traits::{AgentRuntime, SpreadsheetStore};
pub use value::{CellValue, Value};
