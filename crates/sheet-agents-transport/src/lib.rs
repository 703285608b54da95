//! Transport layer for spreadsheet agent sessions.
//!
//! Provides:
//! - Wire protocol (JSON text frames)
//! - WebSocket transport (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
