//! Storage implementations.

#[cfg(feature = "memory")]
pub mod functions;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
