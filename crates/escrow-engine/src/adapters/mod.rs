//! # Adapters
//!
//! Concrete implementations of outbound ports.

pub mod memory_store;

pub use memory_store::MemoryStateStore;
