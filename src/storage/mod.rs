//! Storage backends for a node's persistent state.

mod memory;

pub use memory::MemStorage;
