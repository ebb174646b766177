//! Hierarchical memory engine: token-budgeted Core Memory, long-term
//! Vector Memory, an append-only diary, and the facade/tools that
//! coordinate them for a conversational agent.

pub mod core_memory;
pub mod diary;
pub mod facade;
pub mod tools;
pub mod vector_memory;

pub use core_memory::{CoreDocument, CoreEntry, CoreMemory, CoreMemoryError, CoreSection};
pub use diary::Diary;
pub use facade::MemorySystem;
pub use vector_memory::{
    EntityRecord, EntityType, MemoryRecord, MemoryResult, MemoryType, PruneCandidate, ReflectionRecord,
    VectorMemory, VectorMemoryError,
};
