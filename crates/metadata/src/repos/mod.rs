//! Repository traits for metadata operations.

pub mod chunks;
pub mod gc;

pub use chunks::{ChunkInsert, ChunkRepo, ChunkStats, RefOutcome};
pub use gc::{GcRepo, GcRunState};
