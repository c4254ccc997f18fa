//! Core domain types shared across the research pipeline.

mod chunk;
mod context;
pub mod text;

pub use chunk::{Chunk, ChunkKind, ChunkMetadata, ConstantMeta, FileRecord};
pub use context::ResearchContext;
