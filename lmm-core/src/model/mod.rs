pub mod checkpoint;
pub mod null_model;

pub use checkpoint::{CheckpointStore, DirCheckpoint, MemoryCheckpoint};
pub use null_model::{NullModel, NullSummary};
