//! # Steel Utils
//!
//! Leaf types shared by the Steel crates: grid positions, lock aliases and the logging bootstrap.

pub mod locks;
pub mod logger;
pub mod math;
mod types;

pub use types::{ChunkPos, SectionPos};
