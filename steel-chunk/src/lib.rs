//! # Steel Chunk
//!
//! Chunk loading core of the Steel server.
//!
//! Tickets placed on chunks are turned into per-chunk levels by incremental distance
//! propagation. Each loaded chunk has a [`ChunkHolder`](chunk::chunk_holder::ChunkHolder)
//! that moves through the generation statuses its level allows, and the
//! [`ChunkMap`](chunk::chunk_map::ChunkMap) schedules the generation work on a tokio
//! runtime with bounded concurrency, applying every result back on the tick thread.

pub mod chunk;
pub mod config;

pub use chunk::chunk_map::ChunkMap;
pub use config::ChunkSystemConfig;
