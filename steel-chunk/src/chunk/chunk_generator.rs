//! Collaborators the chunk map drives: the generator and the status listener.

use std::sync::Arc;

use futures::future::BoxFuture;
use steel_utils::ChunkPos;

use crate::chunk::chunk_generation_task::StaticCache2D;
use crate::chunk::chunk_status::{ChunkStatus, FullChunkStatus};

/// Generates chunk content one status at a time.
pub trait ChunkGenerator: Send + Sync + 'static {
    /// The chunk content produced.
    type Chunk: Send + Sync + 'static;

    /// Generates `pos` up to `status`.
    ///
    /// `parent` is the chunk at the previous status, `None` only for [`ChunkStatus::Empty`].
    /// `neighbors` holds every chunk within the step's dependency radius, already at the
    /// status the step requires. The returned future runs on the async runtime.
    fn generate(
        &self,
        status: ChunkStatus,
        pos: ChunkPos,
        parent: Option<Arc<Self::Chunk>>,
        neighbors: Arc<StaticCache2D<Option<Arc<Self::Chunk>>>>,
    ) -> BoxFuture<'static, anyhow::Result<Arc<Self::Chunk>>>;
}

/// Sinks notified by the chunk map. All calls happen on the tick thread.
pub trait ChunkStatusListener<C>: Send + Sync {
    /// A chunk's confirmed full status changed. Called once per boundary crossed.
    fn on_full_status_change(&self, pos: ChunkPos, status: FullChunkStatus);

    /// A chunk became accessible at a higher full status and its content should be sent out.
    fn broadcast_changes(&self, pos: ChunkPos, chunk: &Arc<C>);

    /// A chunk reached `status`, or is about to be evicted at `status`.
    fn persist(&self, pos: ChunkPos, status: ChunkStatus, chunk: &Arc<C>);
}
