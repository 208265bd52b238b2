//! Generation jobs and the neighbourhood snapshot they run against.

use std::sync::Arc;

use steel_utils::ChunkPos;

use crate::chunk::chunk_holder::ChunkHolder;
use crate::chunk::chunk_status::ChunkStatus;

/// A square of values centered on a chunk, fixed at creation.
#[derive(Debug)]
pub struct StaticCache2D<T> {
    min_x: i32,
    min_z: i32,
    size: i32,
    cache: Box<[T]>,
}

impl<T> StaticCache2D<T> {
    /// Fills a square of `radius` around `center` by calling `factory` for every position.
    pub fn create(center: ChunkPos, radius: i32, mut factory: impl FnMut(ChunkPos) -> T) -> Self {
        let size = radius * 2 + 1;
        let min_x = center.0.x - radius;
        let min_z = center.0.y - radius;
        let cache = center.square(radius).map(&mut factory).collect();
        Self {
            min_x,
            min_z,
            size,
            cache,
        }
    }

    /// Whether `pos` lies in the square.
    #[must_use]
    pub fn contains(&self, pos: ChunkPos) -> bool {
        let x = pos.0.x - self.min_x;
        let z = pos.0.y - self.min_z;
        (0..self.size).contains(&x) && (0..self.size).contains(&z)
    }

    /// The value at `pos`, `None` outside the square.
    #[must_use]
    pub fn get(&self, pos: ChunkPos) -> Option<&T> {
        if !self.contains(pos) {
            return None;
        }
        let x = pos.0.x - self.min_x;
        let z = pos.0.y - self.min_z;
        self.cache.get((z * self.size + x) as usize)
    }

    /// The radius of the square.
    #[must_use]
    pub fn radius(&self) -> i32 {
        self.size / 2
    }
}

/// One queued stage generation. Stale once the holder's slot for `status` has a new id.
pub struct GenerationJob<C> {
    /// The chunk being generated.
    pub holder: Arc<ChunkHolder<C>>,
    /// The status to generate.
    pub status: ChunkStatus,
    /// Id of the stage slot the job completes.
    pub slot_id: u64,
}
