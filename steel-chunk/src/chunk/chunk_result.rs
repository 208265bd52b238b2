//! Results of chunk stage futures.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use steel_utils::ChunkPos;
use steel_utils::locks::SyncMutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::chunk::chunk_status::ChunkStatus;

/// Why a chunk future did not produce a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkLoadError {
    /// The chunk's level no longer supports the requested status.
    #[error("chunk unloaded")]
    Unloaded,
    /// The generator failed.
    #[error("failed to generate {status} for chunk {pos}: {message}")]
    Generation {
        /// The chunk that failed.
        pos: ChunkPos,
        /// The status it was being generated to.
        status: ChunkStatus,
        /// The generator's error, formatted.
        message: String,
    },
}

/// A chunk or the reason there is none.
pub type ChunkResult<C> = Result<Arc<C>, ChunkLoadError>;

/// A cloneable future resolving to a [`ChunkResult`].
pub type ChunkFuture<C> = Shared<BoxFuture<'static, ChunkResult<C>>>;

/// A [`ChunkFuture`] that resolves as soon as it is polled.
#[must_use]
pub fn ready_future<C: Send + Sync + 'static>(result: ChunkResult<C>) -> ChunkFuture<C> {
    futures::future::ready(result).boxed().shared()
}

/// The writing half of a [`ChunkFuture`]. The first completion wins.
///
/// Dropping it without completing resolves the future with [`ChunkLoadError::Unloaded`].
pub struct Completable<C> {
    sender: SyncMutex<Option<oneshot::Sender<ChunkResult<C>>>>,
    result: SyncMutex<Option<ChunkResult<C>>>,
    future: ChunkFuture<C>,
}

impl<C: Send + Sync + 'static> Completable<C> {
    /// Creates a pending completable.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let future = receiver
            .map(|result| result.unwrap_or(Err(ChunkLoadError::Unloaded)))
            .boxed()
            .shared();
        Self {
            sender: SyncMutex::new(Some(sender)),
            result: SyncMutex::new(None),
            future,
        }
    }

    /// Completes the future. Returns `false` if it was already completed.
    pub fn complete(&self, result: ChunkResult<C>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        *self.result.lock() = Some(result.clone());
        // Nobody listening is fine, the result is kept.
        let _ = sender.send(result);
        true
    }

    /// Whether [`Completable::complete`] has been called.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// The result, once completed.
    #[must_use]
    pub fn result(&self) -> Option<ChunkResult<C>> {
        self.result.lock().clone()
    }

    /// A future resolving with the result.
    #[must_use]
    pub fn future(&self) -> ChunkFuture<C> {
        self.future.clone()
    }
}

impl<C: Send + Sync + 'static> Default for Completable<C> {
    fn default() -> Self {
        Self::new()
    }
}
