//! Lock aliases so the whole workspace agrees on one lock implementation.

/// A synchronous mutex. Never hold it across an `.await`.
pub type SyncMutex<T> = parking_lot::Mutex<T>;
