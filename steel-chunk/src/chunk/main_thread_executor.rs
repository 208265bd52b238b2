//! Hands continuations from worker tasks back to the tick thread.

use crossbeam::channel::{self, Receiver, Sender};

type Task<M> = Box<dyn FnOnce(&M) + Send>;

/// Queue of closures run on the tick thread, each given the owner `M`.
pub struct MainThreadExecutor<M> {
    sender: Sender<Task<M>>,
    receiver: Receiver<Task<M>>,
}

/// Cloneable sending half of a [`MainThreadExecutor`].
pub struct MainThreadHandle<M> {
    sender: Sender<Task<M>>,
}

impl<M> Clone for MainThreadHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M> MainThreadHandle<M> {
    /// Queues `task` for the next drain.
    pub fn execute(&self, task: impl FnOnce(&M) + Send + 'static) {
        if self.sender.send(Box::new(task)).is_err() {
            log::trace!("Main thread executor is gone, dropping continuation");
        }
    }
}

impl<M> MainThreadExecutor<M> {
    /// Creates an empty executor.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self { sender, receiver }
    }

    /// A handle for queuing work from other threads.
    #[must_use]
    pub fn handle(&self) -> MainThreadHandle<M> {
        MainThreadHandle {
            sender: self.sender.clone(),
        }
    }

    /// Runs queued closures until the queue is empty, including ones queued while draining.
    /// Returns how many ran.
    pub fn drain(&self, owner: &M) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task(owner);
            ran += 1;
        }
        ran
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<M> Default for MainThreadExecutor<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn drains_in_order_including_nested_work() {
        let executor: MainThreadExecutor<AtomicU32> = MainThreadExecutor::new();
        let handle = executor.handle();
        let nested = executor.handle();

        handle.execute(|counter: &AtomicU32| {
            assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 0);
        });
        handle.execute(move |counter: &AtomicU32| {
            assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 1);
            nested.execute(|counter: &AtomicU32| {
                counter.fetch_add(10, Ordering::Relaxed);
            });
        });

        let counter = AtomicU32::new(0);
        assert!(!executor.is_empty());
        assert_eq!(executor.drain(&counter), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 12);
        assert!(executor.is_empty());
    }

    #[test]
    fn handles_work_across_threads() {
        let executor: MainThreadExecutor<AtomicU32> = MainThreadExecutor::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let handle = executor.handle();
                std::thread::spawn(move || {
                    handle.execute(|counter: &AtomicU32| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("sender thread");
        }

        let counter = AtomicU32::new(0);
        executor.drain(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }
}
