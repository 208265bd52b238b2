//! Priority queue of per-chunk work with bounded concurrency.
//!
//! Work is bucketed by priority level (lower runs first) and grouped per chunk. A `None`
//! item is an acquire marker: popping it takes one of the limited concurrency slots for
//! that chunk until [`ChunkTaskPriorityQueue::release`] is called.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use steel_utils::ChunkPos;
use thiserror::Error;

/// Flow control signals from [`ChunkTaskPriorityQueue::pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    /// Every concurrency slot is taken.
    #[error("no free slot")]
    NoCapacity,
    /// Nothing is ready to run.
    #[error("queue is empty")]
    Empty,
}

/// An entry handed out by [`ChunkTaskPriorityQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem<T> {
    /// A slot was taken for this chunk and must be released.
    Acquire(ChunkPos),
    /// Work to run.
    Task(T),
}

struct Level<T> {
    /// pos -> (sequence, pending items)
    entries: FxHashMap<ChunkPos, (u64, Vec<Option<T>>)>,
    /// Insertion order. Entries whose sequence no longer matches are stale.
    order: VecDeque<(u64, ChunkPos)>,
}

impl<T> Level<T> {
    fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    fn is_live(&self, sequence: u64, pos: ChunkPos) -> bool {
        self.entries
            .get(&pos)
            .is_some_and(|&(current, _)| current == sequence)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops stale order entries once they outnumber the live ones.
    fn compact(&mut self) {
        if self.order.len() <= 2 * self.entries.len() {
            return;
        }
        let entries = &self.entries;
        self.order.retain(|&(sequence, pos)| {
            entries
                .get(&pos)
                .is_some_and(|&(current, _)| current == sequence)
        });
    }
}

/// See the module docs.
pub struct ChunkTaskPriorityQueue<T> {
    max_acquired: usize,
    levels: Vec<Level<T>>,
    /// pos -> level its entry is in
    positions: FxHashMap<ChunkPos, usize>,
    acquired: FxHashSet<ChunkPos>,
    first_non_empty_level: usize,
    next_sequence: u64,
}

impl<T> ChunkTaskPriorityQueue<T> {
    /// Creates a queue with `level_count` priority levels and at most `max_acquired`
    /// chunks holding a slot at once.
    ///
    /// # Panics
    /// Panics if `level_count` is zero.
    #[must_use]
    pub fn new(level_count: usize, max_acquired: usize) -> Self {
        assert!(level_count > 0, "A queue needs at least one level");
        Self {
            max_acquired,
            levels: (0..level_count).map(|_| Level::new()).collect(),
            positions: FxHashMap::default(),
            acquired: FxHashSet::default(),
            first_non_empty_level: level_count,
            next_sequence: 0,
        }
    }

    fn clamp_level(&self, level: u8) -> usize {
        usize::from(level).min(self.levels.len() - 1)
    }

    fn push_entry(&mut self, level: usize, pos: ChunkPos, items: Vec<Option<T>>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let bucket = &mut self.levels[level];
        bucket.entries.insert(pos, (sequence, items));
        bucket.order.push_back((sequence, pos));
        self.positions.insert(pos, level);
        self.first_non_empty_level = self.first_non_empty_level.min(level);
    }

    fn take_entry(&mut self, pos: ChunkPos) -> Option<(usize, Vec<Option<T>>)> {
        let level = self.positions.remove(&pos)?;
        let bucket = &mut self.levels[level];
        let (_, items) = bucket.entries.remove(&pos)?;
        bucket.compact();
        Some((level, items))
    }

    fn advance_first_non_empty_level(&mut self) {
        while self.first_non_empty_level < self.levels.len() {
            let level = &mut self.levels[self.first_non_empty_level];
            if !level.is_empty() {
                return;
            }
            level.order.clear();
            self.first_non_empty_level += 1;
        }
    }

    /// Adds an item (or an acquire marker) for `pos` at `level`.
    ///
    /// A chunk only ever sits in one level. If it already has pending items the new one is
    /// appended to them, and the whole list moves to `level` when that is more urgent.
    pub fn submit(&mut self, item: Option<T>, pos: ChunkPos, level: u8) {
        let level = self.clamp_level(level);
        match self.positions.get(&pos).copied() {
            Some(current) if current <= level => {
                if let Some((_, items)) = self.levels[current].entries.get_mut(&pos) {
                    items.push(item);
                }
            }
            Some(_) => {
                let mut items = self.take_entry(pos).map(|(_, items)| items).unwrap_or_default();
                items.push(item);
                self.push_entry(level, pos, items);
            }
            None => self.push_entry(level, pos, vec![item]),
        }
    }

    /// Takes the pending work of the most urgent chunk that does not already hold a slot.
    ///
    /// Everything up to the chunk's second acquire marker is returned. The rest stays
    /// queued until the slot is released.
    pub fn pop(&mut self) -> Result<Vec<QueueItem<T>>, PopError> {
        if self.acquired.len() >= self.max_acquired {
            return Err(PopError::NoCapacity);
        }
        self.advance_first_non_empty_level();

        for level in self.first_non_empty_level..self.levels.len() {
            let bucket = &mut self.levels[level];
            while let Some(&(sequence, pos)) = bucket.order.front() {
                if bucket.is_live(sequence, pos) {
                    break;
                }
                bucket.order.pop_front();
            }
            let found = bucket.order.iter().position(|&(sequence, pos)| {
                bucket.is_live(sequence, pos) && !self.acquired.contains(&pos)
            });
            let Some(index) = found else {
                continue;
            };
            let Some((sequence, pos)) = bucket.order.remove(index) else {
                continue;
            };
            let Some((_, items)) = bucket.entries.remove(&pos) else {
                continue;
            };

            let mut popped = Vec::with_capacity(items.len());
            let mut rest = Vec::new();
            let mut acquiring = false;
            for item in items {
                if !rest.is_empty() {
                    rest.push(item);
                    continue;
                }
                match item {
                    None if acquiring => rest.push(None),
                    None => {
                        acquiring = true;
                        popped.push(QueueItem::Acquire(pos));
                    }
                    Some(task) => popped.push(QueueItem::Task(task)),
                }
            }

            if rest.is_empty() {
                self.positions.remove(&pos);
            } else {
                bucket.entries.insert(pos, (sequence, rest));
                bucket.order.push_front((sequence, pos));
            }
            if acquiring {
                self.acquired.insert(pos);
            }
            self.advance_first_non_empty_level();
            return Ok(popped);
        }
        Err(PopError::Empty)
    }

    /// Frees the slot held by `pos`. With `discard`, its pending work is dropped as well.
    pub fn release(&mut self, pos: ChunkPos, discard: bool) {
        self.acquired.remove(&pos);
        if discard && self.take_entry(pos).is_some() {
            self.advance_first_non_empty_level();
        }
    }

    /// Moves the pending work of `pos` from `from` to `to`.
    ///
    /// The entry is found wherever it is; `from` is only a hint from the caller's bookkeeping.
    pub fn resort(&mut self, from: u8, pos: ChunkPos, to: u8) {
        let to = self.clamp_level(to);
        let Some(&current) = self.positions.get(&pos) else {
            return;
        };
        if current == to {
            return;
        }
        if current != self.clamp_level(from) {
            log::trace!("Resorting {pos} from level {current}, expected {from}");
        }
        if let Some((_, items)) = self.take_entry(pos) {
            self.push_entry(to, pos, items);
            self.advance_first_non_empty_level();
        }
    }

    /// Whether any chunk has pending work.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.positions.is_empty()
    }

    /// Number of chunks holding a slot.
    #[must_use]
    pub fn acquired_count(&self) -> usize {
        self.acquired.len()
    }

    /// Number of chunks with pending work.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.positions.len()
    }

    /// The level `pos` is queued at, if it is queued.
    #[must_use]
    pub fn level_of(&self, pos: ChunkPos) -> Option<usize> {
        self.positions.get(&pos).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(items: Vec<QueueItem<u32>>) -> Vec<u32> {
        items
            .into_iter()
            .filter_map(|item| match item {
                QueueItem::Task(task) => Some(task),
                QueueItem::Acquire(_) => None,
            })
            .collect()
    }

    #[test]
    fn lowest_level_first_then_fifo() {
        let mut queue = ChunkTaskPriorityQueue::new(10, 8);
        queue.submit(Some(1), ChunkPos::new(0, 0), 5);
        queue.submit(Some(2), ChunkPos::new(1, 0), 3);
        queue.submit(Some(3), ChunkPos::new(2, 0), 5);
        queue.submit(Some(4), ChunkPos::new(1, 0), 3);

        assert_eq!(queue.pop().map(tasks), Ok(vec![2, 4]));
        assert_eq!(queue.pop().map(tasks), Ok(vec![1]));
        assert_eq!(queue.pop().map(tasks), Ok(vec![3]));
        assert_eq!(queue.pop(), Err(PopError::Empty));
    }

    #[test]
    fn submit_keeps_one_level_per_position() {
        let mut queue = ChunkTaskPriorityQueue::new(10, 8);
        let pos = ChunkPos::new(4, 4);
        queue.submit(Some(1), pos, 7);
        queue.submit(Some(2), pos, 2);
        queue.submit(Some(3), pos, 9);
        assert_eq!(queue.level_of(pos), Some(2));
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.pop().map(tasks), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn admission_is_bounded() {
        let mut queue = ChunkTaskPriorityQueue::new(4, 2);
        for x in 0..4 {
            queue.submit(None, ChunkPos::new(x, 0), 1);
            queue.submit(Some(x as u32), ChunkPos::new(x, 0), 1);
        }
        assert!(matches!(queue.pop().as_deref(), Ok([QueueItem::Acquire(_), QueueItem::Task(0)])));
        assert!(queue.pop().is_ok());
        assert_eq!(queue.pop(), Err(PopError::NoCapacity));
        assert_eq!(queue.acquired_count(), 2);

        queue.release(ChunkPos::new(0, 0), false);
        assert_eq!(queue.pop().map(tasks), Ok(vec![2]));
        assert_eq!(queue.pop(), Err(PopError::NoCapacity));
        assert!(queue.acquired_count() <= 2);
    }

    #[test]
    fn acquired_positions_are_skipped() {
        let mut queue = ChunkTaskPriorityQueue::new(4, 4);
        let pos = ChunkPos::new(0, 0);
        queue.submit(None, pos, 0);
        queue.submit(Some(1), pos, 0);
        queue.submit(None, pos, 0);
        queue.submit(Some(2), pos, 0);
        queue.submit(Some(3), ChunkPos::new(1, 1), 2);

        assert_eq!(queue.pop().map(tasks), Ok(vec![1]));
        // The second acquire for `pos` waits for the release.
        assert_eq!(queue.pop().map(tasks), Ok(vec![3]));
        assert_eq!(queue.pop(), Err(PopError::Empty));

        queue.release(pos, false);
        assert_eq!(queue.pop().map(tasks), Ok(vec![2]));
    }

    #[test]
    fn release_can_discard() {
        let mut queue = ChunkTaskPriorityQueue::new(4, 4);
        let pos = ChunkPos::new(0, 0);
        queue.submit(None, pos, 1);
        queue.submit(Some(1), pos, 1);
        queue.submit(None, pos, 1);
        queue.submit(Some(2), pos, 1);
        assert!(queue.pop().is_ok());

        queue.release(pos, true);
        assert!(!queue.has_work());
        assert_eq!(queue.acquired_count(), 0);
        assert_eq!(queue.pop(), Err(PopError::Empty));
    }

    #[test]
    fn resort_moves_pending_work() {
        let mut queue = ChunkTaskPriorityQueue::new(10, 4);
        queue.submit(Some(1), ChunkPos::new(0, 0), 2);
        queue.submit(Some(2), ChunkPos::new(1, 0), 6);
        queue.resort(6, ChunkPos::new(1, 0), 1);
        queue.resort(2, ChunkPos::new(0, 0), 8);

        assert_eq!(queue.level_of(ChunkPos::new(1, 0)), Some(1));
        assert_eq!(queue.pop().map(tasks), Ok(vec![2]));
        assert_eq!(queue.pop().map(tasks), Ok(vec![1]));
    }

    #[test]
    fn stale_order_entries_are_compacted() {
        let mut queue = ChunkTaskPriorityQueue::new(10, 4);
        let busy = ChunkPos::new(0, 0);
        queue.submit(None, busy, 3);
        queue.submit(Some(0), busy, 3);
        queue.submit(None, busy, 3);
        queue.submit(Some(1), busy, 3);
        // `busy` now holds a slot and keeps level 3 non-empty.
        assert_eq!(queue.pop().map(tasks), Ok(vec![0]));

        let pos = ChunkPos::new(5, 5);
        queue.submit(Some(2), pos, 3);
        for _ in 0..1000 {
            queue.resort(3, pos, 7);
            queue.resort(7, pos, 3);
        }
        assert!(queue.levels[3].order.len() <= 4);
        assert!(queue.levels[7].order.len() <= 2);
        assert_eq!(queue.pop().map(tasks), Ok(vec![2]));
    }

    #[test]
    fn levels_past_the_end_are_clamped() {
        let mut queue = ChunkTaskPriorityQueue::new(3, 4);
        queue.submit(Some(9), ChunkPos::new(0, 0), 200);
        assert_eq!(queue.level_of(ChunkPos::new(0, 0)), Some(2));
        assert_eq!(queue.pop().map(tasks), Ok(vec![9]));
    }
}
