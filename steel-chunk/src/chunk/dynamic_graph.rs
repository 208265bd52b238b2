//! Incremental min fixed point over a sparse graph.
//!
//! Every node's level is `min(source level, 1 + min(neighbour levels))`, clamped to the
//! absent level. Changes are processed from a worklist bucketed by level so that the lowest
//! pending level is always handled first.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Pseudo-node standing for "the node's own source".
pub const SOURCE: i64 = i64::MAX;

/// Neighbour list, sized for the 3D case.
pub type Neighbors = SmallVec<[i64; 26]>;

/// Level storage and topology the graph operates on.
pub trait LevelPropagator {
    /// The level treated as "no level". Everything is clamped to it.
    fn absent_level(&self) -> u8;

    /// Current level of `node`, [`LevelPropagator::absent_level`] when unset.
    fn level(&self, node: i64) -> u8;

    /// Stores a new level for `node`.
    fn set_level(&mut self, node: i64, level: u8);

    /// The level `node` gets from its own source, absent when it has none.
    fn source_level(&self, node: i64) -> u8;

    /// Every neighbour of `node`, excluding itself.
    fn neighbors(&self, node: i64) -> Neighbors;

    /// The level `to` receives through `from` when `from` is at `level`.
    fn level_from_neighbor(&self, from: i64, to: i64, level: u8) -> u8 {
        if from == SOURCE {
            self.source_level(to)
        } else {
            level.saturating_add(1)
        }
    }
}

/// The worklist half of the propagation. Level storage lives in a [`LevelPropagator`].
pub struct DynamicGraphMinFixedPoint {
    level_count: usize,
    /// One bucket per level. Entries are lazily removed: an entry is live only while
    /// `computed` still points at the bucket it sits in.
    queues: Vec<Vec<i64>>,
    /// node -> (pending level, bucket it is queued in)
    computed: FxHashMap<i64, (u8, u8)>,
    first_queued_level: usize,
}

impl DynamicGraphMinFixedPoint {
    /// Creates a graph for levels `0..level_count`, `level_count - 1` being absent.
    ///
    /// # Panics
    /// Panics if `level_count` is zero or does not fit in a `u8`.
    #[must_use]
    pub fn new(level_count: usize) -> Self {
        assert!(
            (1..=usize::from(u8::MAX)).contains(&level_count),
            "Level count out of range: {level_count}"
        );
        Self {
            level_count,
            queues: (0..level_count).map(|_| Vec::new()).collect(),
            computed: FxHashMap::default(),
            first_queued_level: level_count,
        }
    }

    fn absent(&self) -> u8 {
        (self.level_count - 1) as u8
    }

    fn priority(&self, a: u8, b: u8) -> u8 {
        a.min(b).min(self.absent())
    }

    /// Whether any node is waiting to be processed.
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.computed.is_empty()
    }

    fn enqueue(&mut self, node: i64, pending: u8, bucket: u8) {
        self.computed.insert(node, (pending, bucket));
        self.queues[bucket as usize].push(node);
        if (bucket as usize) < self.first_queued_level {
            self.first_queued_level = bucket as usize;
        }
    }

    /// Lowest level `node` can reach, seeded with `level` and ignoring `excluded`.
    fn computed_level<P: LevelPropagator>(
        &self,
        propagator: &P,
        node: i64,
        excluded: i64,
        level: u8,
    ) -> u8 {
        let mut best = level;
        if excluded != SOURCE {
            best = best.min(propagator.level_from_neighbor(SOURCE, node, 0));
        }
        for neighbor in propagator.neighbors(node) {
            if best == 0 {
                break;
            }
            if neighbor == excluded {
                continue;
            }
            let through = propagator.level_from_neighbor(neighbor, node, propagator.level(neighbor));
            best = best.min(through);
        }
        best
    }

    /// Re-evaluates `to` after the edge from `from` changed. `level` is the level `to`
    /// now receives through that edge.
    pub fn check_edge<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        from: i64,
        to: i64,
        level: u8,
        decrease: bool,
    ) {
        let absent = self.absent();
        let level = level.min(absent);
        let current = propagator.level(to);
        let pending = self.computed.get(&to).map(|&(pending, _)| pending);
        let known = pending.unwrap_or(current);

        let new_level = if decrease {
            known.min(level)
        } else {
            self.computed_level(propagator, to, from, level).min(absent)
        };

        if new_level != current {
            let bucket = self.priority(current, new_level);
            self.enqueue(to, new_level, bucket);
        } else if pending.is_some() {
            self.computed.remove(&to);
        }
    }

    /// Checks the edge `from -> to` after `from` moved to or away from `from_level`.
    pub fn check_neighbor<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        from: i64,
        to: i64,
        from_level: u8,
        decrease: bool,
    ) {
        let candidate = propagator
            .level_from_neighbor(from, to, from_level)
            .min(self.absent());
        if decrease {
            self.check_edge(propagator, from, to, candidate, true);
        } else {
            let known = self
                .computed
                .get(&to)
                .map_or_else(|| propagator.level(to), |&(pending, _)| pending);
            // Only the node that provided the minimum needs re-evaluating.
            if candidate == known {
                self.check_edge(propagator, from, to, self.absent(), false);
            }
        }
    }

    fn check_neighbors_after_update<P: LevelPropagator>(
        &mut self,
        propagator: &P,
        node: i64,
        level: u8,
        decrease: bool,
    ) {
        if decrease && level.saturating_add(1) >= self.absent() {
            return;
        }
        for neighbor in propagator.neighbors(node) {
            self.check_neighbor(propagator, node, neighbor, level, decrease);
        }
    }

    fn pop(&mut self) -> Option<(i64, u8)> {
        while self.first_queued_level < self.level_count {
            let bucket = self.first_queued_level;
            while let Some(node) = self.queues[bucket].pop() {
                let live = matches!(self.computed.get(&node), Some(&(_, queued)) if queued as usize == bucket);
                if live {
                    return self.computed.remove(&node).map(|(pending, _)| (node, pending));
                }
            }
            self.first_queued_level = (bucket + 1..self.level_count)
                .find(|&level| !self.queues[level].is_empty())
                .unwrap_or(self.level_count);
        }
        None
    }

    /// Processes up to `budget` queued nodes and returns the unused budget.
    pub fn run_updates<P: LevelPropagator>(&mut self, propagator: &mut P, budget: usize) -> usize {
        let absent = self.absent();
        let mut budget = budget;
        while budget > 0 {
            let Some((node, pending)) = self.pop() else {
                break;
            };
            budget -= 1;

            let current = propagator.level(node).min(absent);
            if pending < current {
                propagator.set_level(node, pending);
                self.check_neighbors_after_update(propagator, node, pending, true);
            } else if pending > current {
                // Drop to absent first so neighbours re-derive without this node's stale value.
                propagator.set_level(node, absent);
                if pending != absent {
                    self.enqueue(node, pending, pending);
                }
                self.check_neighbors_after_update(propagator, node, current, false);
            }
        }
        if !self.has_work() {
            self.queues.iter_mut().for_each(Vec::clear);
            self.first_queued_level = self.level_count;
        }
        budget
    }
}
