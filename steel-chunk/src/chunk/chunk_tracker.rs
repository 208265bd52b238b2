//! Ticket level trackers built on [`DynamicGraphMinFixedPoint`].

use std::marker::PhantomData;

use rustc_hash::FxHashMap;
use steel_utils::ChunkPos;

use crate::chunk::chunk_level::ChunkLevel;
use crate::chunk::dynamic_graph::{
    DynamicGraphMinFixedPoint, LevelPropagator, Neighbors, SOURCE,
};

/// The first level at which a chunk is no longer loaded.
pub const MAX_LEVEL: u8 = ChunkLevel::FULL_STATUS_LEVEL + 11;

const _: () = assert!(MAX_LEVEL == 44);

/// Topology of a tracked grid.
pub trait Neighborhood {
    /// The position type nodes are keyed by.
    type Node: Copy;

    /// Packs a position into a node id.
    fn pack(node: Self::Node) -> i64;

    /// Unpacks a node id produced by [`Neighborhood::pack`].
    fn unpack(node: i64) -> Self::Node;

    /// Every neighbour of a packed node.
    fn neighbors(node: i64) -> Neighbors;
}

/// Chunks, 8 neighbours each.
pub struct ChunkNeighborhood;

impl Neighborhood for ChunkNeighborhood {
    type Node = ChunkPos;

    fn pack(node: ChunkPos) -> i64 {
        node.as_i64()
    }

    fn unpack(node: i64) -> ChunkPos {
        ChunkPos::from_i64(node)
    }

    fn neighbors(node: i64) -> Neighbors {
        let center = ChunkPos::from_i64(node);
        center
            .square(1)
            .filter(|&pos| pos != center)
            .map(ChunkPos::as_i64)
            .collect()
    }
}

struct LevelStore<N> {
    absent: u8,
    levels: FxHashMap<i64, u8>,
    sources: FxHashMap<i64, u8>,
    /// node -> level before the first change since the last `take_changes`
    changes: FxHashMap<i64, u8>,
    _neighborhood: PhantomData<N>,
}

impl<N: Neighborhood> LevelPropagator for LevelStore<N> {
    fn absent_level(&self) -> u8 {
        self.absent
    }

    fn level(&self, node: i64) -> u8 {
        self.levels.get(&node).copied().unwrap_or(self.absent)
    }

    fn set_level(&mut self, node: i64, level: u8) {
        let old = if level >= self.absent {
            self.levels.remove(&node)
        } else {
            self.levels.insert(node, level)
        }
        .unwrap_or(self.absent);
        if old != level {
            self.changes.entry(node).or_insert(old);
        }
    }

    fn source_level(&self, node: i64) -> u8 {
        self.sources.get(&node).copied().unwrap_or(self.absent)
    }

    fn neighbors(&self, node: i64) -> Neighbors {
        N::neighbors(node)
    }
}

/// Tracks the minimum distance-decayed level of every node in a sparse grid.
pub struct LevelTracker<N: Neighborhood> {
    graph: DynamicGraphMinFixedPoint,
    store: LevelStore<N>,
}

impl<N: Neighborhood> LevelTracker<N> {
    /// Creates a tracker whose levels range over `0..absent`, `absent` meaning "no level".
    ///
    /// # Panics
    /// Panics if `absent` is `u8::MAX`.
    #[must_use]
    pub fn new(absent: u8) -> Self {
        assert!(absent < u8::MAX, "Absent level must leave room for the sentinel");
        Self {
            graph: DynamicGraphMinFixedPoint::new(usize::from(absent) + 1),
            store: LevelStore {
                absent,
                levels: FxHashMap::default(),
                sources: FxHashMap::default(),
                changes: FxHashMap::default(),
                _neighborhood: PhantomData,
            },
        }
    }

    /// Sets or clears the source level of `node`. Levels at or above the absent level clear it.
    pub fn set_source(&mut self, node: N::Node, level: Option<u8>) {
        let absent = self.store.absent;
        let id = N::pack(node);
        let old = self.store.source_level(id);
        let new = level.map_or(absent, |level| level.min(absent));
        if old == new {
            return;
        }
        if new >= absent {
            self.store.sources.remove(&id);
        } else {
            self.store.sources.insert(id, new);
        }
        self.graph
            .check_edge(&self.store, SOURCE, id, new, new < old);
    }

    /// Propagates pending changes, processing at most `budget` nodes. Returns the unused budget.
    pub fn run_updates(&mut self, budget: usize) -> usize {
        self.graph.run_updates(&mut self.store, budget)
    }

    /// Propagates until every level is settled.
    pub fn run_all_updates(&mut self) {
        while self.graph.has_work() {
            self.graph.run_updates(&mut self.store, usize::MAX);
        }
    }

    /// Whether changes are still waiting to propagate.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.graph.has_work()
    }

    /// Current level of `node`, the absent level when it has none.
    #[must_use]
    pub fn level(&self, node: N::Node) -> u8 {
        self.store.level(N::pack(node))
    }

    /// Number of nodes with a level.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.levels.len()
    }

    /// Whether no node has a level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.levels.is_empty()
    }

    /// Every node with a level.
    pub fn iter(&self) -> impl Iterator<Item = (N::Node, u8)> + '_ {
        self.store
            .levels
            .iter()
            .map(|(&node, &level)| (N::unpack(node), level))
    }

    /// Drains the nodes whose level changed since the last call, with their new level.
    /// Nodes that changed and came back to where they started are left out.
    pub fn take_changes(&mut self) -> Vec<(N::Node, u8)> {
        let changes = std::mem::take(&mut self.store.changes);
        changes
            .into_iter()
            .filter_map(|(node, old)| {
                let new = self.store.level(node);
                (new != old).then(|| (N::unpack(node), new))
            })
            .collect()
    }
}

/// Chunk ticket levels, decaying by one per chessboard step.
pub type ChunkTracker = LevelTracker<ChunkNeighborhood>;
