//! 3D section levels, used for the simulation distance around players.

use steel_utils::SectionPos;

use crate::chunk::chunk_tracker::{LevelTracker, Neighborhood};
use crate::chunk::dynamic_graph::Neighbors;

/// Sections, 26 neighbours each.
pub struct SectionNeighborhood;

impl Neighborhood for SectionNeighborhood {
    type Node = SectionPos;

    fn pack(node: SectionPos) -> i64 {
        node.as_i64()
    }

    fn unpack(node: i64) -> SectionPos {
        SectionPos::from_i64(node)
    }

    fn neighbors(node: i64) -> Neighbors {
        let center = SectionPos::from_i64(node);
        let mut neighbors = Neighbors::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if dx != 0 || dy != 0 || dz != 0 {
                        neighbors.push(center.offset(dx, dy, dz).as_i64());
                    }
                }
            }
        }
        neighbors
    }
}

/// Section levels, decaying by one per step in any of the 26 directions.
pub type SectionTracker = LevelTracker<SectionNeighborhood>;
