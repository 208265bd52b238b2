//! The generation pyramid: which statuses a chunk's neighbours need before a step can run.

use std::sync::LazyLock;

use crate::chunk::chunk_status::ChunkStatus;

/// The generation pyramid used by the chunk map.
pub static GENERATION_PYRAMID: LazyLock<ChunkPyramid> = LazyLock::new(ChunkPyramid::generation);

/// Statuses required at each chessboard distance from a chunk.
///
/// `dependency_by_radius[r]` is the highest status needed by chunks at distance `r`.
/// The list is non-increasing, so anything further out than its length needs nothing.
#[derive(Debug, Clone)]
pub struct ChunkDependencies {
    dependency_by_radius: Box<[ChunkStatus]>,
}

impl ChunkDependencies {
    fn new(dependency_by_radius: Vec<ChunkStatus>) -> Self {
        debug_assert!(
            dependency_by_radius.windows(2).all(|w| w[0] >= w[1]),
            "Dependencies must not increase with distance"
        );
        Self {
            dependency_by_radius: dependency_by_radius.into_boxed_slice(),
        }
    }

    /// The largest distance at which anything is required.
    #[must_use]
    pub fn get_radius(&self) -> usize {
        self.dependency_by_radius.len().saturating_sub(1)
    }

    /// The status required at `distance`, `None` past the radius.
    #[must_use]
    pub fn get(&self, distance: usize) -> Option<ChunkStatus> {
        self.dependency_by_radius.get(distance).copied()
    }

    /// The largest distance at which `status` (or a later one) is required.
    #[must_use]
    pub fn get_radius_of(&self, status: ChunkStatus) -> usize {
        self.dependency_by_radius
            .iter()
            .rposition(|&required| required >= status)
            .unwrap_or(0)
    }

    /// Number of distance rings, including the center.
    #[must_use]
    pub fn size(&self) -> usize {
        self.dependency_by_radius.len()
    }
}

/// Everything needed to generate one status.
#[derive(Debug, Clone)]
pub struct ChunkStep {
    /// The status this step produces.
    pub target_status: ChunkStatus,
    /// Requirements of this step alone. Distance 0 is the chunk itself at the parent status.
    pub direct_dependencies: ChunkDependencies,
    /// Requirements of this step and, transitively, every step it depends on.
    pub accumulated_dependencies: ChunkDependencies,
}

struct ChunkStepBuilder {
    status: ChunkStatus,
    requirements: Vec<(ChunkStatus, usize)>,
}

impl ChunkStepBuilder {
    fn new(status: ChunkStatus) -> Self {
        Self {
            status,
            requirements: Vec::new(),
        }
    }

    fn add_requirement(mut self, status: ChunkStatus, radius: usize) -> Self {
        debug_assert!(status < self.status, "A step can only depend on earlier statuses");
        self.requirements.push((status, radius));
        self
    }

    fn build(self, previous_steps: &[ChunkStep]) -> ChunkStep {
        let parent = self.status.parent();

        let direct_radius = self.requirements.iter().map(|&(_, r)| r).max().unwrap_or(0);
        let mut direct = Vec::with_capacity(direct_radius + 1);
        if let Some(parent) = parent {
            direct.push(parent);
            for distance in 1..=direct_radius {
                let required = self
                    .requirements
                    .iter()
                    .filter(|&&(_, radius)| radius >= distance)
                    .map(|&(status, _)| status)
                    .max();
                if let Some(required) = required {
                    direct.push(required);
                }
            }
        }

        // radius_of[s]: how far out status `s` is needed, counting this step and everything below.
        let mut radius_of: [Option<usize>; ChunkStatus::COUNT] = [None; ChunkStatus::COUNT];
        radius_of[self.status.index()] = Some(0);
        let mut merge = |status: ChunkStatus, offset: usize| {
            let step = &previous_steps[status.index()];
            for dependency in status.up_to() {
                let radius = step.accumulated_dependencies.get_radius_of(dependency) + offset;
                let slot = &mut radius_of[dependency.index()];
                *slot = Some(slot.map_or(radius, |current| current.max(radius)));
            }
        };
        if let Some(parent) = parent {
            merge(parent, 0);
        }
        for &(status, radius) in &self.requirements {
            merge(status, radius);
        }

        let max_radius = radius_of.iter().flatten().copied().max().unwrap_or(0);
        let accumulated = (0..=max_radius)
            .filter_map(|distance| {
                self.status
                    .up_to()
                    .rev()
                    .find(|status| radius_of[status.index()].is_some_and(|r| r >= distance))
            })
            .collect();

        ChunkStep {
            target_status: self.status,
            direct_dependencies: ChunkDependencies::new(direct),
            accumulated_dependencies: ChunkDependencies::new(accumulated),
        }
    }
}

/// One [`ChunkStep`] per status.
#[derive(Debug)]
pub struct ChunkPyramid {
    steps: Vec<ChunkStep>,
}

impl ChunkPyramid {
    fn generation() -> Self {
        let mut steps: Vec<ChunkStep> = Vec::with_capacity(ChunkStatus::COUNT);
        for status in ChunkStatus::ALL {
            let builder = ChunkStepBuilder::new(status);
            let builder = match status {
                ChunkStatus::StructureReferences => {
                    builder.add_requirement(ChunkStatus::StructureStarts, 8)
                }
                ChunkStatus::Features => builder.add_requirement(ChunkStatus::Carvers, 1),
                ChunkStatus::Light => builder.add_requirement(ChunkStatus::InitializeLight, 1),
                ChunkStatus::Spawn => builder.add_requirement(ChunkStatus::Biomes, 1),
                _ => builder,
            };
            let step = builder.build(&steps);
            steps.push(step);
        }
        Self { steps }
    }

    /// The step producing `status`.
    #[must_use]
    pub fn get_step_to(&self, status: ChunkStatus) -> &ChunkStep {
        &self.steps[status.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_step_accumulates_the_whole_pyramid() {
        let deps = &GENERATION_PYRAMID
            .get_step_to(ChunkStatus::Full)
            .accumulated_dependencies;

        assert_eq!(deps.get(0), Some(ChunkStatus::Full));
        assert_eq!(deps.get(1), Some(ChunkStatus::InitializeLight));
        assert_eq!(deps.get(2), Some(ChunkStatus::Carvers));
        assert_eq!(deps.get(3), Some(ChunkStatus::StructureStarts));
        assert_eq!(deps.get(10), Some(ChunkStatus::StructureStarts));
        assert_eq!(deps.get(11), None);
        assert_eq!(deps.get_radius(), 10);
        assert_eq!(deps.get_radius_of(ChunkStatus::Empty), 10);
    }

    #[test]
    fn direct_dependencies_start_with_parent() {
        let step = GENERATION_PYRAMID.get_step_to(ChunkStatus::StructureReferences);
        assert_eq!(
            step.direct_dependencies.get(0),
            Some(ChunkStatus::StructureStarts)
        );
        assert_eq!(step.direct_dependencies.get_radius(), 8);

        let empty = GENERATION_PYRAMID.get_step_to(ChunkStatus::Empty);
        assert_eq!(empty.direct_dependencies.size(), 0);
        assert_eq!(empty.accumulated_dependencies.get(0), Some(ChunkStatus::Empty));
    }

    #[test]
    fn accumulated_dependencies_never_increase_outwards() {
        for status in ChunkStatus::ALL {
            let deps = &GENERATION_PYRAMID.get_step_to(status).accumulated_dependencies;
            for distance in 1..deps.size() {
                assert!(deps.get(distance) <= deps.get(distance - 1));
            }
        }
    }
}
