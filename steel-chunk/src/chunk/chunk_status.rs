//! Generation statuses and full chunk statuses.

use std::fmt::{self, Display};

/// One step of the generation ladder. Each status implies every status before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ChunkStatus {
    /// Allocated but nothing generated.
    Empty,
    /// Structure starts are placed.
    StructureStarts,
    /// Neighbouring structure starts are referenced.
    StructureReferences,
    /// Biomes are sampled.
    Biomes,
    /// Base terrain is filled from noise.
    Noise,
    /// Surface rules are applied.
    Surface,
    /// Carvers have run.
    Carvers,
    /// Features are decorated.
    Features,
    /// Light sources are initialized.
    InitializeLight,
    /// Light is propagated.
    Light,
    /// Initial mobs are spawned.
    Spawn,
    /// The chunk is complete.
    Full,
}

impl ChunkStatus {
    /// Number of statuses.
    pub const COUNT: usize = 12;

    /// Every status in generation order.
    pub const ALL: [ChunkStatus; Self::COUNT] = [
        Self::Empty,
        Self::StructureStarts,
        Self::StructureReferences,
        Self::Biomes,
        Self::Noise,
        Self::Surface,
        Self::Carvers,
        Self::Features,
        Self::InitializeLight,
        Self::Light,
        Self::Spawn,
        Self::Full,
    ];

    /// Index of this status in [`ChunkStatus::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Looks a status up by its index.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// The status generated right before this one.
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Empty => None,
            _ => Self::from_index(self.index() - 1),
        }
    }

    /// Iterates over all statuses from `Empty` up to and including this one.
    pub fn up_to(self) -> impl DoubleEndedIterator<Item = ChunkStatus> {
        (0..=self.index()).filter_map(Self::from_index)
    }

    /// Encodes an optional status into a byte, `u8::MAX` meaning none.
    #[must_use]
    pub const fn encode(status: Option<Self>) -> u8 {
        match status {
            Some(status) => status as u8,
            None => u8::MAX,
        }
    }

    /// Decodes a byte produced by [`ChunkStatus::encode`].
    #[must_use]
    pub const fn decode(value: u8) -> Option<Self> {
        Self::from_index(value as usize)
    }
}

impl Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::StructureStarts => "structure_starts",
            Self::StructureReferences => "structure_references",
            Self::Biomes => "biomes",
            Self::Noise => "noise",
            Self::Surface => "surface",
            Self::Carvers => "carvers",
            Self::Features => "features",
            Self::InitializeLight => "initialize_light",
            Self::Light => "light",
            Self::Spawn => "spawn",
            Self::Full => "full",
        };
        f.write_str(name)
    }
}

/// How much live simulation a fully generated chunk receives.
///
/// Each status implies the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FullChunkStatus {
    /// Not accessible to the world, possibly still generating.
    Inaccessible,
    /// Accessible border chunk, not ticked.
    Full,
    /// Block and fluid ticks run.
    BlockTicking,
    /// Entities are ticked as well.
    EntityTicking,
}

impl FullChunkStatus {
    /// Every full status in ascending order.
    pub const ALL: [FullChunkStatus; 4] = [
        Self::Inaccessible,
        Self::Full,
        Self::BlockTicking,
        Self::EntityTicking,
    ];

    /// The status right below this one.
    #[must_use]
    pub const fn previous(self) -> Option<Self> {
        match self {
            Self::Inaccessible => None,
            Self::Full => Some(Self::Inaccessible),
            Self::BlockTicking => Some(Self::Full),
            Self::EntityTicking => Some(Self::BlockTicking),
        }
    }

    /// Decodes a byte written with `as u8`. Out of range values decode to `Inaccessible`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Full,
            2 => Self::BlockTicking,
            3 => Self::EntityTicking,
            _ => Self::Inaccessible,
        }
    }
}
