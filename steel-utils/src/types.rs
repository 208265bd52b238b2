// Wrapper types making it harder to accidentaly use the wrong underlying type.

use std::fmt::{self, Display};

use crate::math::{vector2::Vector2, vector3::Vector3};

// A chunk position. `y` of the inner vector is the chunk z coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkPos(pub Vector2<i32>);

impl ChunkPos {
    /// Creates a new chunk position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self(Vector2::new(x, z))
    }

    /// Packs the position into an `i64`, x in the low half and z in the high half.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        (self.0.x as u32 as i64) | ((self.0.y as u32 as i64) << 32)
    }

    /// Unpacks a position packed with [`ChunkPos::as_i64`].
    #[must_use]
    pub const fn from_i64(packed: i64) -> Self {
        Self::new(packed as i32, (packed >> 32) as i32)
    }

    /// Returns the position offset by the given amount.
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.0.x + dx, self.0.y + dz)
    }

    /// Chessboard distance, the distance chunk levels decay with.
    #[must_use]
    pub const fn chebyshev_distance(self, other: Self) -> i32 {
        let dx = (self.0.x - other.0.x).abs();
        let dz = (self.0.y - other.0.y).abs();
        if dx > dz { dx } else { dz }
    }

    /// Iterates over every position in the square of the given radius around this one,
    /// row by row, including the center.
    pub fn square(self, radius: i32) -> impl Iterator<Item = ChunkPos> {
        (-radius..=radius)
            .flat_map(move |dz| (-radius..=radius).map(move |dx| self.offset(dx, dz)))
    }
}

impl Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.0.x, self.0.y)
    }
}

// A section position, a 16x16x16 cube of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionPos(pub Vector3<i32>);

impl SectionPos {
    const PACKED_X_LENGTH: i64 = 22;
    const PACKED_Z_LENGTH: i64 = 22;
    const PACKED_Y_LENGTH: i64 = 20;
    const PACKED_X_MASK: i64 = (1 << Self::PACKED_X_LENGTH) - 1;
    const PACKED_Y_MASK: i64 = (1 << Self::PACKED_Y_LENGTH) - 1;
    const PACKED_Z_MASK: i64 = (1 << Self::PACKED_Z_LENGTH) - 1;
    const Z_OFFSET: i64 = Self::PACKED_Y_LENGTH;
    const X_OFFSET: i64 = Self::PACKED_Y_LENGTH + Self::PACKED_Z_LENGTH;

    /// Creates a new section position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self(Vector3::new(x, y, z))
    }

    /// Converts a block coordinate into a section coordinate.
    #[must_use]
    pub const fn block_to_section_coord(block: i32) -> i32 {
        block >> 4
    }

    /// The section containing the given block coordinates.
    #[must_use]
    pub const fn of_block(x: i32, y: i32, z: i32) -> Self {
        Self::new(
            Self::block_to_section_coord(x),
            Self::block_to_section_coord(y),
            Self::block_to_section_coord(z),
        )
    }

    /// The chunk column this section belongs to.
    #[must_use]
    pub const fn chunk(self) -> ChunkPos {
        ChunkPos::new(self.0.x, self.0.z)
    }

    /// Packs the position into an `i64` (22 bits x, 22 bits z, 20 bits y).
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        ((self.0.x as i64 & Self::PACKED_X_MASK) << Self::X_OFFSET)
            | (self.0.y as i64 & Self::PACKED_Y_MASK)
            | ((self.0.z as i64 & Self::PACKED_Z_MASK) << Self::Z_OFFSET)
    }

    /// Unpacks a position packed with [`SectionPos::as_i64`].
    #[must_use]
    pub const fn from_i64(packed: i64) -> Self {
        Self::new(
            (packed >> Self::X_OFFSET) as i32,
            ((packed << (64 - Self::PACKED_Y_LENGTH)) >> (64 - Self::PACKED_Y_LENGTH)) as i32,
            ((packed << (64 - Self::X_OFFSET)) >> (64 - Self::PACKED_Z_LENGTH)) as i32,
        )
    }

    /// Returns the position offset by the given amount.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.0.x + dx, self.0.y + dy, self.0.z + dz)
    }
}

impl Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.0.x, self.0.y, self.0.z)
    }
}
