//! Chunk system configuration, read from JSON5.

use std::{fs, io, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::chunk::chunk_level::ChunkLevel;
use crate::chunk::chunk_tracker::MAX_LEVEL;
use crate::chunk::ticket::TicketType;

const DEFAULT_CONFIG: &str = include_str!("../../package-content/chunk_config.json5");

/// Largest accepted view distance.
pub const MAX_VIEW_DISTANCE: u8 = ChunkLevel::ENTITY_TICKING_LEVEL;
/// Largest accepted simulation distance.
pub const MAX_SIMULATION_DISTANCE: u8 = 32;

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read chunk config: {0}")]
    Io(#[from] io::Error),
    /// The file is not valid JSON5 or does not match the schema.
    #[error("failed to parse chunk config: {0}")]
    Parse(#[from] serde_json5::Error),
    /// A value is out of range.
    #[error("invalid chunk config: {0}")]
    Invalid(&'static str),
}

/// Fixed levels for tickets that are not derived from a distance.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TicketLevels {
    /// Spawn area tickets.
    pub start: u8,
    /// Force loaded chunks.
    pub forced: u8,
    /// Portal tickets.
    pub portal: u8,
    /// Post teleport tickets.
    pub post_teleport: u8,
    /// Synchronous lookups.
    pub unknown: u8,
}

impl Default for TicketLevels {
    fn default() -> Self {
        Self {
            start: 22,
            forced: ChunkLevel::ENTITY_TICKING_LEVEL,
            portal: 30,
            post_teleport: ChunkLevel::BLOCK_TICKING_LEVEL,
            unknown: ChunkLevel::FULL_STATUS_LEVEL,
        }
    }
}

/// Tunables of the chunk loading system.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkSystemConfig {
    /// Level treated as "not loaded". Must be 44, the whole generation pyramid needs it.
    pub max_level: u8,
    /// How many chunks may generate at once.
    pub max_concurrent_generation_tasks: usize,
    /// Propagation steps per tick, `None` to always settle fully.
    pub propagation_budget: Option<usize>,
    /// Radius of the entity ticking area around players.
    pub view_distance: u8,
    /// Radius of the simulated sections around players.
    pub simulation_distance: u8,
    /// Levels of the fixed level ticket types.
    pub ticket_levels: TicketLevels,
}

impl ChunkSystemConfig {
    /// Parses and validates a JSON5 document.
    pub fn from_json5(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json5::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`. If there is no such file the bundled default is
    /// written there and the defaults are returned.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let source = fs::read_to_string(path)?;
            Self::from_json5(&source)
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, DEFAULT_CONFIG)?;
            log::info!("Wrote default chunk config to {}", path.display());
            Ok(Self::default())
        }
    }

    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Every generation step below Full needs holders for its whole neighbour
        // pyramid, which spans all levels up to MAX_LEVEL.
        if self.max_level != MAX_LEVEL {
            return Err(ConfigError::Invalid("max_level must be 44"));
        }
        if self.max_concurrent_generation_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_generation_tasks must be greater than 0",
            ));
        }
        if self.propagation_budget == Some(0) {
            return Err(ConfigError::Invalid("propagation_budget must be greater than 0"));
        }
        if !(1..=MAX_VIEW_DISTANCE).contains(&self.view_distance) {
            return Err(ConfigError::Invalid("view_distance must be in range 1..=31"));
        }
        if !(1..=MAX_SIMULATION_DISTANCE).contains(&self.simulation_distance) {
            return Err(ConfigError::Invalid("simulation_distance must be in range 1..=32"));
        }
        let levels = self.ticket_levels;
        if [
            levels.start,
            levels.forced,
            levels.portal,
            levels.post_teleport,
            levels.unknown,
        ]
        .iter()
        .any(|&level| level >= self.max_level)
        {
            return Err(ConfigError::Invalid("ticket levels must be below max_level"));
        }
        Ok(())
    }

    /// The level of a ticket of `ticket_type`.
    #[must_use]
    pub fn ticket_level(&self, ticket_type: TicketType) -> u8 {
        match ticket_type {
            TicketType::Start => self.ticket_levels.start,
            TicketType::Player => self.player_ticket_level(),
            TicketType::Forced => self.ticket_levels.forced,
            TicketType::Portal => self.ticket_levels.portal,
            TicketType::PostTeleport => self.ticket_levels.post_teleport,
            TicketType::Unknown => self.ticket_levels.unknown,
        }
    }

    /// Level of a player ticket: entity ticking out to the view distance.
    #[must_use]
    pub fn player_ticket_level(&self) -> u8 {
        ChunkLevel::ENTITY_TICKING_LEVEL.saturating_sub(self.view_distance)
    }
}

impl Default for ChunkSystemConfig {
    fn default() -> Self {
        Self {
            max_level: MAX_LEVEL,
            max_concurrent_generation_tasks: 64,
            propagation_budget: None,
            view_distance: 10,
            simulation_distance: 10,
            ticket_levels: TicketLevels::default(),
        }
    }
}
