//! Tickets: reasons to keep a chunk loaded at some level.

use std::cmp::Ordering;
use std::fmt::{self, Display};

use smallvec::SmallVec;
use steel_utils::ChunkPos;
use uuid::Uuid;

/// Why a ticket exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TicketType {
    /// The spawn area.
    Start,
    /// A player's view area.
    Player,
    /// Force loaded by a command.
    Forced,
    /// Kept alive after a portal was used.
    Portal,
    /// Kept alive right after a teleport.
    PostTeleport,
    /// Requested by a synchronous chunk lookup.
    Unknown,
}

impl TicketType {
    /// Lifetime in ticks, `0` for tickets that never expire.
    #[must_use]
    pub const fn timeout(self) -> u64 {
        match self {
            Self::Portal => 300,
            Self::PostTeleport => 5,
            Self::Unknown => 1,
            Self::Start | Self::Player | Self::Forced => 0,
        }
    }
}

impl Display for TicketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Player => "player",
            Self::Forced => "forced",
            Self::Portal => "portal",
            Self::PostTeleport => "post_teleport",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Distinguishes tickets of the same type and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TicketKey {
    /// No key, all such tickets are interchangeable.
    None,
    /// Keyed by a chunk position, e.g. the portal's chunk.
    Pos(ChunkPos),
    /// Keyed by an arbitrary id.
    Id(u64),
    /// Keyed by a player.
    Player(Uuid),
}

/// A ticket. Tickets are never mutated, replacing one means removing and re-adding it.
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    /// The ticket's type.
    pub ticket_type: TicketType,
    /// Level applied at the ticket's position.
    pub level: u8,
    /// Identity within the type.
    pub key: TicketKey,
    /// Tick the ticket was added on, used for expiry.
    pub created_tick: u64,
}

impl Ticket {
    /// Creates a ticket. The creation tick is set when it is added to a manager.
    #[must_use]
    pub const fn new(ticket_type: TicketType, level: u8, key: TicketKey) -> Self {
        Self {
            ticket_type,
            level,
            key,
            created_tick: 0,
        }
    }

    /// Whether the ticket has expired at `current_tick`.
    #[must_use]
    pub fn is_expired(&self, current_tick: u64) -> bool {
        let timeout = self.ticket_type.timeout();
        timeout != 0 && current_tick.saturating_sub(self.created_tick) >= timeout
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.ticket_type == other.ticket_type && self.level == other.level && self.key == other.key
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level
            .cmp(&other.level)
            .then_with(|| self.ticket_type.cmp(&other.ticket_type))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket[{} {}] with {:?}", self.ticket_type, self.level, self.key)
    }
}

/// The tickets on one chunk, kept sorted so the lowest level comes first.
///
/// Duplicates are allowed; each add needs its own remove.
#[derive(Debug, Default, Clone)]
pub struct SortedTickets {
    tickets: SmallVec<[Ticket; 2]>,
}

impl SortedTickets {
    /// Inserts a ticket and returns whether it became the new minimum.
    pub fn add(&mut self, ticket: Ticket) -> bool {
        let index = self.tickets.partition_point(|existing| existing <= &ticket);
        self.tickets.insert(index, ticket);
        index == 0
    }

    /// Removes one ticket equal to `ticket`. Returns `false` if there was none.
    pub fn remove(&mut self, ticket: &Ticket) -> bool {
        match self.tickets.iter().position(|existing| existing == ticket) {
            Some(index) => {
                self.tickets.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes every ticket matching `predicate` and returns them.
    pub fn remove_if(&mut self, mut predicate: impl FnMut(&Ticket) -> bool) -> Vec<Ticket> {
        let mut removed = Vec::new();
        self.tickets.retain(|ticket| {
            if predicate(ticket) {
                removed.push(*ticket);
                false
            } else {
                true
            }
        });
        removed
    }

    /// The lowest level of any ticket.
    #[must_use]
    pub fn min_level(&self) -> Option<u8> {
        self.tickets.first().map(|ticket| ticket.level)
    }

    /// Whether there are no tickets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Number of tickets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Iterates over the tickets, lowest level first.
    pub fn iter(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.iter()
    }
}
