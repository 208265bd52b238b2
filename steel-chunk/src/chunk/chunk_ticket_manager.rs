//! Ticket bookkeeping and the level trackers fed by it.

use rustc_hash::FxHashMap;
use steel_utils::{ChunkPos, SectionPos};
use uuid::Uuid;

use crate::chunk::chunk_tracker::ChunkTracker;
use crate::chunk::section_tracker::SectionTracker;
use crate::chunk::ticket::{SortedTickets, Ticket, TicketKey, TicketType};
use crate::config::{ChunkSystemConfig, MAX_SIMULATION_DISTANCE, MAX_VIEW_DISTANCE};

/// Absent level of the simulation tracker: sections further out than the largest
/// simulation distance.
const SIMULATION_ABSENT_LEVEL: u8 = MAX_SIMULATION_DISTANCE + 1;

/// Owns every ticket and turns them into chunk levels.
///
/// Only the tick thread touches this, through the chunk map.
pub struct ChunkTicketManager {
    config: ChunkSystemConfig,
    tickets: FxHashMap<ChunkPos, SortedTickets>,
    tracker: ChunkTracker,
    simulation: SectionTracker,
    /// player -> section they are in
    players: FxHashMap<Uuid, SectionPos>,
    /// section -> players in it
    player_sections: FxHashMap<SectionPos, u32>,
    current_tick: u64,
}

impl ChunkTicketManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(config: &ChunkSystemConfig) -> Self {
        Self {
            config: config.clone(),
            tickets: FxHashMap::default(),
            tracker: ChunkTracker::new(config.max_level),
            simulation: SectionTracker::new(SIMULATION_ABSENT_LEVEL),
            players: FxHashMap::default(),
            player_sections: FxHashMap::default(),
            current_tick: 0,
        }
    }

    fn refresh_source(&mut self, pos: ChunkPos) {
        let min = self.tickets.get(&pos).and_then(SortedTickets::min_level);
        if min.is_none() {
            self.tickets.remove(&pos);
        }
        self.tracker.set_source(pos, min);
    }

    /// Adds a ticket at `pos`. Duplicates are kept and need one removal each.
    pub fn add_ticket(&mut self, pos: ChunkPos, mut ticket: Ticket) {
        ticket.created_tick = self.current_tick;
        let tickets = self.tickets.entry(pos).or_default();
        let old_min = tickets.min_level();
        tickets.add(ticket);
        log::trace!("Added {ticket} at {pos}");
        if old_min.is_none_or(|old| ticket.level < old) {
            self.tracker.set_source(pos, Some(ticket.level));
        }
    }

    /// Removes one ticket equal to `ticket` from `pos`. Returns `false` if there was none.
    pub fn remove_ticket(&mut self, pos: ChunkPos, ticket: &Ticket) -> bool {
        let Some(tickets) = self.tickets.get_mut(&pos) else {
            return false;
        };
        if !tickets.remove(ticket) {
            return false;
        }
        log::trace!("Removed {ticket} at {pos}");
        self.refresh_source(pos);
        true
    }

    /// Adds a ticket of a fixed level type, see [`ChunkSystemConfig::ticket_level`].
    pub fn add_region_ticket(&mut self, ticket_type: TicketType, pos: ChunkPos, key: TicketKey) -> Ticket {
        let ticket = Ticket::new(ticket_type, self.config.ticket_level(ticket_type), key);
        self.add_ticket(pos, ticket);
        ticket
    }

    /// Removes a ticket added with [`ChunkTicketManager::add_region_ticket`].
    pub fn remove_region_ticket(&mut self, ticket_type: TicketType, pos: ChunkPos, key: TicketKey) -> bool {
        let ticket = Ticket::new(ticket_type, self.config.ticket_level(ticket_type), key);
        self.remove_ticket(pos, &ticket)
    }

    /// Moves every ticket of `ticket_type` to `level`.
    pub fn replace_all_of_type(&mut self, ticket_type: TicketType, level: u8) {
        let mut affected = Vec::new();
        for (&pos, tickets) in &mut self.tickets {
            let removed = tickets.remove_if(|ticket| ticket.ticket_type == ticket_type);
            if removed.is_empty() {
                continue;
            }
            for mut ticket in removed {
                ticket.level = level;
                tickets.add(ticket);
            }
            affected.push(pos);
        }
        for pos in affected {
            self.refresh_source(pos);
        }
    }

    /// Advances the ticket clock and drops expired tickets.
    pub fn tick(&mut self, current_tick: u64) {
        self.current_tick = current_tick;
        let mut affected = Vec::new();
        for (&pos, tickets) in &mut self.tickets {
            let expired = tickets.remove_if(|ticket| ticket.is_expired(current_tick));
            if !expired.is_empty() {
                log::trace!("{} tickets expired at {pos}", expired.len());
                affected.push(pos);
            }
        }
        for pos in affected {
            self.refresh_source(pos);
        }
    }

    fn player_ticket(&self, player: Uuid) -> Ticket {
        Ticket::new(
            TicketType::Player,
            self.config.player_ticket_level(),
            TicketKey::Player(player),
        )
    }

    fn simulation_source_level(&self) -> u8 {
        MAX_SIMULATION_DISTANCE - self.config.simulation_distance
    }

    fn add_player_section(&mut self, section: SectionPos) {
        let count = self.player_sections.entry(section).or_insert(0);
        *count += 1;
        if *count == 1 {
            let level = self.simulation_source_level();
            self.simulation.set_source(section, Some(level));
        }
    }

    fn remove_player_section(&mut self, section: SectionPos) {
        let Some(count) = self.player_sections.get_mut(&section) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.player_sections.remove(&section);
            self.simulation.set_source(section, None);
        }
    }

    /// Registers a player at `section`. Adding a known player moves them instead.
    pub fn add_player(&mut self, player: Uuid, section: SectionPos) {
        if self.players.contains_key(&player) {
            self.move_player(player, section);
            return;
        }
        self.players.insert(player, section);
        let ticket = self.player_ticket(player);
        self.add_ticket(section.chunk(), ticket);
        self.add_player_section(section);
    }

    /// Forgets a player. Returns `false` if they were unknown.
    pub fn remove_player(&mut self, player: Uuid) -> bool {
        let Some(section) = self.players.remove(&player) else {
            return false;
        };
        let ticket = self.player_ticket(player);
        self.remove_ticket(section.chunk(), &ticket);
        self.remove_player_section(section);
        true
    }

    /// Moves a known player to `section`.
    pub fn move_player(&mut self, player: Uuid, section: SectionPos) {
        let Some(old) = self.players.insert(player, section) else {
            log::warn!("Tried to move unknown player {player}");
            self.players.remove(&player);
            return;
        };
        if old == section {
            return;
        }
        if old.chunk() != section.chunk() {
            let ticket = self.player_ticket(player);
            self.add_ticket(section.chunk(), ticket);
            self.remove_ticket(old.chunk(), &ticket);
        }
        self.add_player_section(section);
        self.remove_player_section(old);
    }

    /// Changes the view distance and reissues every player ticket.
    pub fn update_view_distance(&mut self, view_distance: u8) {
        self.config.view_distance = view_distance.clamp(1, MAX_VIEW_DISTANCE);
        let level = self.config.player_ticket_level();
        self.replace_all_of_type(TicketType::Player, level);
    }

    /// Changes the simulation distance around every player.
    pub fn update_simulation_distance(&mut self, simulation_distance: u8) {
        self.config.simulation_distance = simulation_distance.clamp(1, MAX_SIMULATION_DISTANCE);
        let level = self.simulation_source_level();
        let sections: Vec<_> = self.player_sections.keys().copied().collect();
        for section in sections {
            self.simulation.set_source(section, Some(level));
        }
    }

    /// Whether `section` is within the simulation distance of any player.
    #[must_use]
    pub fn is_section_simulated(&self, section: SectionPos) -> bool {
        self.simulation.level(section) < SIMULATION_ABSENT_LEVEL
    }

    /// Propagates pending changes with a budget of chunk nodes and returns the unused budget.
    /// Section levels always settle fully.
    pub fn run_updates(&mut self, budget: usize) -> usize {
        self.simulation.run_all_updates();
        self.tracker.run_updates(budget)
    }

    /// Whether any level change is still pending.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.tracker.has_work() || self.simulation.has_work()
    }

    /// Drains the chunks whose level changed, with their new level.
    pub fn take_level_changes(&mut self) -> Vec<(ChunkPos, u8)> {
        self.tracker.take_changes()
    }

    /// Current level of `pos`.
    #[must_use]
    pub fn level_at(&self, pos: ChunkPos) -> u8 {
        self.tracker.level(pos)
    }

    /// The tickets at `pos`, lowest level first.
    #[must_use]
    pub fn tickets_at(&self, pos: ChunkPos) -> Vec<Ticket> {
        self.tickets
            .get(&pos)
            .map(|tickets| tickets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total number of tickets.
    #[must_use]
    pub fn ticket_count(&self) -> usize {
        self.tickets.values().map(SortedTickets::len).sum()
    }

    /// Number of chunks with a level.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.tracker.len()
    }

    /// The current configuration, including view distance changes.
    #[must_use]
    pub fn config(&self) -> &ChunkSystemConfig {
        &self.config
    }
}
