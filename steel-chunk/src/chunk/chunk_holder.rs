//! Per-chunk generation state.
//!
//! A holder owns one future slot per generation status plus one per full status boundary.
//! Level changes are applied in [`ChunkHolder::update_futures`]: slots the new level no
//! longer supports are completed with [`ChunkLoadError::Unloaded`], newly reached full
//! statuses are requested from the chunk map and confirmed back on the tick thread.
//!
//! Every mutation happens on the tick thread. The state lock is never held while calling
//! into the chunk map or another holder.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use rustc_hash::FxHashMap;
use steel_utils::ChunkPos;
use steel_utils::locks::SyncMutex;

use crate::chunk::chunk_generator::ChunkGenerator;
use crate::chunk::chunk_generation_task::GenerationJob;
use crate::chunk::chunk_level::ChunkLevel;
use crate::chunk::chunk_map::ChunkMap;
use crate::chunk::chunk_pyramid::GENERATION_PYRAMID;
use crate::chunk::chunk_result::{ChunkFuture, ChunkLoadError, ChunkResult, Completable, ready_future};
use crate::chunk::chunk_status::{ChunkStatus, FullChunkStatus};
use crate::chunk::chunk_tracker::MAX_LEVEL;

/// Number of full status boundaries, `Full`, `BlockTicking` and `EntityTicking`.
const FULL_BOUNDARIES: usize = 3;

fn boundary_index(status: FullChunkStatus) -> Option<usize> {
    (status as usize).checked_sub(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Waiting for the parent status and neighbours.
    Waiting,
    /// In the task queue.
    Queued,
    /// The generator is running.
    Running,
    Done,
    /// This chunk's own generation failed. Cleared on the next level change.
    Failed,
}

struct StageSlot<C> {
    id: u64,
    completable: Completable<C>,
    state: SlotState,
}

#[derive(Debug, Clone, Copy)]
struct NeighborRequest {
    status: ChunkStatus,
    priority: u8,
}

struct HolderState<C> {
    old_ticket_level: u8,
    ticket_level: u8,
    /// Level of this chunk's entry in the task queue.
    queue_level: u8,
    /// `ticket_level - priority_boost`, what this chunk asks of its dependencies.
    base_priority: u8,
    /// `base_priority` lowered by the requests of dependent neighbours.
    priority: u8,
    priority_boost: u8,
    slots: [Option<StageSlot<C>>; ChunkStatus::COUNT],
    full_futures: [Option<Completable<C>>; FULL_BOUNDARIES],
    /// Bumped on every demotion so confirmations started before it are dropped.
    full_update_counters: [u64; FULL_BOUNDARIES],
    /// requester -> what it needs from this chunk
    incoming: FxHashMap<ChunkPos, NeighborRequest>,
    /// dependency -> what this chunk needs from it
    outgoing: FxHashMap<ChunkPos, ChunkStatus>,
    to_save: Vec<Shared<BoxFuture<'static, ()>>>,
    save_generation: u64,
}

/// Generation state of one chunk. See the module docs.
pub struct ChunkHolder<C> {
    pos: ChunkPos,
    state: SyncMutex<HolderState<C>>,
    chunk: ArcSwapOption<C>,
    persisted_status: AtomicU8,
    full_status: AtomicU8,
    ticket_level: AtomicU8,
}

impl<C: Send + Sync + 'static> ChunkHolder<C> {
    /// Creates a holder that has not applied any level yet.
    #[must_use]
    pub fn new(pos: ChunkPos, ticket_level: u8) -> Self {
        Self {
            pos,
            state: SyncMutex::new(HolderState {
                old_ticket_level: MAX_LEVEL,
                ticket_level,
                queue_level: ticket_level,
                base_priority: ticket_level,
                priority: ticket_level,
                priority_boost: 0,
                slots: [const { None }; ChunkStatus::COUNT],
                full_futures: [const { None }; FULL_BOUNDARIES],
                full_update_counters: [0; FULL_BOUNDARIES],
                incoming: FxHashMap::default(),
                outgoing: FxHashMap::default(),
                to_save: Vec::new(),
                save_generation: 0,
            }),
            chunk: ArcSwapOption::empty(),
            persisted_status: AtomicU8::new(ChunkStatus::encode(None)),
            full_status: AtomicU8::new(FullChunkStatus::Inaccessible as u8),
            ticket_level: AtomicU8::new(ticket_level),
        }
    }

    /// The chunk's position.
    #[must_use]
    pub fn get_pos(&self) -> ChunkPos {
        self.pos
    }

    /// The latest ticket level, possibly not applied yet.
    #[must_use]
    pub fn ticket_level(&self) -> u8 {
        self.ticket_level.load(Ordering::Acquire)
    }

    /// The highest status generated so far.
    #[must_use]
    pub fn persisted_status(&self) -> Option<ChunkStatus> {
        ChunkStatus::decode(self.persisted_status.load(Ordering::Acquire))
    }

    /// The confirmed full status.
    #[must_use]
    pub fn full_status(&self) -> FullChunkStatus {
        FullChunkStatus::from_u8(self.full_status.load(Ordering::Acquire))
    }

    /// The latest chunk content.
    #[must_use]
    pub fn chunk(&self) -> Option<Arc<C>> {
        self.chunk.load_full()
    }

    /// The chunk, if it has been generated to at least `status`.
    #[must_use]
    pub fn try_chunk(&self, status: ChunkStatus) -> Option<Arc<C>> {
        if self.persisted_status().is_some_and(|persisted| persisted >= status) {
            self.chunk()
        } else {
            None
        }
    }

    /// The future of the slot for `status`, if one is scheduled.
    #[must_use]
    pub fn get_chunk_future(&self, status: ChunkStatus) -> Option<ChunkFuture<C>> {
        self.state.lock().slots[status.index()]
            .as_ref()
            .map(|slot| slot.completable.future())
    }

    /// The future of a full status boundary, if it is requested.
    #[must_use]
    pub fn get_full_future(&self, status: FullChunkStatus) -> Option<ChunkFuture<C>> {
        let index = boundary_index(status)?;
        self.state.lock().full_futures[index]
            .as_ref()
            .map(Completable::future)
    }

    /// The effective queue priority, lower is more urgent.
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.state.lock().priority
    }

    /// Sets the level that will be applied by the next [`ChunkHolder::update_futures`].
    pub(crate) fn set_ticket_level(&self, level: u8) {
        self.state.lock().ticket_level = level;
        self.ticket_level.store(level, Ordering::Release);
    }

    /// Appends a future the next save or eviction has to wait for.
    pub(crate) fn add_save_dependency(&self, future: BoxFuture<'static, ()>) {
        self.prune_save_dependencies();
        let mut state = self.state.lock();
        state.to_save.push(future.shared());
        state.save_generation += 1;
    }

    /// Forgets save dependencies that already resolved.
    pub(crate) fn prune_save_dependencies(&self) {
        let mut pending = mem::take(&mut self.state.lock().to_save);
        pending.retain(|future| future.clone().now_or_never().is_none());
        let mut state = self.state.lock();
        pending.append(&mut state.to_save);
        state.to_save = pending;
    }

    /// A future resolving once everything added so far has, and the generation it covers.
    pub(crate) fn save_barrier(&self) -> (BoxFuture<'static, ()>, u64) {
        let state = self.state.lock();
        let pending = state.to_save.clone();
        (join_all(pending).map(|_| ()).boxed(), state.save_generation)
    }

    /// Number of futures added to the save barrier so far. Only ever grows.
    pub(crate) fn save_generation(&self) -> u64 {
        self.state.lock().save_generation
    }

    #[cfg(test)]
    pub(crate) fn pending_saves(&self) -> usize {
        self.state.lock().to_save.len()
    }

    /// Applies the pending ticket level.
    ///
    /// Applying the level that is already applied does nothing.
    pub fn update_futures<G: ChunkGenerator<Chunk = C>>(self: &Arc<Self>, map: &ChunkMap<G>) {
        let (old_level, new_level) = {
            let state = self.state.lock();
            (state.old_ticket_level, state.ticket_level)
        };
        if old_level == new_level {
            return;
        }

        let status_before = ChunkLevel::generation_status(old_level);
        let status_after = ChunkLevel::generation_status(new_level);
        let full_before = ChunkLevel::full_status(old_level);
        let full_after = ChunkLevel::full_status(new_level);

        let (dropped_requests, cleared_failures) = {
            let mut state = self.state.lock();
            let mut cleared_failures = false;
            for slot in &mut state.slots {
                if slot.as_ref().is_some_and(|slot| slot.state == SlotState::Failed) {
                    *slot = None;
                    cleared_failures = true;
                }
            }

            if status_after < status_before {
                let keep = status_after.map_or(0, |status| status.index() + 1);
                for slot in &mut state.slots[keep..] {
                    if let Some(slot) = slot.take() {
                        slot.completable.complete(Err(ChunkLoadError::Unloaded));
                    }
                }
                (state.outgoing.drain().map(|(pos, _)| pos).collect(), cleared_failures)
            } else {
                (Vec::new(), cleared_failures)
            }
        };
        for dependency in dropped_requests {
            if let Some(holder) = map.get_holder(dependency) {
                holder.on_requester_gone(self.pos, map);
            }
        }

        for status in FullChunkStatus::ALL.into_iter().rev() {
            if status > full_after && status <= full_before {
                self.demote(map, status);
            }
        }
        for status in FullChunkStatus::ALL {
            if status > FullChunkStatus::Inaccessible && status <= full_after {
                self.promote_if_needed(map, status);
            }
        }

        self.refresh_priority(map);
        self.state.lock().old_ticket_level = new_level;

        if cleared_failures {
            map.retry_failed_promotions_around(self.pos);
        }
    }

    /// Requests again every full status the applied level allows whose last attempt failed.
    /// Does nothing while a level change is pending, [`ChunkHolder::update_futures`] covers it.
    pub(crate) fn retry_failed_promotions<G: ChunkGenerator<Chunk = C>>(self: &Arc<Self>, map: &ChunkMap<G>) {
        let full = {
            let state = self.state.lock();
            if state.old_ticket_level != state.ticket_level {
                return;
            }
            ChunkLevel::full_status(state.ticket_level)
        };
        for status in FullChunkStatus::ALL {
            if status > FullChunkStatus::Inaccessible && status <= full {
                self.promote_if_needed(map, status);
            }
        }
    }

    fn promote_if_needed<G: ChunkGenerator<Chunk = C>>(self: &Arc<Self>, map: &ChunkMap<G>, status: FullChunkStatus) {
        let Some(index) = boundary_index(status) else {
            return;
        };
        if self.full_status() >= status {
            return;
        }
        let (counter, future) = {
            let mut state = self.state.lock();
            let retry = state.full_futures[index]
                .as_ref()
                .is_none_or(|future| matches!(future.result(), Some(Err(_))));
            if !retry {
                return;
            }
            let completable = Completable::new();
            let future = completable.future();
            state.full_futures[index] = Some(completable);
            (state.full_update_counters[index], future)
        };
        self.add_save_dependency(future.map(|_| ()).boxed());

        let readiness = match status {
            FullChunkStatus::Inaccessible => return,
            FullChunkStatus::Full => map.prepare_accessible_chunk(self),
            FullChunkStatus::BlockTicking => map.prepare_ticking_chunk(self),
            FullChunkStatus::EntityTicking => map.prepare_entity_ticking_chunk(self),
        };
        let holder = self.clone();
        map.spawn_then(readiness, move |map, result| {
            holder.confirm_full_status(map, status, counter, result);
        });
    }

    fn confirm_full_status<G: ChunkGenerator<Chunk = C>>(
        &self,
        map: &ChunkMap<G>,
        status: FullChunkStatus,
        counter: u64,
        result: ChunkResult<C>,
    ) {
        let Some(index) = boundary_index(status) else {
            return;
        };
        {
            let state = self.state.lock();
            if state.full_update_counters[index] != counter
                || ChunkLevel::full_status(state.ticket_level) < status
            {
                log::trace!("Dropping stale {status:?} confirmation for {}", self.pos);
                return;
            }
            if let Some(future) = &state.full_futures[index] {
                future.complete(result.clone());
            }
        }
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) => {
                log::debug!("Chunk {} did not reach {status:?}: {err}", self.pos);
                return;
            }
        };

        let mut raised = Vec::new();
        let mut current = self.full_status();
        while current < status {
            let Some(&next) = FullChunkStatus::ALL.get(current as usize + 1) else {
                break;
            };
            current = next;
            raised.push(next);
        }
        if raised.is_empty() {
            return;
        }
        self.full_status.store(status as u8, Ordering::Release);
        for reached in raised {
            map.on_full_status_change(self.pos, reached);
        }
        map.listener().broadcast_changes(self.pos, &chunk);
    }

    fn demote<G: ChunkGenerator<Chunk = C>>(&self, map: &ChunkMap<G>, status: FullChunkStatus) {
        let Some(index) = boundary_index(status) else {
            return;
        };
        let lowered = {
            let mut state = self.state.lock();
            state.full_update_counters[index] += 1;
            if let Some(future) = state.full_futures[index].take() {
                future.complete(Err(ChunkLoadError::Unloaded));
            }
            let previous = status.previous().unwrap_or(FullChunkStatus::Inaccessible);
            if self.full_status() >= status {
                self.full_status.store(previous as u8, Ordering::Release);
                Some(previous)
            } else {
                None
            }
        };
        if let Some(previous) = lowered {
            map.on_full_status_change(self.pos, previous);
        }
    }

    /// Schedules generation up to `status`, together with everything it depends on.
    ///
    /// Resolves with [`ChunkLoadError::Unloaded`] right away if the level does not allow
    /// `status`. Scheduling a status twice returns the same future.
    pub fn schedule_chunk_generation_task<G: ChunkGenerator<Chunk = C>>(
        self: &Arc<Self>,
        status: ChunkStatus,
        map: &ChunkMap<G>,
    ) -> ChunkFuture<C> {
        let (slot_id, future) = {
            let mut state = self.state.lock();
            let allowed = ChunkLevel::generation_status(state.ticket_level);
            if allowed.is_none_or(|allowed| status > allowed) {
                return ready_future(Err(ChunkLoadError::Unloaded));
            }
            if let Some(slot) = &state.slots[status.index()] {
                return slot.completable.future();
            }

            let id = map.next_slot_id();
            let completable = Completable::new();
            let future = completable.future();
            if let Some(chunk) = self.try_chunk(status) {
                completable.complete(Ok(chunk));
                state.slots[status.index()] = Some(StageSlot {
                    id,
                    completable,
                    state: SlotState::Done,
                });
                return future;
            }
            state.slots[status.index()] = Some(StageSlot {
                id,
                completable,
                state: SlotState::Waiting,
            });
            (id, future)
        };
        self.add_save_dependency(future.clone().map(|_| ()).boxed());

        let mut dependencies = Vec::new();
        if let Some(parent) = status.parent() {
            dependencies.push(self.schedule_chunk_generation_task(parent, map));
        }

        let step = GENERATION_PYRAMID.get_step_to(status);
        let radius = step.direct_dependencies.get_radius() as i32;
        let base_priority = self.state.lock().base_priority;
        for pos in self.pos.square(radius) {
            if pos == self.pos {
                continue;
            }
            let distance = pos.chebyshev_distance(self.pos) as usize;
            let Some(required) = step.direct_dependencies.get(distance) else {
                continue;
            };
            let Some(neighbor) = map.get_holder(pos) else {
                dependencies.push(ready_future(Err(ChunkLoadError::Unloaded)));
                continue;
            };
            dependencies.push(neighbor.schedule_chunk_generation_task(required, map));
            if neighbor.persisted_status().is_none_or(|persisted| persisted < required) {
                {
                    let mut state = self.state.lock();
                    let wanted = state.outgoing.entry(pos).or_insert(required);
                    *wanted = (*wanted).max(required);
                }
                neighbor.on_neighbor_request(self.pos, required, base_priority, map);
            }
        }

        let holder = self.clone();
        map.spawn_then(join_all(dependencies), move |map, results| {
            let failure = results.into_iter().find_map(Result::err);
            holder.on_dependencies_ready(map, status, slot_id, failure);
        });
        future
    }

    fn on_dependencies_ready<G: ChunkGenerator<Chunk = C>>(
        self: &Arc<Self>,
        map: &ChunkMap<G>,
        status: ChunkStatus,
        slot_id: u64,
        failure: Option<ChunkLoadError>,
    ) {
        let priority = {
            let mut state = self.state.lock();
            let index = status.index();
            let Some(slot) = state.slots[index].as_mut().filter(|slot| slot.id == slot_id) else {
                log::trace!("Dependencies of stale {status} slot for {} resolved", self.pos);
                return;
            };
            if slot.state != SlotState::Waiting {
                return;
            }
            // A failed dependency is not this chunk's failure, the next request rebuilds the slot.
            if let Some(err) = failure {
                slot.completable.complete(Err(err));
                state.slots[index] = None;
                return;
            }
            if let Some(chunk) = self.try_chunk(status) {
                slot.completable.complete(Ok(chunk));
                slot.state = SlotState::Done;
                return;
            }
            slot.state = SlotState::Queued;
            state.queue_level = state.priority;
            state.priority
        };

        let job = GenerationJob {
            holder: self.clone(),
            status,
            slot_id,
        };
        map.submit_generation_job(self.pos, job, priority);
    }

    /// Marks the slot of a popped job as running. Returns `false` if the job is stale.
    pub(crate) fn start_generation(&self, status: ChunkStatus, slot_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.slots[status.index()].as_mut() {
            Some(slot) if slot.id == slot_id && slot.state == SlotState::Queued => {
                slot.state = SlotState::Running;
                true
            }
            _ => false,
        }
    }

    /// Stores the generator's result, on the tick thread.
    pub(crate) fn on_generation_complete<G: ChunkGenerator<Chunk = C>>(
        self: &Arc<Self>,
        map: &ChunkMap<G>,
        status: ChunkStatus,
        slot_id: u64,
        result: anyhow::Result<Arc<C>>,
    ) {
        map.release_generation_slot(self.pos);
        match result {
            Ok(chunk) => {
                if self.persisted_status().is_none_or(|persisted| persisted < status) {
                    self.chunk.store(Some(chunk.clone()));
                    self.persisted_status
                        .store(ChunkStatus::encode(Some(status)), Ordering::Release);
                    map.listener().persist(self.pos, status, &chunk);
                }
                {
                    let mut state = self.state.lock();
                    match state.slots[status.index()].as_mut() {
                        Some(slot) if slot.id == slot_id => {
                            slot.completable.complete(Ok(chunk));
                            slot.state = SlotState::Done;
                        }
                        _ => log::trace!("Generated {status} for {} after it was dropped", self.pos),
                    }
                }
                self.notify_neighbors_done(map, status);
            }
            Err(err) => {
                log::error!("Failed to generate {status} for chunk {}: {err:#}", self.pos);
                let mut state = self.state.lock();
                if let Some(slot) = state.slots[status.index()]
                    .as_mut()
                    .filter(|slot| slot.id == slot_id)
                {
                    slot.completable.complete(Err(ChunkLoadError::Generation {
                        pos: self.pos,
                        status,
                        message: format!("{err:#}"),
                    }));
                    slot.state = SlotState::Failed;
                }
            }
        }
    }

    /// Records that `requester` needs this chunk at `status`. Returns the new priority.
    pub fn on_neighbor_request<G: ChunkGenerator<Chunk = C>>(
        &self,
        requester: ChunkPos,
        status: ChunkStatus,
        priority: u8,
        map: &ChunkMap<G>,
    ) -> u8 {
        {
            let mut state = self.state.lock();
            let request = state
                .incoming
                .entry(requester)
                .or_insert(NeighborRequest { status, priority });
            request.status = request.status.max(status);
            request.priority = priority;
        }
        self.refresh_priority(map)
    }

    /// Clears the record of `dependency` once it reached what this chunk asked for.
    pub fn on_neighbor_done(&self, dependency: ChunkPos, reached: ChunkStatus) {
        let mut state = self.state.lock();
        if state
            .outgoing
            .get(&dependency)
            .is_some_and(|&wanted| wanted <= reached)
        {
            state.outgoing.remove(&dependency);
        }
    }

    fn on_requester_gone<G: ChunkGenerator<Chunk = C>>(&self, requester: ChunkPos, map: &ChunkMap<G>) {
        let removed = self.state.lock().incoming.remove(&requester).is_some();
        if removed {
            self.refresh_priority(map);
        }
    }

    fn notify_neighbors_done<G: ChunkGenerator<Chunk = C>>(&self, map: &ChunkMap<G>, reached: ChunkStatus) {
        let satisfied: Vec<ChunkPos> = {
            let mut state = self.state.lock();
            let satisfied: Vec<ChunkPos> = state
                .incoming
                .iter()
                .filter(|(_, request)| request.status <= reached)
                .map(|(&pos, _)| pos)
                .collect();
            for pos in &satisfied {
                state.incoming.remove(pos);
            }
            satisfied
        };
        if satisfied.is_empty() {
            return;
        }
        self.refresh_priority(map);
        for requester in satisfied {
            if let Some(holder) = map.get_holder(requester) {
                holder.on_neighbor_done(self.pos, reached);
            }
        }
    }

    /// Sets an explicit boost lowering this chunk's priority level.
    pub fn set_priority_boost<G: ChunkGenerator<Chunk = C>>(&self, boost: u8, map: &ChunkMap<G>) {
        self.state.lock().priority_boost = boost;
        self.refresh_priority(map);
    }

    /// Recomputes the priority from the level, the boost and neighbour requests. Moves the
    /// queue entry and tells dependencies when something changed.
    fn refresh_priority<G: ChunkGenerator<Chunk = C>>(&self, map: &ChunkMap<G>) -> u8 {
        let (priority, resort, dependencies) = {
            let mut state = self.state.lock();
            let base = state.ticket_level.saturating_sub(state.priority_boost);
            let priority = state
                .incoming
                .values()
                .map(|request| request.priority)
                .fold(base, u8::min);

            let resort = (priority != state.priority).then_some(state.queue_level);
            if resort.is_some() {
                state.priority = priority;
                state.queue_level = priority;
            }
            let dependencies: Vec<(ChunkPos, ChunkStatus)> = if base == state.base_priority {
                Vec::new()
            } else {
                state.base_priority = base;
                state.outgoing.iter().map(|(&pos, &status)| (pos, status)).collect()
            };
            (priority, resort, dependencies)
        };

        if let Some(from) = resort {
            map.resort_generation_job(from, self.pos, priority);
        }
        let base = self.state.lock().base_priority;
        for (pos, status) in dependencies {
            if let Some(holder) = map.get_holder(pos) {
                holder.on_neighbor_request(self.pos, status, base, map);
            }
        }
        priority
    }

    /// Drops every outgoing request, before eviction.
    pub(crate) fn clear_requests<G: ChunkGenerator<Chunk = C>>(&self, map: &ChunkMap<G>) {
        let dependencies: Vec<ChunkPos> = self.state.lock().outgoing.drain().map(|(pos, _)| pos).collect();
        for dependency in dependencies {
            if let Some(holder) = map.get_holder(dependency) {
                holder.on_requester_gone(self.pos, map);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn outgoing_request(&self, dependency: ChunkPos) -> Option<ChunkStatus> {
        self.state.lock().outgoing.get(&dependency).copied()
    }

    /// Whether any stage slot is still waiting, queued or running.
    #[must_use]
    pub fn has_pending_stages(&self) -> bool {
        self.state.lock().slots.iter().flatten().any(|slot| {
            matches!(
                slot.state,
                SlotState::Waiting | SlotState::Queued | SlotState::Running
            )
        })
    }
}
