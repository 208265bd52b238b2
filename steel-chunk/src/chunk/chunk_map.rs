//! The per-tick scheduler tying tickets, holders and the generation queue together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::future::{BoxFuture, FutureExt, join_all};
use rustc_hash::FxHashSet;
use scc::HashMap;
use steel_utils::locks::SyncMutex;
use steel_utils::{ChunkPos, SectionPos};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chunk::chunk_generation_task::{GenerationJob, StaticCache2D};
use crate::chunk::chunk_generator::{ChunkGenerator, ChunkStatusListener};
use crate::chunk::chunk_holder::ChunkHolder;
use crate::chunk::chunk_pyramid::GENERATION_PYRAMID;
use crate::chunk::chunk_result::{ChunkFuture, ChunkLoadError, ChunkResult, ready_future};
use crate::chunk::chunk_status::{ChunkStatus, FullChunkStatus};
use crate::chunk::chunk_task_priority_queue::{ChunkTaskPriorityQueue, PopError, QueueItem};
use crate::chunk::chunk_ticket_manager::ChunkTicketManager;
use crate::chunk::chunk_tracker::MAX_LEVEL;
use crate::chunk::main_thread_executor::MainThreadExecutor;
use crate::chunk::ticket::{Ticket, TicketKey, TicketType};
use crate::config::{ChunkSystemConfig, ConfigError};

type Holder<G> = ChunkHolder<<G as ChunkGenerator>::Chunk>;

/// Radius of fully generated neighbours an entity ticking chunk needs.
const ENTITY_TICKING_RADIUS: i32 = 2;

/// Owns every chunk holder and drives them from [`ChunkMap::tick`].
///
/// All methods are meant to be called from the tick thread. Generation runs on the tokio
/// runtime and its results are applied during the next tick.
pub struct ChunkMap<G: ChunkGenerator> {
    config: ChunkSystemConfig,
    generator: Arc<G>,
    listener: Arc<dyn ChunkStatusListener<G::Chunk>>,
    runtime: Handle,
    /// The loaded chunks.
    pub chunks: HashMap<ChunkPos, Arc<Holder<G>>>,
    /// Ticket bookkeeping and level propagation.
    pub chunk_tickets: SyncMutex<ChunkTicketManager>,
    task_queue: SyncMutex<ChunkTaskPriorityQueue<GenerationJob<G::Chunk>>>,
    main_thread: MainThreadExecutor<ChunkMap<G>>,
    pending_unloads: SyncMutex<Vec<Arc<Holder<G>>>>,
    ticking_chunks: SyncMutex<FxHashSet<ChunkPos>>,
    entity_ticking_chunks: SyncMutex<FxHashSet<ChunkPos>>,
    current_tick: AtomicU64,
    next_slot_id: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl<G: ChunkGenerator> ChunkMap<G> {
    /// Creates an empty chunk map spawning its work on `runtime`.
    pub fn new(
        config: ChunkSystemConfig,
        generator: Arc<G>,
        listener: Arc<dyn ChunkStatusListener<G::Chunk>>,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let chunk_tickets = ChunkTicketManager::new(&config);
        let task_queue = ChunkTaskPriorityQueue::new(
            usize::from(MAX_LEVEL) + 1,
            config.max_concurrent_generation_tasks,
        );
        Ok(Self {
            config,
            generator,
            listener,
            runtime,
            chunks: HashMap::new(),
            chunk_tickets: SyncMutex::new(chunk_tickets),
            task_queue: SyncMutex::new(task_queue),
            main_thread: MainThreadExecutor::new(),
            pending_unloads: SyncMutex::new(Vec::new()),
            ticking_chunks: SyncMutex::new(FxHashSet::default()),
            entity_ticking_chunks: SyncMutex::new(FxHashSet::default()),
            current_tick: AtomicU64::new(0),
            next_slot_id: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ChunkSystemConfig {
        &self.config
    }

    /// Runs one scheduling round: level changes, queued continuations, the generation
    /// queue and unloads, in that order.
    pub fn tick(&self) {
        let tick = self.current_tick.fetch_add(1, Ordering::AcqRel) + 1;
        let span = tracing::trace_span!("chunk_map_tick", tick);
        let _entered = span.enter();

        self.run_distance_manager_updates(tick);
        let ran = self.main_thread.drain(self);
        if ran > 0 {
            log::trace!("Ran {ran} chunk continuations");
        }
        self.pump_task_queue();
        self.process_unloads();
    }

    /// The number of ticks run so far.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    fn run_distance_manager_updates(&self, tick: u64) {
        let changes = {
            let mut tickets = self.chunk_tickets.lock();
            tickets.tick(tick);
            tickets.run_updates(self.config.propagation_budget.unwrap_or(usize::MAX));
            if tickets.has_work() {
                return;
            }
            tickets.take_level_changes()
        };
        if changes.is_empty() {
            return;
        }

        let changed: Vec<Arc<Holder<G>>> = changes
            .into_iter()
            .filter_map(|(pos, level)| self.update_chunk_scheduling(pos, level))
            .collect();
        for holder in changed {
            holder.update_futures(self);
        }
    }

    fn update_chunk_scheduling(&self, pos: ChunkPos, level: u8) -> Option<Arc<Holder<G>>> {
        let holder = match self.get_holder(pos) {
            Some(holder) => holder,
            None if level >= MAX_LEVEL => return None,
            None => {
                let holder = Arc::new(ChunkHolder::new(pos, level));
                let _ = self.chunks.insert_sync(pos, holder.clone());
                holder
            }
        };
        holder.set_ticket_level(level);
        if level >= MAX_LEVEL {
            self.pending_unloads.lock().push(holder.clone());
        }
        Some(holder)
    }

    fn pump_task_queue(&self) {
        loop {
            let popped = self.task_queue.lock().pop();
            let items = match popped {
                Ok(items) => items,
                Err(PopError::NoCapacity | PopError::Empty) => return,
            };
            let mut acquired = None;
            let mut started = false;
            for item in items {
                match item {
                    QueueItem::Acquire(pos) => acquired = Some(pos),
                    QueueItem::Task(job) => {
                        started = true;
                        self.run_generation_job(job);
                    }
                }
            }
            if let (Some(pos), false) = (acquired, started) {
                self.release_generation_slot(pos);
            }
        }
    }

    fn run_generation_job(&self, job: GenerationJob<G::Chunk>) {
        let GenerationJob {
            holder,
            status,
            slot_id,
        } = job;
        let pos = holder.get_pos();
        if !holder.start_generation(status, slot_id) {
            log::trace!("Skipping stale {status} job for {pos}");
            self.release_generation_slot(pos);
            return;
        }

        let parent = status.parent().and_then(|parent| holder.try_chunk(parent));
        let radius = GENERATION_PYRAMID
            .get_step_to(status)
            .direct_dependencies
            .get_radius() as i32;
        let neighbors = Arc::new(StaticCache2D::create(pos, radius, |neighbor| {
            self.get_holder(neighbor).and_then(|holder| holder.chunk())
        }));

        let generation = self.generator.generate(status, pos, parent, neighbors);
        let owner = holder.clone();
        let task = self.spawn_then(generation, move |map, result| {
            owner.on_generation_complete(map, status, slot_id, result);
        });
        holder.add_save_dependency(task.map(|_| ()).boxed());
    }

    fn process_unloads(&self) {
        let holders = std::mem::take(&mut *self.pending_unloads.lock());
        for holder in holders {
            self.schedule_unload(holder);
        }
    }

    fn schedule_unload(&self, holder: Arc<Holder<G>>) {
        let (barrier, generation) = holder.save_barrier();
        self.spawn_then(barrier, move |map, ()| map.try_unload(holder, generation));
    }

    fn try_unload(&self, holder: Arc<Holder<G>>, generation: u64) {
        let pos = holder.get_pos();
        if holder.ticket_level() < MAX_LEVEL {
            log::trace!("Chunk {pos} was reloaded before it could unload");
            return;
        }
        if holder.save_generation() != generation {
            self.schedule_unload(holder);
            return;
        }

        holder.clear_requests(self);
        let removed = self
            .chunks
            .remove_if_sync(&pos, |existing| Arc::ptr_eq(existing, &holder))
            .is_some();
        if !removed {
            return;
        }
        self.task_queue.lock().release(pos, true);
        if let (Some(status), Some(chunk)) = (holder.persisted_status(), holder.chunk()) {
            self.listener.persist(pos, status, &chunk);
        }
        log::debug!("Unloaded chunk {pos}");
    }

    /// Runs `future` on the runtime and hands its output to `then` on the tick thread.
    pub(crate) fn spawn_then<T, F>(
        &self,
        future: F,
        then: impl FnOnce(&Self, T) + Send + 'static,
    ) -> JoinHandle<()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.main_thread.handle();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);
        self.runtime.spawn(async move {
            let value = future.await;
            handle.execute(move |map| then(map, value));
            in_flight.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Gives every holder whose full statuses could depend on `pos` another try at the
    /// ones that failed.
    pub(crate) fn retry_failed_promotions_around(&self, pos: ChunkPos) {
        let radius = GENERATION_PYRAMID
            .get_step_to(ChunkStatus::Full)
            .accumulated_dependencies
            .get_radius() as i32
            + ENTITY_TICKING_RADIUS;
        for neighbor in pos.square(radius) {
            if let Some(holder) = self.get_holder(neighbor) {
                holder.retry_failed_promotions(self);
            }
        }
    }

    pub(crate) fn next_slot_id(&self) -> u64 {
        self.next_slot_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn listener(&self) -> &dyn ChunkStatusListener<G::Chunk> {
        &*self.listener
    }

    pub(crate) fn submit_generation_job(&self, pos: ChunkPos, job: GenerationJob<G::Chunk>, priority: u8) {
        let mut queue = self.task_queue.lock();
        queue.submit(None, pos, priority);
        queue.submit(Some(job), pos, priority);
    }

    pub(crate) fn release_generation_slot(&self, pos: ChunkPos) {
        self.task_queue.lock().release(pos, false);
    }

    pub(crate) fn resort_generation_job(&self, from: u8, pos: ChunkPos, to: u8) {
        self.task_queue.lock().resort(from, pos, to);
    }

    pub(crate) fn on_full_status_change(&self, pos: ChunkPos, status: FullChunkStatus) {
        {
            let mut ticking = self.ticking_chunks.lock();
            if status >= FullChunkStatus::BlockTicking {
                ticking.insert(pos);
            } else {
                ticking.remove(&pos);
            }
        }
        {
            let mut entity_ticking = self.entity_ticking_chunks.lock();
            if status >= FullChunkStatus::EntityTicking {
                entity_ticking.insert(pos);
            } else {
                entity_ticking.remove(&pos);
            }
        }
        log::trace!("Chunk {pos} is now {status:?}");
        self.listener.on_full_status_change(pos, status);
    }

    /// Resolves once the chunk itself is fully generated.
    pub(crate) fn prepare_accessible_chunk(&self, holder: &Arc<Holder<G>>) -> BoxFuture<'static, ChunkResult<G::Chunk>> {
        holder
            .schedule_chunk_generation_task(ChunkStatus::Full, self)
            .boxed()
    }

    /// Resolves once the chunk and its direct neighbours are fully generated.
    pub(crate) fn prepare_ticking_chunk(&self, holder: &Arc<Holder<G>>) -> BoxFuture<'static, ChunkResult<G::Chunk>> {
        self.prepare_area(holder, 1)
    }

    /// Resolves once every chunk within two of this one is fully generated.
    pub(crate) fn prepare_entity_ticking_chunk(&self, holder: &Arc<Holder<G>>) -> BoxFuture<'static, ChunkResult<G::Chunk>> {
        self.prepare_area(holder, ENTITY_TICKING_RADIUS)
    }

    fn prepare_area(&self, holder: &Arc<Holder<G>>, radius: i32) -> BoxFuture<'static, ChunkResult<G::Chunk>> {
        let center = holder.get_pos();
        let futures: Vec<ChunkFuture<G::Chunk>> = center
            .square(radius)
            .map(|pos| match self.get_holder(pos) {
                Some(neighbor) => neighbor.schedule_chunk_generation_task(ChunkStatus::Full, self),
                None => ready_future(Err(ChunkLoadError::Unloaded)),
            })
            .collect();
        let center_future = holder.schedule_chunk_generation_task(ChunkStatus::Full, self);
        async move {
            for result in join_all(futures).await {
                result?;
            }
            center_future.await
        }
        .boxed()
    }

    /// The holder at `pos`, if the chunk is loaded.
    #[must_use]
    pub fn get_holder(&self, pos: ChunkPos) -> Option<Arc<Holder<G>>> {
        self.chunks.read_sync(&pos, |_, holder| holder.clone())
    }

    /// Requests generation of `pos` up to `status`.
    ///
    /// Resolves with [`ChunkLoadError::Unloaded`] when the chunk is not loaded or its level
    /// does not allow `status`.
    pub fn schedule_chunk_generation(&self, pos: ChunkPos, status: ChunkStatus) -> ChunkFuture<G::Chunk> {
        match self.get_holder(pos) {
            Some(holder) => holder.schedule_chunk_generation_task(status, self),
            None => ready_future(Err(ChunkLoadError::Unloaded)),
        }
    }

    /// Adds a ticket. Takes effect on the next tick.
    pub fn add_ticket(&self, pos: ChunkPos, ticket: Ticket) {
        self.chunk_tickets.lock().add_ticket(pos, ticket);
    }

    /// Removes one ticket equal to `ticket`. Returns `false` if there was none.
    pub fn remove_ticket(&self, pos: ChunkPos, ticket: &Ticket) -> bool {
        self.chunk_tickets.lock().remove_ticket(pos, ticket)
    }

    /// Adds a ticket at the configured level of `ticket_type`.
    pub fn add_region_ticket(&self, ticket_type: TicketType, pos: ChunkPos, key: TicketKey) -> Ticket {
        self.chunk_tickets
            .lock()
            .add_region_ticket(ticket_type, pos, key)
    }

    /// Removes a ticket added with [`ChunkMap::add_region_ticket`].
    pub fn remove_region_ticket(&self, ticket_type: TicketType, pos: ChunkPos, key: TicketKey) -> bool {
        self.chunk_tickets
            .lock()
            .remove_region_ticket(ticket_type, pos, key)
    }

    /// Starts loading chunks around a player.
    pub fn add_player(&self, player: Uuid, section: SectionPos) {
        self.chunk_tickets.lock().add_player(player, section);
    }

    /// Stops loading chunks for a player. Returns `false` if they were not tracked.
    pub fn remove_player(&self, player: Uuid) -> bool {
        self.chunk_tickets.lock().remove_player(player)
    }

    /// Moves a tracked player.
    pub fn move_player(&self, player: Uuid, section: SectionPos) {
        self.chunk_tickets.lock().move_player(player, section);
    }

    /// Changes the view distance of every player.
    pub fn update_view_distance(&self, view_distance: u8) {
        self.chunk_tickets.lock().update_view_distance(view_distance);
    }

    /// Changes the simulation distance of every player.
    pub fn update_simulation_distance(&self, simulation_distance: u8) {
        self.chunk_tickets
            .lock()
            .update_simulation_distance(simulation_distance);
    }

    /// Whether `section` is within the simulation distance of a player.
    #[must_use]
    pub fn is_section_simulated(&self, section: SectionPos) -> bool {
        self.chunk_tickets.lock().is_section_simulated(section)
    }

    /// The propagated level of `pos`.
    #[must_use]
    pub fn level_at(&self, pos: ChunkPos) -> u8 {
        self.chunk_tickets.lock().level_at(pos)
    }

    /// Lowers the queue priority level of `pos` by `boost`. Returns `false` if it is not loaded.
    pub fn set_priority_boost(&self, pos: ChunkPos, boost: u8) -> bool {
        match self.get_holder(pos) {
            Some(holder) => {
                holder.set_priority_boost(boost, self);
                true
            }
            None => false,
        }
    }

    /// Chunks that are at least block ticking.
    #[must_use]
    pub fn ticking_chunks(&self) -> Vec<ChunkPos> {
        self.ticking_chunks.lock().iter().copied().collect()
    }

    /// Chunks that are entity ticking.
    #[must_use]
    pub fn entity_ticking_chunks(&self) -> Vec<ChunkPos> {
        self.entity_ticking_chunks.lock().iter().copied().collect()
    }

    /// Number of loaded chunks.
    #[must_use]
    pub fn loaded_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether anything is still propagating, generating, queued or waiting to unload.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        if self.in_flight.load(Ordering::Acquire) > 0 || !self.main_thread.is_empty() {
            return true;
        }
        if !self.pending_unloads.lock().is_empty() || self.chunk_tickets.lock().has_work() {
            return true;
        }
        let queue = self.task_queue.lock();
        queue.has_work() || queue.acquired_count() > 0
    }

    /// Hands every generated chunk to the listener's `persist`. Returns how many there were.
    ///
    /// Save dependencies that already resolved are dropped along the way.
    pub fn save_all(&self) -> usize {
        let mut saved = 0;
        self.chunks.iter_sync(|&pos, holder| {
            holder.prune_save_dependencies();
            if let (Some(status), Some(chunk)) = (holder.persisted_status(), holder.chunk()) {
                self.listener.persist(pos, status, &chunk);
                saved += 1;
            }
            true
        });
        saved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use futures::future::{self, FutureExt};
    use steel_utils::logger;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::chunk::chunk_level::ChunkLevel;

    #[derive(Debug)]
    struct TestChunk {
        status: ChunkStatus,
    }

    #[derive(Default)]
    struct TestGenerator {
        fail_once: Option<(ChunkPos, ChunkStatus)>,
        failed: AtomicBool,
        delay: bool,
        calls: AtomicUsize,
        violations: AtomicUsize,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl ChunkGenerator for TestGenerator {
        type Chunk = TestChunk;

        fn generate(
            &self,
            status: ChunkStatus,
            pos: ChunkPos,
            parent: Option<Arc<TestChunk>>,
            neighbors: Arc<StaticCache2D<Option<Arc<TestChunk>>>>,
        ) -> BoxFuture<'static, anyhow::Result<Arc<TestChunk>>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if parent.map(|chunk| chunk.status) != status.parent() {
                self.violations.fetch_add(1, Ordering::Relaxed);
            }
            let step = GENERATION_PYRAMID.get_step_to(status);
            for neighbor in pos.square(neighbors.radius()) {
                let distance = neighbor.chebyshev_distance(pos) as usize;
                let Some(required) = step.direct_dependencies.get(distance) else {
                    continue;
                };
                if distance == 0 {
                    continue;
                }
                let satisfied = neighbors
                    .get(neighbor)
                    .and_then(Option::as_ref)
                    .is_some_and(|chunk| chunk.status >= required);
                if !satisfied {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                }
            }

            if self.fail_once == Some((pos, status)) && !self.failed.swap(true, Ordering::AcqRel) {
                return future::ready(Err(anyhow::anyhow!("test failure"))).boxed();
            }

            let running = self.running.clone();
            let max_running = self.max_running.clone();
            let now = running.fetch_add(1, Ordering::AcqRel) + 1;
            max_running.fetch_max(now, Ordering::AcqRel);
            let delay = self.delay;
            async move {
                if delay {
                    sleep(Duration::from_millis(2)).await;
                }
                running.fetch_sub(1, Ordering::AcqRel);
                Ok(Arc::new(TestChunk { status }))
            }
            .boxed()
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: SyncMutex<Vec<(ChunkPos, FullChunkStatus)>>,
        broadcasts: AtomicUsize,
        persisted: AtomicUsize,
    }

    impl RecordingListener {
        fn events_at(&self, pos: ChunkPos) -> Vec<FullChunkStatus> {
            self.events
                .lock()
                .iter()
                .filter(|(event_pos, _)| *event_pos == pos)
                .map(|&(_, status)| status)
                .collect()
        }
    }

    impl ChunkStatusListener<TestChunk> for RecordingListener {
        fn on_full_status_change(&self, pos: ChunkPos, status: FullChunkStatus) {
            self.events.lock().push((pos, status));
        }

        fn broadcast_changes(&self, _pos: ChunkPos, _chunk: &Arc<TestChunk>) {
            self.broadcasts.fetch_add(1, Ordering::Relaxed);
        }

        fn persist(&self, _pos: ChunkPos, _status: ChunkStatus, _chunk: &Arc<TestChunk>) {
            self.persisted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_map(
        config: ChunkSystemConfig,
        generator: TestGenerator,
    ) -> (ChunkMap<TestGenerator>, Arc<RecordingListener>, Arc<TestGenerator>) {
        let _ = logger::init("warn");
        let listener = Arc::new(RecordingListener::default());
        let generator = Arc::new(generator);
        let map = ChunkMap::new(config, generator.clone(), listener.clone(), Handle::current())
            .expect("valid config");
        (map, listener, generator)
    }

    async fn tick_until(map: &ChunkMap<TestGenerator>, mut done: impl FnMut(&ChunkMap<TestGenerator>) -> bool) {
        for _ in 0..5000 {
            map.tick();
            if done(map) {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached after 5000 ticks");
    }

    fn settled(map: &ChunkMap<TestGenerator>) -> bool {
        !map.has_pending_work()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ticket_lifecycle_fires_each_boundary_once() {
        let (map, listener, generator) = test_map(ChunkSystemConfig::default(), TestGenerator::default());
        let center = ChunkPos::new(0, 0);
        let ticket = Ticket::new(TicketType::Forced, ChunkLevel::ENTITY_TICKING_LEVEL, TicketKey::None);

        map.add_ticket(center, ticket);
        tick_until(&map, |map| {
            map.get_holder(center)
                .is_some_and(|holder| holder.full_status() == FullChunkStatus::EntityTicking)
        })
        .await;
        assert_eq!(
            listener.events_at(center),
            [
                FullChunkStatus::Full,
                FullChunkStatus::BlockTicking,
                FullChunkStatus::EntityTicking
            ]
        );
        assert!(map.entity_ticking_chunks().contains(&center));
        assert_eq!(map.level_at(ChunkPos::new(12, 0)), 43);
        assert!(map.get_holder(ChunkPos::new(13, 0)).is_none());

        let holder = map.get_holder(center).expect("center is loaded");
        holder.update_futures(&map);
        tick_until(&map, settled).await;
        assert_eq!(listener.events_at(center).len(), 3);
        let full_future = holder
            .get_chunk_future(ChunkStatus::Full)
            .expect("full was scheduled");
        let ticking_future = holder
            .get_full_future(FullChunkStatus::EntityTicking)
            .expect("entity ticking was requested");

        assert!(map.remove_ticket(center, &ticket));
        tick_until(&map, |map| map.loaded_chunk_count() == 0 && settled(map)).await;
        assert_eq!(
            listener.events_at(center),
            [
                FullChunkStatus::Full,
                FullChunkStatus::BlockTicking,
                FullChunkStatus::EntityTicking,
                FullChunkStatus::BlockTicking,
                FullChunkStatus::Full,
                FullChunkStatus::Inaccessible
            ]
        );
        assert!(map.ticking_chunks().is_empty());
        assert!(map.entity_ticking_chunks().is_empty());
        assert_eq!(generator.violations.load(Ordering::Relaxed), 0);
        assert!(listener.broadcasts.load(Ordering::Relaxed) > 0);

        let result = timeout(Duration::from_secs(1), full_future)
            .await
            .expect("completed future resolves");
        assert!(result.is_ok());
        let result = timeout(Duration::from_secs(1), ticking_future)
            .await
            .expect("confirmed future resolves");
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revoked_work_resolves_every_future() {
        let (map, _listener, _generator) = test_map(ChunkSystemConfig::default(), TestGenerator::default());
        let center = ChunkPos::new(4, -2);
        let ticket = Ticket::new(TicketType::Forced, ChunkLevel::FULL_STATUS_LEVEL, TicketKey::Id(7));

        map.add_ticket(center, ticket);
        map.tick();
        let holder = map.get_holder(center).expect("loaded after one tick");
        let futures: Vec<_> = ChunkStatus::ALL
            .into_iter()
            .filter_map(|status| holder.get_chunk_future(status))
            .collect();
        assert!(!futures.is_empty());

        map.remove_ticket(center, &ticket);
        tick_until(&map, |map| map.loaded_chunk_count() == 0 && settled(map)).await;

        for future in futures {
            timeout(Duration::from_secs(1), future)
                .await
                .expect("every stage future resolves");
        }
        assert_eq!(holder.full_status(), FullChunkStatus::Inaccessible);
        assert!(!holder.has_pending_stages());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_generation_retries_after_level_change() {
        let center = ChunkPos::new(0, 0);
        let generator = TestGenerator {
            fail_once: Some((center, ChunkStatus::Features)),
            ..TestGenerator::default()
        };
        let (map, listener, generator) = test_map(ChunkSystemConfig::default(), generator);

        map.add_ticket(center, Ticket::new(TicketType::Forced, 33, TicketKey::Id(1)));
        tick_until(&map, |map| generator.failed.load(Ordering::Acquire) && settled(map)).await;
        let holder = map.get_holder(center).expect("center is loaded");
        assert_eq!(holder.persisted_status(), Some(ChunkStatus::Carvers));
        assert_eq!(holder.full_status(), FullChunkStatus::Inaccessible);
        assert!(listener.events_at(center).is_empty());

        map.add_ticket(center, Ticket::new(TicketType::Forced, 32, TicketKey::Id(2)));
        tick_until(&map, |_| holder.full_status() == FullChunkStatus::BlockTicking).await;
        assert_eq!(
            listener.events_at(center),
            [FullChunkStatus::Full, FullChunkStatus::BlockTicking]
        );
        assert_eq!(holder.persisted_status(), Some(ChunkStatus::Full));
        assert!(map.ticking_chunks().contains(&center));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generation_respects_concurrency_bound() {
        let config = ChunkSystemConfig {
            max_concurrent_generation_tasks: 4,
            ..ChunkSystemConfig::default()
        };
        let generator = TestGenerator {
            delay: true,
            ..TestGenerator::default()
        };
        let (map, _listener, generator) = test_map(config, generator);
        let center = ChunkPos::new(-3, 9);

        map.add_ticket(center, Ticket::new(TicketType::Forced, 33, TicketKey::None));
        tick_until(&map, |map| {
            map.get_holder(center)
                .is_some_and(|holder| holder.full_status() == FullChunkStatus::Full)
        })
        .await;

        let max_running = generator.max_running.load(Ordering::Acquire);
        assert!(max_running > 0);
        assert!(max_running <= 4, "{max_running} generations ran at once");
        assert_eq!(generator.violations.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_requests_respect_the_level() {
        let (map, listener, _generator) = test_map(ChunkSystemConfig::default(), TestGenerator::default());
        let center = ChunkPos::new(0, 0);
        let edge = ChunkPos::new(1, 0);

        assert_eq!(
            map.schedule_chunk_generation(center, ChunkStatus::Empty).await.err(),
            Some(ChunkLoadError::Unloaded)
        );

        let ticket = map.add_region_ticket(TicketType::Forced, center, TicketKey::Id(3));
        assert_eq!(ticket.level, ChunkLevel::ENTITY_TICKING_LEVEL);
        map.tick();
        assert_eq!(map.level_at(edge), 32);
        let far = ChunkPos::new(12, 0);
        assert_eq!(map.level_at(far), 43);
        assert_eq!(
            map.schedule_chunk_generation(far, ChunkStatus::Noise).await.err(),
            Some(ChunkLoadError::Unloaded)
        );

        let request = tokio::spawn(map.schedule_chunk_generation(far, ChunkStatus::StructureStarts));
        tick_until(&map, |_| request.is_finished()).await;
        let chunk = request.await.expect("task ran").expect("generated");
        assert_eq!(chunk.status, ChunkStatus::StructureStarts);
        assert!(map.set_priority_boost(far, 4));
        let boosted = map.get_holder(far).expect("far is loaded");
        assert!(boosted.priority() <= 39);
        assert!(!map.set_priority_boost(ChunkPos::new(100, 100), 4));

        tick_until(&map, settled).await;
        let before = listener.persisted.load(Ordering::Relaxed);
        assert!(map.save_all() > 0);
        assert!(listener.persisted.load(Ordering::Relaxed) > before);

        assert!(map.remove_region_ticket(TicketType::Forced, center, TicketKey::Id(3)));
        assert!(!map.remove_region_ticket(TicketType::Forced, center, TicketKey::Id(3)));
        tick_until(&map, |map| map.loaded_chunk_count() == 0 && settled(map)).await;
    }

    #[tokio::test]
    async fn partial_level_range_is_rejected() {
        let config = ChunkSystemConfig {
            max_level: 34,
            ..ChunkSystemConfig::default()
        };
        let result = ChunkMap::new(
            config,
            Arc::new(TestGenerator::default()),
            Arc::new(RecordingListener::default()),
            Handle::current(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn neighbor_failure_recovers_when_the_failed_chunk_reloads() {
        let failing = ChunkPos::new(0, 0);
        let dependent = ChunkPos::new(1, 0);
        let generator = TestGenerator {
            fail_once: Some((failing, ChunkStatus::Carvers)),
            ..TestGenerator::default()
        };
        let (map, listener, generator) = test_map(ChunkSystemConfig::default(), generator);

        map.add_ticket(dependent, Ticket::new(TicketType::Forced, 33, TicketKey::Id(1)));
        tick_until(&map, |map| generator.failed.load(Ordering::Acquire) && settled(map)).await;
        let a = map.get_holder(failing).expect("failing chunk is loaded");
        let b = map.get_holder(dependent).expect("dependent chunk is loaded");
        assert!(a.try_chunk(ChunkStatus::Carvers).is_none());
        assert_eq!(b.full_status(), FullChunkStatus::Inaccessible);

        // Only the failed chunk's level changes.
        map.add_ticket(failing, Ticket::new(TicketType::Forced, 33, TicketKey::Id(2)));
        tick_until(&map, |_| {
            a.full_status() == FullChunkStatus::Full && b.full_status() == FullChunkStatus::Full
        })
        .await;
        assert_eq!(b.ticket_level(), 33);
        assert_eq!(listener.events_at(dependent), [FullChunkStatus::Full]);
        assert_eq!(generator.violations.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn save_dependencies_do_not_pile_up() {
        let (map, _listener, _generator) = test_map(ChunkSystemConfig::default(), TestGenerator::default());
        let center = ChunkPos::new(0, 0);
        map.add_ticket(center, Ticket::new(TicketType::Forced, 32, TicketKey::Id(0)));
        tick_until(&map, |map| {
            map.get_holder(center)
                .is_some_and(|holder| holder.full_status() == FullChunkStatus::BlockTicking)
                && settled(map)
        })
        .await;
        let holder = map.get_holder(center).expect("center is loaded");
        let generation = holder.save_generation();

        for id in 1..=20 {
            let ticket = Ticket::new(TicketType::Forced, 31, TicketKey::Id(id));
            map.add_ticket(center, ticket);
            tick_until(&map, |map| holder.full_status() == FullChunkStatus::EntityTicking && settled(map)).await;
            assert!(map.remove_ticket(center, &ticket));
            tick_until(&map, |map| holder.full_status() == FullChunkStatus::BlockTicking && settled(map)).await;
        }
        assert!(holder.save_generation() >= generation + 20);

        map.save_all();
        let pending = holder.pending_saves();
        assert!(pending < 4, "{pending} resolved save dependencies kept");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn neighbor_requests_move_dependency_priority() {
        let (map, _listener, _generator) = test_map(ChunkSystemConfig::default(), TestGenerator::default());
        let dependency_pos = ChunkPos::new(0, 0);
        let requester_pos = ChunkPos::new(1, 0);
        let dependency = Arc::new(ChunkHolder::new(dependency_pos, 40));
        let requester = Arc::new(ChunkHolder::new(requester_pos, 33));
        let _ = map.chunks.insert_sync(dependency_pos, dependency.clone());
        let _ = map.chunks.insert_sync(requester_pos, requester.clone());
        assert_eq!(dependency.priority(), 40);

        let request = requester.schedule_chunk_generation_task(ChunkStatus::StructureReferences, &map);
        assert_eq!(
            requester.outgoing_request(dependency_pos),
            Some(ChunkStatus::StructureStarts)
        );
        assert_eq!(dependency.priority(), 33);

        for _ in 0..1000 {
            map.main_thread.drain(&map);
            if map.task_queue.lock().level_of(dependency_pos).is_some() {
                break;
            }
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(map.task_queue.lock().level_of(dependency_pos), Some(33));

        let other = ChunkPos::new(-1, 0);
        assert_eq!(
            dependency.on_neighbor_request(other, ChunkStatus::StructureStarts, 20, &map),
            20
        );
        assert_eq!(dependency.priority(), 20);
        assert_eq!(map.task_queue.lock().level_of(dependency_pos), Some(20));

        tick_until(&map, |map| {
            requester.outgoing_request(dependency_pos).is_none() && settled(map)
        })
        .await;
        assert_eq!(dependency.persisted_status(), Some(ChunkStatus::StructureStarts));
        assert_eq!(dependency.priority(), 40);
        let result = timeout(Duration::from_secs(1), request)
            .await
            .expect("request resolves");
        assert_eq!(result.err(), Some(ChunkLoadError::Unloaded));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn budgeted_propagation_holds_back_holders() {
        let config = ChunkSystemConfig {
            propagation_budget: Some(8),
            ..ChunkSystemConfig::default()
        };
        let (map, _listener, _generator) = test_map(config, TestGenerator::default());
        let center = ChunkPos::new(2, 2);
        map.add_ticket(center, Ticket::new(TicketType::Forced, 31, TicketKey::None));

        let mut rounds = 0;
        loop {
            map.tick();
            rounds += 1;
            if !map.chunk_tickets.lock().has_work() {
                break;
            }
            assert_eq!(map.loaded_chunk_count(), 0, "holders created mid propagation");
        }
        assert!(rounds > 1);
        assert_eq!(map.loaded_chunk_count(), 625);
        for pos in center.square(13) {
            let level = map.level_at(pos);
            match map.get_holder(pos) {
                Some(holder) => assert_eq!(holder.ticket_level(), level),
                None => assert_eq!(level, MAX_LEVEL),
            }
        }

        tick_until(&map, |map| {
            map.get_holder(center)
                .is_some_and(|holder| holder.full_status() == FullChunkStatus::EntityTicking)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn players_load_and_release_chunks() {
        let (map, _listener, _generator) = test_map(ChunkSystemConfig::default(), TestGenerator::default());
        let player = Uuid::from_u128(42);

        map.update_view_distance(1);
        map.add_player(player, SectionPos::new(5, 4, 5));
        map.tick();
        assert_eq!(map.level_at(ChunkPos::new(5, 5)), 30);
        assert!(map.is_section_simulated(SectionPos::new(5, 4, 5)));
        assert!(map.get_holder(ChunkPos::new(5, 5)).is_some());

        map.move_player(player, SectionPos::new(6, 4, 5));
        map.tick();
        assert_eq!(map.level_at(ChunkPos::new(6, 5)), 30);
        assert_eq!(map.level_at(ChunkPos::new(5, 5)), 31);

        assert!(map.remove_player(player));
        assert!(!map.remove_player(player));
        tick_until(&map, |map| map.loaded_chunk_count() == 0 && settled(map)).await;
        assert!(!map.is_section_simulated(SectionPos::new(6, 4, 5)));
    }
}
