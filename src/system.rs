// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The virtual texture system.

[`VirtualTextureSystem`] is the context object every operation goes through.  The thread that
owns it calls [`VirtualTextureSystem::update`] once per frame:

1. a requested full flush evicts everything unlocked,
2. textures queued on a [`DestroyQueue`] are destroyed,
3. feedback is read and reduced in parallel shards,
4. explicit and feedback requests are gathered in parallel shards and merged,
5. loads are sorted and clamped to the upload budget,
6. slots are allocated, producers called and page tables written,
7. the frame counter advances.

Work that cannot complete (no free slot, a pending producer, budget) is left for a later
frame rather than blocking the update.
*/

pub(crate) mod registry;
pub(crate) mod submit;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::adaptive::AdaptiveVirtualTexture;
use crate::bittricks::{encode_page, morton_address, morton_xy};
use crate::cache::page_pool::{PageKey, PagePool};
use crate::config::Config;
use crate::producer::{ProduceKind, Producer, ProducerDescription, ProducerError, ProducerHandle};
use crate::requests::feedback::{FeedbackAnalyzer, FeedbackReadback};
use crate::requests::gather::{GatherParameters, GatherStats, gather_parallel};
use crate::requests::request_list::RequestList;
use crate::requests::unique_page_list::UniquePageList;
use crate::space::SpaceDescription;
use crate::space::allocated_vt::{
    AllocateError, AllocatedVirtualTexture, AllocatedVtDescription, AllocatedVtId, DestroyQueue,
};
use crate::space::page_map::{PageTableEntry, PageTableUpdate};
use crate::tile::{LocalTile, PageMapping, PhysicalSpaceId, SpaceId, TileRegion};
use registry::Registry;
use submit::Submission;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SystemError {
    #[error("Producer error {0}")]
    Producer(#[from] ProducerError),
    #[error("Can't allocate virtual texture {0}")]
    Allocate(#[from] AllocateError),
    #[error("Virtual texture {0:?} does not exist")]
    UnknownVirtualTexture(AllocatedVtId),
    #[error("Space {0:?} does not exist")]
    UnknownSpace(SpaceId),
}

/**
A rectangle of level-0 texels, `min` inclusive and `max` exclusive.

An empty region means the whole texture.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TexelRegion {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TexelRegion {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        TexelRegion {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }
}

/// What one update did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateReport {
    /// The frame the update ran as.
    pub frame: u32,
    pub unique_pages: usize,
    /// Load requests after merging, before the budget clamp.
    pub load_requests: usize,
    /// Load requests that survived the clamp.
    pub load_requests_submitted: usize,
    pub dropped_requests: usize,
    /// Loads produced into newly allocated slots.
    pub tiles_produced: u32,
    pub allocation_failures: u32,
    /// Resident tiles re-produced in place after a flush.
    pub carry_over_produced: u32,
    pub continuous_updates_produced: u32,
    /// Recency touches applied by the gatherers.
    pub page_updates: u32,
    pub mappings_written: u32,
    /// Page-table changes for the renderer, per space.
    pub page_table_updates: Vec<(SpaceId, Vec<PageTableUpdate>)>,
}

fn read(registry: &RwLock<Registry>) -> RwLockReadGuard<'_, Registry> {
    registry.read().unwrap_or_else(|e| e.into_inner())
}
fn write(registry: &RwLock<Registry>) -> RwLockWriteGuard<'_, Registry> {
    registry.write().unwrap_or_else(|e| e.into_inner())
}

fn lock_requests(requested: &Mutex<Vec<u32>>) -> MutexGuard<'_, Vec<u32>> {
    requested.lock().unwrap_or_else(|e| e.into_inner())
}

fn all_groups(num_groups: usize) -> u8 {
    ((1u32 << num_groups) - 1) as u8
}

pub struct VirtualTextureSystem {
    registry: Arc<RwLock<Registry>>,
    config: Config,
    tile_locks: crate::cache::tile_locks::TileLocks,
    /// Locked tiles not yet pinned, with the groups still to pin.
    tiles_to_lock: BTreeMap<LocalTile, u8>,
    /// Resident tiles to re-produce in place.
    mapped_tiles_to_produce: BTreeSet<LocalTile>,
    requested_tiles: Mutex<Vec<u32>>,
    vts_to_map: Vec<AllocatedVtId>,
    destroy_queue: DestroyQueue,
    flush_requested: bool,
    rng: StdRng,
}

impl std::fmt::Debug for VirtualTextureSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTextureSystem")
            .field("frame", &self.frame())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VirtualTextureSystem {
    pub fn new(config: Config) -> Self {
        logwise::info_sync!("VirtualTextureSystem::new");
        VirtualTextureSystem {
            registry: Arc::new(RwLock::new(Registry::new())),
            rng: StdRng::seed_from_u64(config.random_seed),
            config,
            tile_locks: crate::cache::tile_locks::TileLocks::new(),
            tiles_to_lock: BTreeMap::new(),
            mapped_tiles_to_produce: BTreeSet::new(),
            requested_tiles: Mutex::new(Vec::new()),
            vts_to_map: Vec::new(),
            destroy_queue: DestroyQueue::default(),
            flush_requested: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the configuration.  The eviction policy applies to every existing pool.
    pub fn set_config(&mut self, config: Config) {
        write(&self.registry).physical_spaces.set_policy(config.eviction);
        self.config = config;
    }

    /// The frame the next update will run as.
    pub fn frame(&self) -> u32 {
        read(&self.registry).frame
    }

    // Producers

    /**
    Registers a producer, creating or sharing one physical space per group.

    Producers that keep their coarsest level resident have those tiles locked immediately.
    */
    pub fn register_producer(
        &mut self,
        description: ProducerDescription,
        producer: Arc<dyn Producer>,
    ) -> Result<ProducerHandle, SystemError> {
        description.validate()?;
        let persistent = description.persistent_highest_mip;
        let max_level = description.max_level;
        let width = description.width_in_tiles.div_ceil(1 << max_level);
        let height = description.height_in_tiles.div_ceil(1 << max_level);
        let handle = {
            let mut registry = write(&self.registry);
            let policy = self.config.eviction;
            let physical_spaces = (0..description.num_physical_groups())
                .map(|group| {
                    registry
                        .physical_spaces
                        .acquire(&description.physical_space_description(group as u8), policy)
                })
                .collect();
            logwise::info_sync!(
                "registering producer {name}",
                name = logwise::privacy::LogIt(&description.name)
            );
            registry.producers.register(description, producer, physical_spaces)
        };
        if persistent {
            for y in 0..height {
                for x in 0..width {
                    self.lock_tile(LocalTile::new(handle, morton_address(x, y), max_level))?;
                }
            }
        }
        Ok(handle)
    }

    /**
    Releases a producer.

    Its locks are dropped, every tile it owns is evicted (unmapping first) and its physical
    spaces lose a reference.  Spaces nothing references are destroyed at the end of the next
    update.
    */
    pub fn release_producer(&mut self, handle: ProducerHandle) -> Result<(), SystemError> {
        let shared = Arc::clone(&self.registry);
        let mut registry = write(&shared);
        let physical_spaces = registry
            .producers
            .find(handle)
            .ok_or(ProducerError::UnknownProducer(handle))?
            .physical_spaces()
            .to_vec();
        self.tile_locks.force_unlock_all(handle);
        self.tiles_to_lock.retain(|tile, _| tile.producer != handle);
        self.mapped_tiles_to_produce.retain(|tile| tile.producer != handle);

        let Registry {
            physical_spaces: spaces_by_id,
            spaces,
            producers,
            ..
        } = &mut *registry;
        let mut evicted = 0;
        let mut unique = physical_spaces.clone();
        unique.sort();
        unique.dedup();
        for id in unique {
            if let Some(space) = spaces_by_id.get_mut(id) {
                evicted += space.pool_mut().evict_producer(spaces, handle);
            }
        }
        for id in physical_spaces {
            spaces_by_id.release(id);
        }
        producers.release(handle)?;
        logwise::info_sync!(
            "released producer {index}, evicting {evicted} tiles",
            index = handle.index(),
            evicted = evicted
        );
        Ok(())
    }

    // Virtual textures

    /// Allocates a virtual texture, sharing a space with compatible textures unless asked not to.
    pub fn allocate_virtual_texture(
        &mut self,
        description: AllocatedVtDescription,
    ) -> Result<AllocatedVtId, SystemError> {
        let shared = Arc::clone(&self.registry);
        let mut registry = write(&shared);
        self.destroy_pending(&mut registry);
        let id = registry.allocated_vts.next_id();
        let frame = registry.frame;
        let mut vt = AllocatedVirtualTexture::new(id, description, &registry.producers, frame)?;
        let space_description = SpaceDescription {
            tile_size: vt.tile_size(),
            tile_border: vt.tile_border(),
            num_page_table_layers: vt.num_page_table_layers() as u8,
            private_space: vt.description().private_space,
        };
        let (space, address) = registry.spaces.acquire(
            space_description,
            vt.width_in_tiles(),
            vt.height_in_tiles(),
            id,
        )?;
        vt.assign_address(space, address);
        if vt.persistent_highest_mip() {
            self.vts_to_map.push(id);
        }
        logwise::trace_sync!(
            "allocated virtual texture in space {space} at {address}",
            space = space.0,
            address = address
        );
        registry.allocated_vts.insert(vt);
        Ok(id)
    }

    /// Destroys a texture now.  Its page-table entries are removed; its tiles stay cached.
    pub fn destroy_virtual_texture(&mut self, id: AllocatedVtId) -> Result<(), SystemError> {
        let mut registry = write(&self.registry);
        if destroy(&mut registry, id) {
            Ok(())
        } else {
            Err(SystemError::UnknownVirtualTexture(id))
        }
    }

    /// A handle for destroying textures from other threads.
    pub fn destroy_queue(&self) -> DestroyQueue {
        self.destroy_queue.clone()
    }

    fn destroy_pending(&mut self, registry: &mut Registry) {
        for id in self.destroy_queue.take() {
            if !destroy(registry, id) {
                logwise::info_sync!(
                    "queued texture {id} was already destroyed",
                    id = logwise::privacy::LogIt(&id)
                );
            }
        }
    }

    /// Calls `f` with the texture, if it exists.
    pub fn with_virtual_texture<R>(
        &self,
        id: AllocatedVtId,
        f: impl FnOnce(&AllocatedVirtualTexture) -> R,
    ) -> Option<R> {
        read(&self.registry).allocated_vts.get(id).map(f)
    }

    /// Calls `f` with the pool of a physical space, if it exists.
    pub fn with_pool<R>(&self, id: PhysicalSpaceId, f: impl FnOnce(&PagePool) -> R) -> Option<R> {
        read(&self.registry).pool(id).map(f)
    }

    /// The physical spaces backing each group of `producer`.
    pub fn physical_spaces(&self, producer: ProducerHandle) -> Option<Vec<PhysicalSpaceId>> {
        read(&self.registry)
            .producers
            .find(producer)
            .map(|p| p.physical_spaces().to_vec())
    }

    /// The current page-table entry for `mapping`.
    pub fn page_table_entry(&self, mapping: PageMapping) -> Option<PageTableEntry> {
        read(&self.registry)
            .spaces
            .get(mapping.space)?
            .page_map(mapping.page_table_layer as usize)
            .entry(mapping.v_level, mapping.v_address)
    }

    /// Attaches an adaptive virtual texture to `space`, replacing any previous one.
    pub fn register_adaptive(
        &mut self,
        space: SpaceId,
        adaptive: Arc<dyn AdaptiveVirtualTexture>,
    ) -> Result<(), SystemError> {
        let mut registry = write(&self.registry);
        if registry.spaces.get(space).is_none() {
            return Err(SystemError::UnknownSpace(space));
        }
        registry.adaptive[space.0 as usize] = Some(adaptive);
        Ok(())
    }

    // Explicit requests

    /**
    Requests the tiles of `region` of a texture.

    With `mip_level` the region is requested at that level.  Otherwise the level is chosen so
    a texel covers about one pixel of `screen_space_size`, and the next coarser level is
    requested too.  Requests are gathered at the next update with the highest weight.
    */
    pub fn request_tiles_for_region(
        &self,
        id: AllocatedVtId,
        screen_space_size: (f32, f32),
        region: TexelRegion,
        mip_level: Option<u8>,
    ) -> Result<(), SystemError> {
        let registry = read(&self.registry);
        let vt = registry
            .allocated_vts
            .get(id)
            .filter(|_| !self.destroy_queue.contains(id))
            .ok_or(SystemError::UnknownVirtualTexture(id))?;
        let mut packed = Vec::new();
        request_region(vt, screen_space_size, region, mip_level, &mut packed);
        lock_requests(&self.requested_tiles).extend(packed);
        Ok(())
    }

    /// [`VirtualTextureSystem::request_tiles_for_region`] for the whole of every texture.
    pub fn request_tiles(&self, screen_space_size: (f32, f32), mip_level: Option<u8>) {
        let registry = read(&self.registry);
        let mut packed = Vec::new();
        for vt in registry
            .allocated_vts
            .iter()
            .filter(|vt| !self.destroy_queue.contains(vt.id()))
        {
            request_region(vt, screen_space_size, TexelRegion::default(), mip_level, &mut packed);
        }
        lock_requests(&self.requested_tiles).extend(packed);
    }

    /// Requests that have not been gathered yet.
    pub fn num_pending_requests(&self) -> usize {
        lock_requests(&self.requested_tiles).len()
    }

    /**
    Services every queued explicit request now, ignoring the upload budget and producing
    even tiles their producers report as pending.
    */
    pub async fn load_pending_tiles(&mut self) -> UpdateReport {
        let _perf = logwise::perfwarn_begin!("VirtualTextureSystem::load_pending_tiles");
        let mut report = UpdateReport::default();
        let requested = std::mem::take(&mut *lock_requests(&self.requested_tiles));
        if requested.is_empty() {
            return report;
        }
        let shared = Arc::clone(&self.registry);
        let frame = {
            let mut registry = write(&shared);
            self.destroy_pending(&mut registry);
            registry.frame
        };
        report.frame = frame;
        let mut pages = UniquePageList::new();
        for page in requested {
            pages.add(page, u16::MAX);
        }
        report.unique_pages = pages.len();
        let (list, stats) = self.gather(&shared, pages, frame, frame).await;
        report.page_updates = stats.page_updates;
        report.load_requests = list.loads().len();
        report.load_requests_submitted = list.loads().len();

        let mut registry = write(&shared);
        self.finish_submission(&mut registry, &list, false, Submission::default(), &mut report);
        report
    }

    // Locking

    /**
    Pins a tile.  The first lock queues it; the next update pins its resident groups and
    loads the rest as locked loads, which pin when produced.
    */
    pub fn lock_tile(&mut self, tile: LocalTile) -> Result<(), SystemError> {
        let groups = read(&self.registry)
            .producers
            .find(tile.producer)
            .map(|p| p.num_physical_groups())
            .ok_or(ProducerError::UnknownProducer(tile.producer))?;
        if self.tile_locks.lock(tile) {
            self.tiles_to_lock.insert(tile, all_groups(groups));
        }
        Ok(())
    }

    /// Drops a lock.  The last unlock unpins whatever was pinned.
    pub fn unlock_tile(&mut self, tile: LocalTile) {
        if self.tile_locks.unlock(tile) {
            let pending = self.tiles_to_lock.remove(&tile).unwrap_or(0);
            unpin(&mut write(&self.registry), tile, pending);
        }
    }

    /// Drops every lock of `producer`.
    pub fn force_unlock_all_tiles(&mut self, producer: ProducerHandle) {
        let tiles = self.tile_locks.force_unlock_all(producer);
        let mut registry = write(&self.registry);
        for tile in tiles {
            let pending = self.tiles_to_lock.remove(&tile).unwrap_or(0);
            unpin(&mut registry, tile, pending);
        }
    }

    pub fn is_tile_locked(&self, tile: &LocalTile) -> bool {
        self.tile_locks.is_locked(tile)
    }

    fn collect_locks(&mut self, registry: &mut Registry) -> RequestList {
        let mut list = RequestList::new();
        let Registry {
            producers,
            physical_spaces,
            ..
        } = registry;
        for (tile, mut mask) in std::mem::take(&mut self.tiles_to_lock) {
            let Some(producer) = producers.find(tile.producer) else {
                continue;
            };
            for group in 0..producer.num_physical_groups() as u8 {
                if mask & (1 << group) == 0 {
                    continue;
                }
                let Some(space) = physical_spaces.get_mut(producer.physical_space_for_group(group)) else {
                    continue;
                };
                let key = PageKey::new(tile.producer, group, tile.local_address, tile.local_level);
                if let Some(slot) = space.pool().find_page_address(&key) {
                    if space.pool_mut().lock(slot).is_ok() {
                        mask &= !(1 << group);
                    }
                }
            }
            if mask != 0 {
                list.lock_load_request(tile, mask);
            }
        }
        list
    }

    // Flushing

    /// Evicts every unlocked tile at the start of the next update.
    pub fn flush_cache(&mut self) {
        self.flush_requested = true;
    }

    /**
    Evicts the tiles of `producer` inside `region` (level-0 tiles of the producer) at levels
    up to `max_level`.

    Locked tiles stay and are re-produced in place at the next update.  Every page-table
    entry an evicted tile backed is requested again, so the hole refills.
    */
    pub fn flush_cache_region(
        &mut self,
        producer: ProducerHandle,
        region: TileRegion,
        max_level: u8,
    ) -> Result<(), SystemError> {
        let shared = Arc::clone(&self.registry);
        let mut registry = write(&shared);
        let mut physical_spaces = registry
            .producers
            .find(producer)
            .ok_or(ProducerError::UnknownProducer(producer))?
            .physical_spaces()
            .to_vec();
        physical_spaces.sort();
        physical_spaces.dedup();
        let Registry {
            physical_spaces: spaces_by_id,
            spaces,
            ..
        } = &mut *registry;
        let mut locked = BTreeSet::new();
        let mut unmapped = Vec::new();
        for id in physical_spaces {
            if let Some(space) = spaces_by_id.get_mut(id) {
                space
                    .pool_mut()
                    .evict_pages(spaces, producer, region, max_level, &mut locked, &mut unmapped);
            }
        }
        logwise::trace_sync!(
            "regional flush kept {locked} locked tiles and unmapped {unmapped} entries",
            locked = locked.len(),
            unmapped = unmapped.len()
        );
        self.mapped_tiles_to_produce.extend(locked);
        let mut requested = lock_requests(&self.requested_tiles);
        for mapping in unmapped {
            let (x, y) = morton_xy(mapping.v_address);
            requested.push(encode_page(
                mapping.space.0,
                mapping.v_level,
                x >> mapping.v_level,
                y >> mapping.v_level,
            ));
        }
        Ok(())
    }

    fn flush_all(&mut self, registry: &mut Registry) {
        if self.config.produce_locked_tiles_on_flush {
            for space in registry.physical_spaces.iter() {
                space.pool().get_all_locked_pages(&mut self.mapped_tiles_to_produce);
            }
        }
        let Registry {
            physical_spaces,
            spaces,
            ..
        } = registry;
        for space in physical_spaces.iter_mut() {
            space.pool_mut().evict_all_pages(spaces);
        }
        logwise::info_sync!(
            "flushed caches, {locked} locked tiles to re-produce",
            locked = self.mapped_tiles_to_produce.len()
        );
    }

    // Update

    async fn gather(
        &self,
        shared: &Arc<RwLock<Registry>>,
        pages: UniquePageList,
        frame: u32,
        frame_requested: u32,
    ) -> (RequestList, GatherStats) {
        let params = GatherParameters {
            frame,
            frame_requested,
            flush_count: self.config.flush_count(),
            force_continuous_update: self.config.force_continuous_update,
            verbose: self.config.verbose,
        };
        gather_parallel(
            Arc::clone(shared),
            Arc::new(pages),
            params,
            self.config.gather_tasks(),
            self.config.min_pages_per_gather_task,
            self.config.strategy.clone(),
            self.config.priority,
        )
        .await
    }

    /**
    Runs one frame.

    `feedback` is mapped once, copied and released before analysis.  Returns what happened,
    including the page-table updates the renderer must apply.
    */
    pub async fn update<F: FeedbackReadback + ?Sized>(&mut self, feedback: &mut F) -> UpdateReport {
        let _perf = logwise::perfwarn_begin!("VirtualTextureSystem::update");
        let shared = Arc::clone(&self.registry);
        let mut report = UpdateReport::default();

        let (frame, mut merged) = {
            let mut registry = write(&shared);
            let frame = registry.frame;
            report.frame = frame;
            if std::mem::take(&mut self.flush_requested) {
                self.flush_all(&mut registry);
            }
            self.destroy_pending(&mut registry);
            if registry.allocated_vts.is_empty() {
                self.mapped_tiles_to_produce.clear();
                if feedback.map().is_some() {
                    feedback.unmap();
                }
                report.page_table_updates = registry.spaces.take_updates();
                release_pending_spaces(&mut registry);
                return report;
            }
            for adaptive in registry.adaptive.iter().flatten() {
                adaptive.update_allocations(frame);
            }
            (frame, self.collect_locks(&mut registry))
        };

        let buffer: Option<Arc<[u32]>> = feedback.map().map(Arc::from);
        if buffer.is_some() {
            feedback.unmap();
        }
        let feedback_pages = match buffer {
            Some(buffer) if self.config.enable_feedback => {
                let _perf = logwise::perfwarn_begin!("update feedback");
                FeedbackAnalyzer::new(
                    self.config.feedback_tasks(),
                    self.config.strategy.clone(),
                    self.config.priority,
                )
                .analyze(buffer)
                .await
            }
            _ => UniquePageList::new(),
        };

        let mut explicit_pages = UniquePageList::new();
        for page in std::mem::take(&mut *lock_requests(&self.requested_tiles)) {
            explicit_pages.add(page, u16::MAX);
        }
        report.unique_pages = explicit_pages.len() + feedback_pages.len();

        {
            let _perf = logwise::perfwarn_begin!("update gather");
            if !explicit_pages.is_empty() {
                let (list, stats) = self.gather(&shared, explicit_pages, frame, frame).await;
                merged.merge(list);
                report.page_updates += stats.page_updates;
            }
            let delay = self.config.feedback_frame_delay;
            if frame >= delay && !feedback_pages.is_empty() {
                let (list, stats) = self.gather(&shared, feedback_pages, frame, frame - delay).await;
                merged.merge(list);
                report.page_updates += stats.page_updates;
            }
        }

        if !merged.adaptive_allocations().is_empty() {
            let registry = read(&shared);
            for (index, adaptive) in registry.adaptive.iter().enumerate() {
                let Some(adaptive) = adaptive else {
                    continue;
                };
                let requests: Vec<u32> = merged
                    .adaptive_allocations()
                    .iter()
                    .filter(|(space, _)| space.0 as usize == index)
                    .map(|(_, request)| *request)
                    .collect();
                if !requests.is_empty() {
                    adaptive.queue_allocation_requests(&requests, frame);
                }
            }
        }

        let continuous = {
            let _perf = logwise::perfwarn_begin!("update sort");
            let max_uploads = self.config.max_uploads_per_frame as usize;
            let carry_over = self.mapped_tiles_to_produce.len();
            report.load_requests = merged.loads().len();
            let dropped = merged.sort_and_clamp(max_uploads.saturating_sub(carry_over));
            report.dropped_requests = dropped.len();
            report.load_requests_submitted = merged.loads().len();
            if !dropped.is_empty() {
                logwise::info_sync!(
                    "dropped {dropped} load requests over budget",
                    dropped = dropped.len()
                );
            }
            for load in dropped.iter().filter(|l| l.locked) {
                *self.tiles_to_lock.entry(load.tile).or_insert(0) |= load.group_mask;
            }
            self.sample_continuous_updates(&merged, max_uploads, carry_over)
        };

        let mut registry = write(&shared);
        let mut submission = Submission::default();
        let carry_over = std::mem::take(&mut self.mapped_tiles_to_produce);
        let (produced, deferred) =
            submit::submit_local_tiles(&registry, carry_over, ProduceKind::Refresh, &mut submission);
        report.carry_over_produced = produced;
        self.mapped_tiles_to_produce.extend(deferred);
        let (produced, _) = submit::submit_local_tiles(
            &registry,
            continuous,
            ProduceKind::ContinuousUpdate,
            &mut submission,
        );
        report.continuous_updates_produced = produced;

        self.finish_submission(&mut registry, &merged, true, submission, &mut report);
        release_pending_spaces(&mut registry);
        report
    }

    /// Picks continuous updates at random from the candidates, within the budget left.
    fn sample_continuous_updates(
        &mut self,
        list: &RequestList,
        max_uploads: usize,
        carry_over: usize,
    ) -> BTreeSet<LocalTile> {
        let mut picked = BTreeSet::new();
        let candidates = list.continuous_updates();
        let remaining = max_uploads
            .saturating_sub(carry_over)
            .saturating_sub(list.loads().len());
        if remaining == 0 || candidates.is_empty() {
            return picked;
        }
        let samples = (self.config.max_continuous_updates_per_frame as usize).min(candidates.len());
        for _ in 0..samples {
            if picked.len() >= remaining {
                break;
            }
            let index = self.rng.gen_range(0..candidates.len());
            picked.insert(candidates[index]);
        }
        picked
    }

    fn finish_submission(
        &mut self,
        registry: &mut Registry,
        list: &RequestList,
        asynchronous: bool,
        mut submission: Submission,
        report: &mut UpdateReport,
    ) {
        let _perf = logwise::perfwarn_begin!("update submit");
        let load_slots = submit::submit_requests(
            registry,
            list,
            self.config.max_pages_produced_per_frame,
            asynchronous,
            &mut submission,
        );
        report.mappings_written = submit::apply_mappings(registry, list, &load_slots);
        self.vts_to_map
            .retain(|id| !submit::map_highest_mip(registry, *id));
        for (tile, mask) in std::mem::take(&mut submission.relock) {
            if self.tile_locks.is_locked(&tile) {
                *self.tiles_to_lock.entry(tile).or_insert(0) |= mask;
            }
        }
        report.tiles_produced = submission.tiles_produced;
        report.allocation_failures = submission.allocation_failures;
        submission.finalize();
        report.page_table_updates = registry.spaces.take_updates();
        registry.frame = registry.frame.wrapping_add(1);
    }
}

/// Destroys `id`, unmapping its block.  Returns `false` if it did not exist.
fn destroy(registry: &mut Registry, id: AllocatedVtId) -> bool {
    let Some(vt) = registry.allocated_vts.remove(id) else {
        return false;
    };
    let space = vt.space();
    for (mapping, physical) in registry.spaces.release(space, vt.virtual_address()) {
        if let Some(physical_space) = registry.physical_spaces.get_mut(physical.physical_space) {
            physical_space.pool_mut().forget_mapping(physical.slot, &mapping);
        }
    }
    if registry.spaces.get(space).is_none() {
        registry.adaptive[space.0 as usize] = None;
    }
    true
}

/// Unpins the groups of `tile` that were pinned, that is those not in `pending`.
fn unpin(registry: &mut Registry, tile: LocalTile, pending: u8) {
    let frame = registry.frame;
    let Registry {
        producers,
        physical_spaces,
        ..
    } = registry;
    let Some(producer) = producers.find(tile.producer) else {
        return;
    };
    for group in 0..producer.num_physical_groups() as u8 {
        if pending & (1 << group) != 0 {
            continue;
        }
        let Some(space) = physical_spaces.get_mut(producer.physical_space_for_group(group)) else {
            continue;
        };
        let key = PageKey::new(tile.producer, group, tile.local_address, tile.local_level);
        if let Some(slot) = space.pool().find_page_address(&key) {
            if let Err(e) = space.pool_mut().unlock(frame, slot) {
                logwise::error_sync!(
                    "unlocking {tile}: {error}",
                    tile = logwise::privacy::LogIt(&tile),
                    error = logwise::privacy::LogIt(&e)
                );
            }
        }
    }
}

fn release_pending_spaces(registry: &mut Registry) {
    for id in registry.physical_spaces.release_pending() {
        logwise::trace_sync!("released physical space {id}", id = id.0);
    }
}

/// Mip level at which a texel of `vt` covers about one pixel of `screen_space_size`.
fn level_for_screen_size(vt: &AllocatedVirtualTexture, screen_space_size: (f32, f32)) -> u8 {
    let (sx, sy) = screen_space_size;
    if sx <= 0.0 || sy <= 0.0 {
        return vt.max_level();
    }
    let ppx = (vt.width_in_pixels() as f32 / sx).powi(2);
    let ppy = (vt.height_in_pixels() as f32 / sy).powi(2);
    let level = (0.5 * ppx.max(ppy).log2()).floor();
    level.clamp(0.0, vt.max_level() as f32) as u8
}

fn request_region(
    vt: &AllocatedVirtualTexture,
    screen_space_size: (f32, f32),
    region: TexelRegion,
    mip_level: Option<u8>,
    out: &mut Vec<u32>,
) {
    let region = if region.is_empty() {
        TexelRegion::new(0, 0, vt.width_in_pixels(), vt.height_in_pixels())
    } else {
        TexelRegion::new(
            region.min_x.min(vt.width_in_pixels()),
            region.min_y.min(vt.height_in_pixels()),
            region.max_x.min(vt.width_in_pixels()),
            region.max_y.min(vt.height_in_pixels()),
        )
    };
    //entirely outside the texture
    if region.is_empty() {
        return;
    }
    match mip_level {
        Some(level) => request_level(vt, region, level.min(vt.max_level()), out),
        None => {
            let level = level_for_screen_size(vt, screen_space_size);
            request_level(vt, region, level, out);
            if level < vt.max_level() {
                request_level(vt, region, level + 1, out);
            }
        }
    }
}

fn request_level(vt: &AllocatedVirtualTexture, region: TexelRegion, level: u8, out: &mut Vec<u32>) {
    let tile_size = vt.tile_size().max(1);
    let x0 = (region.min_x >> level) / tile_size;
    let y0 = (region.min_y >> level) / tile_size;
    let x1 = (region.max_x >> level).div_ceil(tile_size).max(x0 + 1);
    let y1 = (region.max_y >> level).div_ceil(tile_size).max(y0 + 1);
    let (vt_x, vt_y) = vt.virtual_page_xy();
    let base_x = vt_x >> level;
    let base_y = vt_y >> level;
    for y in y0..y1 {
        for x in x0..x1 {
            out.push(encode_page(vt.space().0, level, base_x + x, base_y + y));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::feedback::NoFeedback;

    #[test]
    #[cfg(not(target_arch = "wasm32"))]
    fn poisoned_request_queue_keeps_working() {
        let mut system = VirtualTextureSystem::new(Config::default());
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _held = system.requested_tiles.lock().unwrap();
            panic!("poisoning the request queue");
        }));
        assert!(system.requested_tiles.is_poisoned());
        assert_eq!(system.num_pending_requests(), 0);
        system.request_tiles((1.0, 1.0), Some(0));
        assert_eq!(
            test_executors::spin_on(system.load_pending_tiles()),
            UpdateReport::default()
        );
        let report = test_executors::spin_on(system.update(&mut NoFeedback));
        assert_eq!(report.frame, 0);
    }
}
