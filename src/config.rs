// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Operational controls for [`crate::VirtualTextureSystem`].

These are plain values, read once per update.  Changing them between frames is allowed;
nothing caches a derived value across an update.
*/

use crate::Priority;

/// Upper bound on parallel shards for the feedback and gather stages.
pub const MAX_TASKS: usize = 16;

/// Capacity of one [`crate::cache::page_update_buffer::PageUpdateBuffer`].
pub const PAGE_UPDATE_BUFFER_CAPACITY: usize = 128;

/**
Controls which slots [`crate::cache::page_pool::PagePool::alloc`] may reuse.

A slot whose recency stamp is within `reuse_hysteresis_frames` of the current frame is
not evictable.  With the default of 1, a tile touched or allocated this frame cannot be
evicted this frame, which keeps one update from evicting a tile another request in the same
update just asked for.  0 disables the window for touched tiles; a tile allocated this
frame is still never evicted this frame.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub reuse_hysteresis_frames: u32,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy {
            reuse_hysteresis_frames: 1,
        }
    }
}

impl EvictionPolicy {
    /// Whether a slot last used at `stamp` may be evicted at `frame`.
    pub fn evictable(&self, stamp: u32, frame: u32) -> bool {
        stamp.saturating_add(self.reuse_hysteresis_frames) <= frame
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Load requests admitted per update, including tiles carried over from earlier frames.
    pub max_uploads_per_frame: u32,
    /// Slots allocated per update for unlocked loads.  Locked and synchronous loads are exempt.
    pub max_pages_produced_per_frame: u32,
    /// Continuous-update tiles sampled per update from the remaining budget.
    pub max_continuous_updates_per_frame: u32,
    /// Treat every resident tile as needing a continuous update.
    pub force_continuous_update: bool,
    /// Whether GPU feedback is read at all.  Explicit requests still work when disabled.
    pub enable_feedback: bool,
    /// On a full flush, re-produce locked tiles in place rather than leaving stale content.
    pub produce_locked_tiles_on_flush: bool,
    pub num_feedback_tasks: usize,
    pub num_gather_tasks: usize,
    /// Gather shards are only split off when each gets at least this many pages.
    pub min_pages_per_gather_task: usize,
    /// Pending recency touches at which a gather shard tries (without blocking) to flush.
    pub page_update_flush_count: usize,
    /// Age of the feedback relative to the current frame.  Textures allocated after the
    /// feedback frame ignore it.
    pub feedback_frame_delay: u32,
    pub eviction: EvictionPolicy,
    pub strategy: vec_parallel::Strategy,
    pub priority: Priority,
    pub random_seed: u64,
    /// Log every page decision.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_uploads_per_frame: 64,
            max_pages_produced_per_frame: 64,
            max_continuous_updates_per_frame: 2,
            force_continuous_update: false,
            enable_feedback: true,
            produce_locked_tiles_on_flush: true,
            num_feedback_tasks: 4,
            num_gather_tasks: 4,
            min_pages_per_gather_task: 64,
            page_update_flush_count: 8,
            feedback_frame_delay: 3,
            eviction: EvictionPolicy::default(),
            strategy: vec_parallel::Strategy::One,
            priority: Priority::UserInitiated,
            random_seed: 0x5EED,
            verbose: false,
        }
    }
}

impl Config {
    pub(crate) fn feedback_tasks(&self) -> usize {
        self.num_feedback_tasks.clamp(1, MAX_TASKS)
    }
    pub(crate) fn gather_tasks(&self) -> usize {
        self.num_gather_tasks.clamp(1, MAX_TASKS)
    }
    pub(crate) fn flush_count(&self) -> usize {
        self.page_update_flush_count
            .clamp(1, PAGE_UPDATE_BUFFER_CAPACITY)
    }
}
