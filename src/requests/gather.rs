// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Turning requested pages into work.

For each unique page the gatherer finds which page-table layers are not mapped, which
producers back them, and what is already resident.  Resident tiles are touched through a
[`PageUpdateBuffer`]; a coarser resident tile becomes a direct mapping so something is shown
immediately; a tile that is not resident becomes a load request together with the mapping
requests to apply once it is produced.  When the nearest resident ancestor is more than two
levels coarser, an intermediate level is requested as well.

Shards run against disjoint ranges of a [`UniquePageList`] under a read guard of the
registry.  Nothing here mutates slots.
*/

use std::ops::Range;
use std::sync::{Arc, RwLock};

use some_executor::hint::Hint;

use crate::Priority;
use crate::bittricks::{decode_page, morton_address};
use crate::cache::page_pool::PageKey;
use crate::cache::page_update_buffer::PageUpdateBuffer;
use crate::requests::request_list::{DirectMappingRequest, MappingRequest, RequestList};
use crate::requests::unique_page_list::UniquePageList;
use crate::system::registry::Registry;
use crate::tile::{LocalTile, MAX_LAYERS, MAX_LEVEL, PageMapping, PhysicalAddress, SpaceId};

/// How far below the nearest resident ancestor the prefetch level sits.
const PREFETCH_DISTANCE: u8 = 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct GatherParameters {
    /// Stamp for recency touches.
    pub(crate) frame: u32,
    /// Frame the requests were generated in.  Textures allocated later ignore them.
    pub(crate) frame_requested: u32,
    pub(crate) flush_count: usize,
    pub(crate) force_continuous_update: bool,
    pub(crate) verbose: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GatherStats {
    pub(crate) page_updates: u32,
    pub(crate) working_set: u32,
}

impl GatherStats {
    fn add(&mut self, other: GatherStats) {
        self.page_updates += other.page_updates;
        self.working_set += other.working_set;
    }
}

/// Level-0 address of the page containing `address` at `level`.
fn align_to_level(address: u32, level: u8) -> u32 {
    let shift = level as u32 * 2;
    if shift >= 32 {
        0
    } else {
        address & (u32::MAX << shift)
    }
}

struct Touches<'a> {
    registry: &'a Registry,
    buffers: Vec<PageUpdateBuffer>,
    frame: u32,
    flush_count: usize,
}

impl<'a> Touches<'a> {
    fn new(registry: &'a Registry, params: &GatherParameters) -> Self {
        Touches {
            registry,
            buffers: (0..registry.physical_spaces.id_bound())
                .map(|_| PageUpdateBuffer::new())
                .collect(),
            frame: params.frame,
            flush_count: params.flush_count,
        }
    }

    fn touch(&mut self, physical: PhysicalAddress) {
        let index = physical.physical_space.0 as usize;
        if let (Some(pool), Some(buffer)) = (
            self.registry.pool(physical.physical_space),
            self.buffers.get_mut(index),
        ) {
            buffer.add(pool, self.frame, self.flush_count, physical.slot);
        }
    }

    fn working_set(&mut self, physical: PhysicalAddress) {
        if let Some(buffer) = self.buffers.get_mut(physical.physical_space.0 as usize) {
            buffer.add_working_set(1);
        }
    }

    fn finish(mut self) -> GatherStats {
        let mut stats = GatherStats::default();
        for space in self.registry.physical_spaces.iter() {
            if let Some(buffer) = self.buffers.get_mut(space.id().0 as usize) {
                buffer.flush(space.pool(), self.frame);
                stats.page_updates += buffer.num_page_updates();
                stats.working_set += buffer.working_set_size();
            }
        }
        stats
    }
}

/// Gathers the pages in `range` of `pages`.
pub(crate) fn gather_requests(
    registry: &Registry,
    pages: &UniquePageList,
    range: Range<usize>,
    params: &GatherParameters,
) -> (RequestList, GatherStats) {
    let mut list = RequestList::new();
    let mut touches = Touches::new(registry, params);

    for i in range {
        let count = pages.count(i);
        let page = decode_page(pages.page(i));
        let space_id = SpaceId(page.space);
        let Some(space) = registry.spaces.get(space_id) else {
            continue;
        };
        let v_level = page.level;
        let v_address = page.address();

        if page.level_plus_one <= 1 {
            if let Some(adaptive) = registry.adaptive(space_id) {
                if let Some(request) =
                    adaptive.packed_allocation_request(v_address, page.level_plus_one, params.frame)
                {
                    list.add_adaptive_allocation_request(space_id, request);
                }
            }
        }

        let mut layers_to_load = [false; MAX_LAYERS];
        let mut any_to_load = false;
        for layer in 0..space.num_page_table_layers() {
            match space.page_map(layer).find(v_level, v_address) {
                Some(physical) => {
                    touches.touch(physical);
                    let continuous = params.force_continuous_update
                        || registry
                            .physical_spaces
                            .get(physical.physical_space)
                            .is_some_and(|s| s.description().continuous_update);
                    if continuous {
                        if let Some(tile) = registry
                            .pool(physical.physical_space)
                            .and_then(|p| p.local_tile(physical.slot))
                        {
                            list.add_continuous_update_request(tile);
                        }
                    }
                }
                None => {
                    layers_to_load[layer] = true;
                    any_to_load = true;
                }
            }
        }
        if !any_to_load {
            continue;
        }

        let Some(vt) = registry.find_vt(space_id, v_address) else {
            if params.verbose {
                logwise::debuginternal_sync!(
                    "no texture at space {space} address {address}",
                    space = page.space,
                    address = v_address
                );
            }
            continue;
        };
        if vt.frame_allocated() > params.frame_requested {
            if params.verbose {
                logwise::debuginternal_sync!(
                    "stale request for space {space} address {address}",
                    space = page.space,
                    address = v_address
                );
            }
            continue;
        }
        if v_level > vt.max_level() {
            continue;
        }

        let mut groups_to_load = [0u8; MAX_LAYERS];
        for (layer, _) in layers_to_load.iter().enumerate().filter(|(_, l)| **l) {
            let route = vt.route(layer);
            groups_to_load[route.producer_index as usize] |= 1 << route.group;
        }

        let (vt_x, vt_y) = vt.virtual_page_xy();
        for (producer_index, unique) in vt.unique_producers().iter().enumerate() {
            let mut group_mask = groups_to_load[producer_index];
            if group_mask == 0 {
                continue;
            }
            let Some(producer) = registry.producers.find(unique.handle) else {
                continue;
            };
            let bias = unique.mip_bias;
            let max_level = producer.max_level().min(vt.max_level());
            let mut mapping_level = v_level.max(bias);
            let mut local_level = v_level - v_level.min(bias);

            let wrap_width = producer.width_in_tiles() << bias;
            let wrap_height = producer.height_in_tiles() << bias;
            let mut local_x = page.x - vt_x;
            let mut local_y = page.y - vt_y;
            let mut wrapped = v_address;
            if local_x >= wrap_width || local_y >= wrap_height {
                local_x %= wrap_width;
                local_y %= wrap_height;
                wrapped = morton_address(local_x + vt_x, local_y + vt_y);
            }
            let mut local_address = (wrapped - vt.virtual_address()) >> (mapping_level as u32 * 2);

            let local_bias = producer
                .producer()
                .local_mip_bias(local_level, local_address);
            if local_bias > 0 {
                local_level += local_bias;
                local_address >>= local_bias as u32 * 2;
                mapping_level = v_level.max(local_bias + bias);
            }
            if local_level > max_level {
                continue;
            }

            let layers_for_group = |group: u8| {
                (0..vt.num_page_table_layers()).filter(move |layer| {
                    let route = vt.route(*layer);
                    layers_to_load[*layer]
                        && route.producer_index as usize == producer_index
                        && route.group == group
                })
            };

            let mut prefetch_masks = [0u8; MAX_LEVEL as usize + 2];
            let mut max_prefetch_level = local_level;
            for group in 0..producer.num_physical_groups() as u8 {
                if group_mask & (1 << group) == 0 {
                    continue;
                }
                let physical_space = producer.physical_space_for_group(group);
                let Some(pool) = registry.pool(physical_space) else {
                    continue;
                };
                let key = PageKey::new(unique.handle, group, local_address, local_level);
                let mut allocated_local_level = max_level + 1;
                if let Some((slot, found_level)) = pool.find_nearest_page_address(&key, max_level) {
                    allocated_local_level = found_level;
                    let physical = PhysicalAddress {
                        physical_space,
                        slot,
                    };
                    touches.touch(physical);
                    let allocated_v_level = found_level + bias;
                    let allocated_v_address = align_to_level(wrapped, allocated_v_level);
                    if let Some(expected) = pool.key(slot) {
                        for layer in layers_for_group(group) {
                            touches.working_set(physical);
                            let mapping = PageMapping {
                                space: space_id,
                                page_table_layer: layer as u8,
                                v_level: allocated_v_level,
                                v_address: allocated_v_address,
                            };
                            match space.page_map(layer).find(allocated_v_level, allocated_v_address) {
                                None => list.add_direct_mapping_request(DirectMappingRequest {
                                    mapping,
                                    mapped_level: allocated_v_level,
                                    physical,
                                    expected,
                                }),
                                Some(existing) if existing != physical => {
                                    logwise::error_sync!(
                                        "page {mapping} is mapped to {existing}, not its resident tile {physical}",
                                        mapping = logwise::privacy::LogIt(&mapping),
                                        existing = logwise::privacy::LogIt(&existing),
                                        physical = logwise::privacy::LogIt(&physical)
                                    );
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }

                if allocated_local_level == local_level {
                    group_mask &= !(1 << group);
                } else {
                    let prefetch_level = (allocated_local_level
                        - allocated_local_level.min(PREFETCH_DISTANCE))
                    .min(vt.max_level().saturating_sub(bias));
                    if prefetch_level > local_level {
                        prefetch_masks[prefetch_level as usize] |= 1 << group;
                        max_prefetch_level = max_prefetch_level.max(prefetch_level);
                    }
                }
            }

            for prefetch_level in local_level + 1..=max_prefetch_level {
                let mut mask = prefetch_masks[prefetch_level as usize];
                if mask == 0 {
                    continue;
                }
                let prefetch_address = local_address >> ((prefetch_level - local_level) as u32 * 2);
                for group in 0..producer.num_physical_groups() as u8 {
                    if mask & (1 << group) != 0 {
                        continue;
                    }
                    let physical_space = producer.physical_space_for_group(group);
                    let Some(pool) = registry.pool(physical_space) else {
                        continue;
                    };
                    let key = PageKey::new(unique.handle, group, prefetch_address, prefetch_level);
                    match pool.find_page_address(&key) {
                        Some(slot) => touches.touch(PhysicalAddress {
                            physical_space,
                            slot,
                        }),
                        None => mask |= 1 << group,
                    }
                }
                let tile = LocalTile::new(unique.handle, prefetch_address, prefetch_level);
                let load_index = list.add_load_request(tile, mask, count);
                let prefetch_v_level = prefetch_level + bias;
                let prefetch_v_address = align_to_level(wrapped, prefetch_v_level);
                for group in 0..producer.num_physical_groups() as u8 {
                    if mask & (1 << group) == 0 {
                        continue;
                    }
                    for layer in layers_for_group(group) {
                        list.add_mapping_request(MappingRequest {
                            load_index,
                            group,
                            mapping: PageMapping {
                                space: space_id,
                                page_table_layer: layer as u8,
                                v_level: prefetch_v_level,
                                v_address: prefetch_v_address,
                            },
                            mapped_level: prefetch_v_level.max(bias),
                        });
                    }
                }
            }

            if group_mask != 0 {
                let tile = LocalTile::new(unique.handle, local_address, local_level);
                let load_index = list.add_load_request(tile, group_mask, count);
                for group in 0..producer.num_physical_groups() as u8 {
                    if group_mask & (1 << group) == 0 {
                        continue;
                    }
                    for layer in layers_for_group(group) {
                        list.add_mapping_request(MappingRequest {
                            load_index,
                            group,
                            mapping: PageMapping {
                                space: space_id,
                                page_table_layer: layer as u8,
                                v_level,
                                v_address: wrapped,
                            },
                            mapped_level: mapping_level,
                        });
                    }
                }
                if params.verbose {
                    logwise::debuginternal_sync!(
                        "load producer {producer} address {address} level {level} groups {mask}",
                        producer = unique.handle.index(),
                        address = local_address,
                        level = local_level,
                        mask = group_mask
                    );
                }
            }
        }
    }

    let stats = touches.finish();
    (list, stats)
}

/**
Gathers `pages` in parallel shards and merges the shards in order.

Each shard gets at least `min_pages_per_task` pages, so small lists run as one shard.
*/
#[allow(clippy::too_many_arguments)]
pub(crate) async fn gather_parallel(
    registry: Arc<RwLock<Registry>>,
    pages: Arc<UniquePageList>,
    params: GatherParameters,
    tasks: usize,
    min_pages_per_task: usize,
    strategy: vec_parallel::Strategy,
    priority: Priority,
) -> (RequestList, GatherStats) {
    let len = pages.len();
    if len == 0 {
        return (RequestList::new(), GatherStats::default());
    }
    let per_task = len.div_ceil(tasks.max(1)).max(min_pages_per_task).max(1);
    let shards = len.div_ceil(per_task);
    logwise::trace_sync!(
        "gathering {len} pages in {shards} shards",
        len = len,
        shards = shards
    );
    let build = vec_parallel::build_vec(shards, strategy, move |shard| {
        let start = shard * per_task;
        let end = (start + per_task).min(pages.len());
        let registry = registry.read().unwrap_or_else(|e| e.into_inner());
        gather_requests(&registry, &pages, start..end, &params)
    });
    let mut executor = some_executor::current_executor::current_executor();
    let perf = logwise::perfwarn_begin!("gather_parallel join");
    let results = build.spawn_on(&mut executor, priority, Hint::CPU).await;
    drop(perf);
    let mut merged = RequestList::new();
    let mut stats = GatherStats::default();
    for (list, shard_stats) in results {
        merged.merge(list);
        stats.add(shard_stats);
    }
    (merged, stats)
}
