// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The submission stage: allocating slots, calling producers, writing page tables.

Runs on the submission thread under the registry's write guard.
*/

use std::sync::Arc;

use crate::bittricks::morton_address;
use crate::cache::page_pool::PageKey;
use crate::cache::physical_space::PhysicalSpace;
use crate::producer::{
    Finalizer, ProduceKind, ProduceTarget, RegisteredProducer, RequestPageResult, RequestPriority,
};
use crate::requests::request_list::RequestList;
use crate::space::allocated_vt::AllocatedVtId;
use crate::system::registry::Registry;
use crate::tile::{LocalTile, MAX_LAYERS, PageMapping, PhysicalAddress};

/// Slots allocated for one load, by group.
pub(crate) type LoadSlots = [Option<u32>; MAX_LAYERS];

/// What one update's submission did.
#[derive(Default)]
pub(crate) struct Submission {
    finalizers: Vec<Arc<dyn Finalizer>>,
    pub(crate) tiles_produced: u32,
    pub(crate) allocation_failures: u32,
    /// Locked loads that did not complete, with the groups still to pin.
    pub(crate) relock: Vec<(LocalTile, u8)>,
}

impl Submission {
    fn add_finalizer(&mut self, finalizer: Option<Arc<dyn Finalizer>>) {
        let Some(finalizer) = finalizer else {
            return;
        };
        let ptr = Arc::as_ptr(&finalizer) as *const ();
        if !self
            .finalizers
            .iter()
            .any(|f| Arc::as_ptr(f) as *const () == ptr)
        {
            self.finalizers.push(finalizer);
        }
    }

    /// Runs every distinct finalizer once.
    pub(crate) fn finalize(self) {
        for finalizer in &self.finalizers {
            finalizer.finalize();
        }
    }
}

/// Fills the targets of the texture layers in `group` with `slot`.
fn fill_targets(
    producer: &RegisteredProducer,
    space: &PhysicalSpace,
    group: u8,
    slot: u32,
    targets: &mut [Option<ProduceTarget>],
) {
    let mut texture_index = 0u8;
    for (layer, target) in targets.iter_mut().enumerate() {
        if producer.group_for_layer(layer) == group {
            *target = Some(ProduceTarget {
                physical_space: space.id(),
                texture_index,
                slot,
                location: space.location(slot),
                tile_size_with_border: space.tile_size_with_border(),
            });
            texture_index += 1;
        }
    }
}

/**
Re-produces tiles that are already resident, in place.

Only groups that are resident get targets.  Tiles whose producer is not ready are returned
so the caller can try again next update.
*/
pub(crate) fn submit_local_tiles(
    registry: &Registry,
    tiles: impl IntoIterator<Item = LocalTile>,
    kind: ProduceKind,
    submission: &mut Submission,
) -> (u32, Vec<LocalTile>) {
    let mut produced = 0;
    let mut deferred = Vec::new();
    for tile in tiles {
        let Some(producer) = registry.producers.find(tile.producer) else {
            continue;
        };
        let mut targets = vec![None; producer.num_texture_layers()];
        let mut group_mask = 0u8;
        for group in 0..producer.num_physical_groups() as u8 {
            let Some(space) = registry
                .physical_spaces
                .get(producer.physical_space_for_group(group))
            else {
                continue;
            };
            let key = PageKey::new(tile.producer, group, tile.local_address, tile.local_level);
            if let Some(slot) = space.pool().find_page_address(&key) {
                group_mask |= 1 << group;
                fill_targets(producer, space, group, slot, &mut targets);
            }
        }
        let layer_mask = producer.layer_mask_for_groups(group_mask);
        if layer_mask == 0 {
            continue;
        }
        match producer.producer().request_page_data(
            tile.producer,
            layer_mask,
            tile.local_level,
            tile.local_address,
            RequestPriority::High,
        ) {
            RequestPageResult::Available(request) => {
                let finalizer = producer.producer().produce_page_data(
                    kind,
                    tile.producer,
                    layer_mask,
                    tile.local_level,
                    tile.local_address,
                    request,
                    &targets,
                );
                submission.add_finalizer(finalizer);
                produced += 1;
            }
            RequestPageResult::Pending => deferred.push(tile),
            RequestPageResult::Invalid => {
                logwise::info_sync!(
                    "producer refused to refresh {tile}",
                    tile = logwise::privacy::LogIt(&tile)
                );
            }
        }
    }
    (produced, deferred)
}

/**
Services load requests in list order.

A locked or synchronous load is produced even if its producer reports it pending.  Other
loads stop being produced once `max_pages_produced` have been.  A load whose slots cannot
all be allocated releases what it took and waits for a later update.
*/
pub(crate) fn submit_requests(
    registry: &mut Registry,
    list: &RequestList,
    max_pages_produced: u32,
    asynchronous: bool,
    submission: &mut Submission,
) -> Vec<LoadSlots> {
    let frame = registry.frame;
    let Registry {
        producers,
        physical_spaces,
        spaces,
        ..
    } = registry;
    let mut load_slots = vec![[None; MAX_LAYERS]; list.loads().len()];
    let mut produced = 0u32;

    for (index, load) in list.loads().iter().enumerate() {
        let tile = load.tile;
        let Some(producer) = producers.find(tile.producer) else {
            continue;
        };
        let lock = load.locked;
        let force = lock || !asynchronous;
        let layer_mask = producer.layer_mask_for_groups(load.group_mask);
        let priority = if lock {
            RequestPriority::High
        } else {
            RequestPriority::Normal
        };
        let mut result = producer.producer().request_page_data(
            tile.producer,
            layer_mask,
            tile.local_level,
            tile.local_address,
            priority,
        );
        if force && matches!(result, RequestPageResult::Pending) {
            result = RequestPageResult::Available(0);
        }
        if !force && produced >= max_pages_produced && matches!(result, RequestPageResult::Available(_)) {
            result = RequestPageResult::Pending;
        }

        let mut loaded = false;
        match result {
            RequestPageResult::Invalid => {
                logwise::info_sync!(
                    "producer refused {tile}",
                    tile = logwise::privacy::LogIt(&tile)
                );
            }
            RequestPageResult::Pending => {}
            RequestPageResult::Available(request) => {
                let mut targets = vec![None; producer.num_texture_layers()];
                let mut allocated: LoadSlots = [None; MAX_LAYERS];
                let mut newly_allocated: LoadSlots = [None; MAX_LAYERS];
                let mut failed = false;
                for group in 0..producer.num_physical_groups() as u8 {
                    if load.group_mask & (1 << group) == 0 {
                        continue;
                    }
                    let Some(space) = physical_spaces.get_mut(producer.physical_space_for_group(group)) else {
                        failed = true;
                        break;
                    };
                    if !space.pool().any_free_available(frame) {
                        if space.note_allocation_failure() {
                            logwise::warn_sync!(
                                "physical space {space} is full of locked or recently used tiles",
                                space = space.id().0
                            );
                        }
                        submission.allocation_failures += 1;
                        failed = true;
                        break;
                    }
                    let key = PageKey::new(tile.producer, group, tile.local_address, tile.local_level);
                    let was_resident = space.pool().find_page_address(&key).is_some();
                    match space.pool_mut().alloc(spaces, frame, key, lock) {
                        Ok(slot) => {
                            space.note_allocation_success();
                            allocated[group as usize] = Some(slot);
                            if !was_resident {
                                newly_allocated[group as usize] = Some(slot);
                            }
                            fill_targets(producer, space, group, slot, &mut targets);
                        }
                        Err(e) => {
                            logwise::warn_sync!(
                                "allocation failed: {error}",
                                error = logwise::privacy::LogIt(&e)
                            );
                            submission.allocation_failures += 1;
                            failed = true;
                            break;
                        }
                    }
                }

                if failed {
                    for (group, slot) in allocated.iter().enumerate() {
                        let Some(slot) = *slot else {
                            continue;
                        };
                        let Some(space) = physical_spaces.get_mut(producer.physical_space_for_group(group as u8)) else {
                            continue;
                        };
                        if lock {
                            if let Err(e) = space.pool_mut().unlock(frame, slot) {
                                logwise::warn_sync!(
                                    "rolling back {tile}: {error}",
                                    tile = logwise::privacy::LogIt(&tile),
                                    error = logwise::privacy::LogIt(&e)
                                );
                            }
                        }
                        if newly_allocated[group].is_some() {
                            if let Err(e) = space.pool_mut().free(spaces, slot) {
                                logwise::warn_sync!(
                                    "rolling back {tile}: {error}",
                                    tile = logwise::privacy::LogIt(&tile),
                                    error = logwise::privacy::LogIt(&e)
                                );
                            }
                        }
                    }
                } else {
                    for group in 0..producer.num_physical_groups() as u8 {
                        if load.group_mask & (1 << group) != 0 {
                            continue;
                        }
                        let Some(space) = physical_spaces.get(producer.physical_space_for_group(group)) else {
                            continue;
                        };
                        let key = PageKey::new(tile.producer, group, tile.local_address, tile.local_level);
                        if let Some(slot) = space.pool().find_page_address(&key) {
                            fill_targets(producer, space, group, slot, &mut targets);
                        }
                    }
                    let finalizer = producer.producer().produce_page_data(
                        ProduceKind::Load,
                        tile.producer,
                        producer.layer_mask_for_groups(load.group_mask),
                        tile.local_level,
                        tile.local_address,
                        request,
                        &targets,
                    );
                    submission.add_finalizer(finalizer);
                    submission.tiles_produced += 1;
                    load_slots[index] = allocated;
                    produced += 1;
                    loaded = true;
                }
            }
        }
        if lock && !loaded {
            submission.relock.push((tile, load.group_mask));
        }
    }
    load_slots
}

/**
Writes the page-table entries of a submitted list.

Mappings whose slot no longer holds the expected tile are dropped, as are mapping requests
of loads that were not produced.
*/
pub(crate) fn apply_mappings(registry: &mut Registry, list: &RequestList, load_slots: &[LoadSlots]) -> u32 {
    let mut mapped = 0;
    for direct in list.direct_mappings() {
        let holds_expected = registry
            .pool(direct.physical.physical_space)
            .and_then(|p| p.key(direct.physical.slot))
            == Some(direct.expected);
        if holds_expected && registry.map_page_or_log(direct.physical, direct.mapping, direct.mapped_level) {
            mapped += 1;
        }
    }
    for request in list.mappings() {
        let load = &list.loads()[request.load_index as usize];
        let Some(slot) = load_slots[request.load_index as usize][request.group as usize] else {
            continue;
        };
        let Some(physical_space) = registry
            .producers
            .find(load.tile.producer)
            .map(|p| p.physical_space_for_group(request.group))
        else {
            continue;
        };
        let key = PageKey::new(
            load.tile.producer,
            request.group,
            load.tile.local_address,
            load.tile.local_level,
        );
        if registry.pool(physical_space).and_then(|p| p.key(slot)) != Some(key) {
            logwise::warn_sync!(
                "slot {slot} no longer holds {tile}, dropping its mapping",
                slot = slot,
                tile = logwise::privacy::LogIt(&load.tile)
            );
            continue;
        }
        let physical = PhysicalAddress {
            physical_space,
            slot,
        };
        if registry.map_page_or_log(physical, request.mapping, request.mapped_level) {
            mapped += 1;
        }
    }
    mapped
}

/**
Maps the coarsest level of a texture whose producers keep it resident.

Returns `true` once every page-table layer has its coarsest level fully mapped, or the
texture is gone.
*/
pub(crate) fn map_highest_mip(registry: &mut Registry, id: AllocatedVtId) -> bool {
    let Some(vt) = registry.allocated_vts.get(id) else {
        return true;
    };
    let Some(space) = registry.spaces.get(vt.space()) else {
        return true;
    };
    let (base_x, base_y) = vt.virtual_page_xy();
    let mut to_map = Vec::new();
    let mut done = true;
    for layer in 0..vt.num_page_table_layers() {
        let route = vt.route(layer);
        let unique = vt.unique_producers()[route.producer_index as usize];
        let (Some(producer), Some(pool)) = (
            registry.producers.find(unique.handle),
            registry.pool(route.physical_space),
        ) else {
            done = false;
            continue;
        };
        let local_level = producer
            .max_level()
            .min(vt.max_level().saturating_sub(unique.mip_bias));
        let v_level = local_level + unique.mip_bias;
        let width = producer.width_in_tiles().div_ceil(1 << local_level);
        let height = producer.height_in_tiles().div_ceil(1 << local_level);
        for y in 0..height {
            for x in 0..width {
                let v_address = morton_address(base_x + (x << v_level), base_y + (y << v_level));
                if space.page_map(layer).find(v_level, v_address).is_some() {
                    continue;
                }
                let key = PageKey::new(unique.handle, route.group, morton_address(x, y), local_level);
                match pool.find_page_address(&key) {
                    Some(slot) => to_map.push((
                        PhysicalAddress {
                            physical_space: route.physical_space,
                            slot,
                        },
                        PageMapping {
                            space: vt.space(),
                            page_table_layer: layer as u8,
                            v_level,
                            v_address,
                        },
                        v_level,
                    )),
                    None => done = false,
                }
            }
        }
    }
    for (physical, mapping, mapped_level) in to_map {
        if !registry.map_page_or_log(physical, mapping, mapped_level) {
            done = false;
        }
    }
    done
}
