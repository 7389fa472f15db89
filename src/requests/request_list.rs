// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The work of one update.

A [`RequestList`] collects:

* load requests: produce a producer-local tile into newly allocated slots, one per physical
  group in the request's mask;
* mapping requests: page-table entries to write for a load once its slots exist;
* direct mapping requests: page-table entries for tiles that are already resident;
* continuous update requests: resident tiles to re-produce if bandwidth is left over;
* adaptive allocation requests: opaque values for an adaptive virtual texture.

Every kind is de-duplicated on insertion.  Lists built by separate gather shards are
combined with [`RequestList::merge`].
*/

use std::collections::{HashMap, HashSet};

use crate::cache::page_pool::PageKey;
use crate::tile::{LocalTile, PageMapping, PhysicalAddress, SpaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRequest {
    pub tile: LocalTile,
    pub group_mask: u8,
    pub count: u16,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingRequest {
    pub load_index: u32,
    pub group: u8,
    pub mapping: PageMapping,
    pub mapped_level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectMappingRequest {
    pub mapping: PageMapping,
    pub mapped_level: u8,
    pub physical: PhysicalAddress,
    /// What the slot held when the request was made.  If the slot was reused since, the
    /// request is dropped.
    pub expected: PageKey,
}

#[derive(Debug, Default)]
pub struct RequestList {
    loads: Vec<LoadRequest>,
    load_index: HashMap<(LocalTile, u8), u32>,
    mappings: Vec<MappingRequest>,
    mapping_set: HashSet<MappingRequest>,
    direct_mappings: Vec<DirectMappingRequest>,
    direct_mapping_set: HashSet<DirectMappingRequest>,
    continuous_updates: Vec<LocalTile>,
    continuous_update_set: HashSet<LocalTile>,
    adaptive_allocations: Vec<(SpaceId, u32)>,
}

impl RequestList {
    pub fn new() -> Self {
        Self::default()
    }

    /**
    Adds a load, or adds `count` to the existing load with the same tile and group mask.
    Returns the load's index.
    */
    pub fn add_load_request(&mut self, tile: LocalTile, group_mask: u8, count: u16) -> u32 {
        self.add_load(LoadRequest {
            tile,
            group_mask,
            count,
            locked: false,
        })
    }

    /// Adds a load that pins its slots once produced.  Locked loads sort first.
    pub fn lock_load_request(&mut self, tile: LocalTile, group_mask: u8) -> u32 {
        self.add_load(LoadRequest {
            tile,
            group_mask,
            count: u16::MAX,
            locked: true,
        })
    }

    fn add_load(&mut self, request: LoadRequest) -> u32 {
        let key = (request.tile, request.group_mask);
        if let Some(&index) = self.load_index.get(&key) {
            let existing = &mut self.loads[index as usize];
            existing.count = existing.count.saturating_add(request.count);
            existing.locked |= request.locked;
            return index;
        }
        let index = self.loads.len() as u32;
        self.loads.push(request);
        self.load_index.insert(key, index);
        index
    }

    pub fn add_mapping_request(&mut self, request: MappingRequest) {
        debug_assert!((request.load_index as usize) < self.loads.len());
        if self.mapping_set.insert(request) {
            self.mappings.push(request);
        }
    }

    pub fn add_direct_mapping_request(&mut self, request: DirectMappingRequest) {
        if self.direct_mapping_set.insert(request) {
            self.direct_mappings.push(request);
        }
    }

    pub fn add_continuous_update_request(&mut self, tile: LocalTile) {
        if self.continuous_update_set.insert(tile) {
            self.continuous_updates.push(tile);
        }
    }

    pub fn add_adaptive_allocation_request(&mut self, space: SpaceId, request: u32) {
        if !self.adaptive_allocations.contains(&(space, request)) {
            self.adaptive_allocations.push((space, request));
        }
    }

    /// Appends `other`, collapsing duplicates.  Mapping requests follow their loads.
    pub fn merge(&mut self, other: RequestList) {
        let remap: Vec<u32> = other.loads.iter().map(|l| self.add_load(*l)).collect();
        for mut request in other.mappings {
            request.load_index = remap[request.load_index as usize];
            self.add_mapping_request(request);
        }
        for request in other.direct_mappings {
            self.add_direct_mapping_request(request);
        }
        for tile in other.continuous_updates {
            self.add_continuous_update_request(tile);
        }
        for (space, request) in other.adaptive_allocations {
            self.add_adaptive_allocation_request(space, request);
        }
    }

    /**
    Orders loads by priority and keeps at most `max_loads`.

    Locked loads come first, then higher counts; equal loads keep their insertion order.
    Mapping requests of dropped loads are dropped with them.  Returns the dropped loads.
    */
    pub fn sort_and_clamp(&mut self, max_loads: usize) -> Vec<LoadRequest> {
        let mut order: Vec<u32> = (0..self.loads.len() as u32).collect();
        order.sort_by(|a, b| {
            let a = &self.loads[*a as usize];
            let b = &self.loads[*b as usize];
            b.locked.cmp(&a.locked).then(b.count.cmp(&a.count))
        });
        let mut new_index = vec![None; self.loads.len()];
        let mut kept = Vec::with_capacity(order.len().min(max_loads));
        let mut dropped = Vec::new();
        for (rank, old) in order.into_iter().enumerate() {
            let request = self.loads[old as usize];
            if rank < max_loads {
                new_index[old as usize] = Some(kept.len() as u32);
                kept.push(request);
            } else {
                dropped.push(request);
            }
        }
        self.loads = kept;
        self.load_index = self
            .loads
            .iter()
            .enumerate()
            .map(|(i, l)| ((l.tile, l.group_mask), i as u32))
            .collect();
        let mappings = std::mem::take(&mut self.mappings);
        self.mapping_set.clear();
        for mut request in mappings {
            if let Some(index) = new_index[request.load_index as usize] {
                request.load_index = index;
                self.mapping_set.insert(request);
                self.mappings.push(request);
            }
        }
        dropped
    }

    pub fn loads(&self) -> &[LoadRequest] {
        &self.loads
    }
    pub fn mappings(&self) -> &[MappingRequest] {
        &self.mappings
    }
    pub fn direct_mappings(&self) -> &[DirectMappingRequest] {
        &self.direct_mappings
    }
    pub fn continuous_updates(&self) -> &[LocalTile] {
        &self.continuous_updates
    }
    pub fn adaptive_allocations(&self) -> &[(SpaceId, u32)] {
        &self.adaptive_allocations
    }
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
            && self.mappings.is_empty()
            && self.direct_mappings.is_empty()
            && self.continuous_updates.is_empty()
            && self.adaptive_allocations.is_empty()
    }
}
