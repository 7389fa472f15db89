// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Physical spaces: one bounded cache each.

Producers whose physical groups have identical descriptions share a physical space.  The
space itself does not own GPU memory; it hands out slot locations that the external resource
owner translates into texture offsets.
*/

use crate::bittricks::ceil_log2;
use crate::cache::page_pool::PagePool;
use crate::config::EvictionPolicy;
use crate::tile::PhysicalSpaceId;

/// An opaque pixel format id.  Only compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerFormat(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalSpaceDescription {
    pub tile_size: u32,
    pub tile_border: u32,
    pub layer_formats: Vec<LayerFormat>,
    pub num_tiles: u32,
    pub continuous_update: bool,
}

#[derive(Debug)]
pub struct PhysicalSpace {
    description: PhysicalSpaceDescription,
    pool: PagePool,
    width_in_tiles: u32,
    ref_count: u32,
    warned_allocation_failure: bool,
}

impl PhysicalSpace {
    pub fn new(id: PhysicalSpaceId, description: PhysicalSpaceDescription, policy: EvictionPolicy) -> Self {
        //square power-of-two grid that fits every tile
        let width_in_tiles = 1u32 << ceil_log2(description.num_tiles).div_ceil(2);
        let pool = PagePool::new(id, description.num_tiles, policy);
        PhysicalSpace {
            description,
            pool,
            width_in_tiles,
            ref_count: 0,
            warned_allocation_failure: false,
        }
    }

    pub fn id(&self) -> PhysicalSpaceId {
        self.pool.id()
    }
    pub fn description(&self) -> &PhysicalSpaceDescription {
        &self.description
    }
    pub fn pool(&self) -> &PagePool {
        &self.pool
    }
    pub fn pool_mut(&mut self) -> &mut PagePool {
        &mut self.pool
    }
    pub fn num_layers(&self) -> usize {
        self.description.layer_formats.len()
    }
    pub fn tile_size_with_border(&self) -> u32 {
        self.description.tile_size + 2 * self.description.tile_border
    }
    pub fn width_in_tiles(&self) -> u32 {
        self.width_in_tiles
    }

    /// Tile position of `slot` in the physical texture, row-major.
    pub fn location(&self, slot: u32) -> (u32, u32) {
        (slot % self.width_in_tiles, slot / self.width_in_tiles)
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
    pub(crate) fn add_ref(&mut self) {
        self.ref_count += 1;
    }
    pub(crate) fn release(&mut self) {
        debug_assert!(self.ref_count > 0);
        self.ref_count = self.ref_count.saturating_sub(1);
    }

    /**
    Records an allocation failure.  Returns `true` the first time since the last success,
    so callers warn once per episode.
    */
    pub(crate) fn note_allocation_failure(&mut self) -> bool {
        !std::mem::replace(&mut self.warned_allocation_failure, true)
    }
    pub(crate) fn note_allocation_success(&mut self) {
        self.warned_allocation_failure = false;
    }
}

/// All physical spaces, indexed by [`PhysicalSpaceId`].
#[derive(Debug, Default)]
pub struct PhysicalSpaces {
    spaces: Vec<Option<PhysicalSpace>>,
}

impl PhysicalSpaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds a live space with `description` or creates one, and adds a reference to it.
    pub fn acquire(&mut self, description: &PhysicalSpaceDescription, policy: EvictionPolicy) -> PhysicalSpaceId {
        for space in self.spaces.iter_mut().flatten() {
            if space.description == *description {
                space.add_ref();
                return space.id();
            }
        }
        let index = match self.spaces.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.spaces.push(None);
                self.spaces.len() - 1
            }
        };
        let id = PhysicalSpaceId(index as u16);
        let mut space = PhysicalSpace::new(id, description.clone(), policy);
        space.add_ref();
        self.spaces[index] = Some(space);
        id
    }

    pub fn release(&mut self, id: PhysicalSpaceId) {
        if let Some(space) = self.get_mut(id) {
            space.release();
        }
    }

    /// Destroys spaces no producer references any more.  Returns the destroyed ids.
    pub fn release_pending(&mut self) -> Vec<PhysicalSpaceId> {
        let mut released = Vec::new();
        for entry in &mut self.spaces {
            if entry.as_ref().is_some_and(|s| s.ref_count() == 0) {
                if let Some(space) = entry.take() {
                    released.push(space.id());
                }
            }
        }
        released
    }

    pub fn get(&self, id: PhysicalSpaceId) -> Option<&PhysicalSpace> {
        self.spaces.get(id.0 as usize).and_then(Option::as_ref)
    }
    pub fn get_mut(&mut self, id: PhysicalSpaceId) -> Option<&mut PhysicalSpace> {
        self.spaces.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Upper bound on ids, for per-space side tables.
    pub fn id_bound(&self) -> usize {
        self.spaces.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysicalSpace> {
        self.spaces.iter().flatten()
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PhysicalSpace> {
        self.spaces.iter_mut().flatten()
    }

    pub fn set_policy(&mut self, policy: EvictionPolicy) {
        for space in self.iter_mut() {
            space.pool_mut().set_policy(policy);
        }
    }
}
