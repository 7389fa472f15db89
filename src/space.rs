// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Virtual spaces.

A space is an address range that page tables are defined over.  Allocated virtual textures
with compatible descriptions share a space, each taking a block of its addresses; the space
keeps one [`page_map::PageMap`] per page-table layer and a queue of
[`page_map::PageTableUpdate`]s for the renderer.
*/

pub mod allocated_vt;
pub mod allocator;
pub mod page_map;

use crate::cache::page_pool::{MapError, PageTables};
use crate::space::allocated_vt::{AllocateError, AllocatedVtId};
use crate::space::allocator::AddressAllocator;
use crate::space::page_map::{PageMap, PageTableEntry, PageTableUpdate};
use crate::tile::{MAX_SPACES, PageMapping, PhysicalAddress, SpaceId};

/// Side of every space in tiles, as a power of two.  Matches the 12 bits per axis of feedback.
pub const SPACE_LOG2_SIZE: u32 = 12;

/// Spaces are shared between textures whose descriptions are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceDescription {
    pub tile_size: u32,
    pub tile_border: u32,
    pub num_page_table_layers: u8,
    pub private_space: bool,
}

#[derive(Debug)]
pub struct VirtualTextureSpace {
    id: SpaceId,
    description: SpaceDescription,
    allocator: AddressAllocator<AllocatedVtId>,
    page_maps: Vec<PageMap>,
    updates: Vec<PageTableUpdate>,
}

impl VirtualTextureSpace {
    fn new(id: SpaceId, description: SpaceDescription) -> Self {
        VirtualTextureSpace {
            id,
            description,
            allocator: AddressAllocator::new(SPACE_LOG2_SIZE),
            page_maps: (0..description.num_page_table_layers)
                .map(|_| PageMap::new())
                .collect(),
            updates: Vec::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }
    pub fn description(&self) -> &SpaceDescription {
        &self.description
    }
    pub fn num_page_table_layers(&self) -> usize {
        self.page_maps.len()
    }
    pub fn page_map(&self, page_table_layer: usize) -> &PageMap {
        &self.page_maps[page_table_layer]
    }
    pub fn allocator(&self) -> &AddressAllocator<AllocatedVtId> {
        &self.allocator
    }
    /// The allocated virtual texture owning `address`.
    pub fn find(&self, address: u32) -> Option<AllocatedVtId> {
        self.allocator.find(address)
    }
    pub fn pending_updates(&self) -> &[PageTableUpdate] {
        &self.updates
    }
    pub fn take_updates(&mut self) -> Vec<PageTableUpdate> {
        std::mem::take(&mut self.updates)
    }
}

/// All virtual spaces, indexed by [`SpaceId`].
#[derive(Debug)]
pub struct Spaces {
    spaces: Vec<Option<VirtualTextureSpace>>,
}

impl Default for Spaces {
    fn default() -> Self {
        Spaces {
            spaces: (0..MAX_SPACES).map(|_| None).collect(),
        }
    }
}

impl Spaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SpaceId) -> Option<&VirtualTextureSpace> {
        self.spaces.get(id.0 as usize).and_then(Option::as_ref)
    }
    pub fn get_mut(&mut self, id: SpaceId) -> Option<&mut VirtualTextureSpace> {
        self.spaces.get_mut(id.0 as usize).and_then(Option::as_mut)
    }
    pub fn iter(&self) -> impl Iterator<Item = &VirtualTextureSpace> {
        self.spaces.iter().flatten()
    }

    /**
    Allocates `width` x `height` tiles for `owner` in a space matching `description`,
    creating a space if none has room.  Returns the space and the block's base address.
    */
    pub fn acquire(
        &mut self,
        description: SpaceDescription,
        width: u32,
        height: u32,
        owner: AllocatedVtId,
    ) -> Result<(SpaceId, u32), AllocateError> {
        if AddressAllocator::<AllocatedVtId>::order_for(width, height) > SPACE_LOG2_SIZE {
            return Err(AllocateError::TooLarge { width, height });
        }
        if !description.private_space {
            for space in self.spaces.iter_mut().flatten() {
                if space.description == description {
                    if let Some(address) = space.allocator.alloc(width, height, owner) {
                        return Ok((space.id, address));
                    }
                }
            }
        }
        let index = self
            .spaces
            .iter()
            .position(Option::is_none)
            .ok_or(AllocateError::OutOfSpaces)?;
        let mut space = VirtualTextureSpace::new(SpaceId(index as u8), description);
        let address = space
            .allocator
            .alloc(width, height, owner)
            .ok_or(AllocateError::TooLarge { width, height })?;
        self.spaces[index] = Some(space);
        Ok((SpaceId(index as u8), address))
    }

    /**
    Frees the block at `address`, removing every page-table entry inside it.

    Returns the removed entries so the pools that backed them can forget them.  A space
    left with no allocations is destroyed.
    */
    pub fn release(&mut self, id: SpaceId, address: u32) -> Vec<(PageMapping, PhysicalAddress)> {
        let Some(space) = self.get_mut(id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        if let Some(range) = space.allocator.range(address) {
            for (layer, map) in space.page_maps.iter_mut().enumerate() {
                for (v_level, v_address, physical) in map.remove_range(range.clone()) {
                    removed.push((
                        PageMapping {
                            space: id,
                            page_table_layer: layer as u8,
                            v_level,
                            v_address,
                        },
                        physical,
                    ));
                    space.updates.push(PageTableUpdate::Unmap {
                        page_table_layer: layer as u8,
                        v_level,
                        v_address,
                    });
                }
            }
        }
        space.allocator.free(address);
        if space.allocator.num_allocations() == 0 {
            self.spaces[id.0 as usize] = None;
        }
        removed
    }

    /// Drains the page-table updates of every space.
    pub fn take_updates(&mut self) -> Vec<(SpaceId, Vec<PageTableUpdate>)> {
        self.spaces
            .iter_mut()
            .flatten()
            .filter(|s| !s.updates.is_empty())
            .map(|s| (s.id, s.take_updates()))
            .collect()
    }
}

impl PageTables for Spaces {
    fn map(
        &mut self,
        mapping: PageMapping,
        physical: PhysicalAddress,
        mapped_level: u8,
    ) -> Result<(), MapError> {
        let space = self
            .get_mut(mapping.space)
            .ok_or(MapError::UnknownSpace(mapping.space))?;
        let map = space
            .page_maps
            .get_mut(mapping.page_table_layer as usize)
            .ok_or(MapError::UnknownLayer(mapping.page_table_layer))?;
        let entry = PageTableEntry {
            physical,
            mapped_level,
        };
        match map.insert(mapping.v_level, mapping.v_address, entry) {
            Ok(true) => {
                space.updates.push(PageTableUpdate::Map {
                    page_table_layer: mapping.page_table_layer,
                    v_level: mapping.v_level,
                    v_address: mapping.v_address,
                    entry,
                });
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(existing) => Err(MapError::AlreadyMapped { mapping, existing }),
        }
    }

    fn unmap(&mut self, mapping: PageMapping, physical: PhysicalAddress) {
        let Some(space) = self.get_mut(mapping.space) else {
            return;
        };
        let Some(map) = space.page_maps.get_mut(mapping.page_table_layer as usize) else {
            return;
        };
        if map.remove(mapping.v_level, mapping.v_address, physical) {
            space.updates.push(PageTableUpdate::Unmap {
                page_table_layer: mapping.page_table_layer,
                v_level: mapping.v_level,
                v_address: mapping.v_address,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::allocated_vt::AllocatedVts;
    use crate::tile::PhysicalSpaceId;

    fn description(private_space: bool) -> SpaceDescription {
        SpaceDescription {
            tile_size: 128,
            tile_border: 4,
            num_page_table_layers: 1,
            private_space,
        }
    }

    #[test]
    fn shared_and_private_spaces() {
        let owner = AllocatedVts::new().next_id();
        let mut spaces = Spaces::new();
        let (a, _) = spaces.acquire(description(false), 4, 4, owner).unwrap();
        let (b, _) = spaces.acquire(description(false), 4, 4, owner).unwrap();
        let (c, _) = spaces.acquire(description(true), 4, 4, owner).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(matches!(
            spaces.acquire(description(false), 5000, 1, owner),
            Err(AllocateError::TooLarge { .. })
        ));
    }

    #[test]
    fn release_unmaps_the_block() {
        let owner = AllocatedVts::new().next_id();
        let mut spaces = Spaces::new();
        let (id, first) = spaces.acquire(description(false), 2, 2, owner).unwrap();
        let (_, second) = spaces.acquire(description(false), 2, 2, owner).unwrap();
        let physical = PhysicalAddress {
            physical_space: PhysicalSpaceId(0),
            slot: 3,
        };
        let inside = PageMapping {
            space: id,
            page_table_layer: 0,
            v_level: 0,
            v_address: first + 1,
        };
        let outside = PageMapping {
            v_address: second,
            ..inside
        };
        spaces.map(inside, physical, 0).unwrap();
        spaces.map(outside, physical, 0).unwrap();
        spaces.take_updates();
        let removed = spaces.release(id, first);
        assert_eq!(removed, vec![(inside, physical)]);
        let updates = spaces.take_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.len(), 1);
        assert!(spaces.get(id).is_some());
        spaces.release(id, second);
        assert!(spaces.get(id).is_none());
    }
}
