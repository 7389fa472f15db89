// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
State shared between the submission thread and gather workers.

Workers hold read guards for the duration of a shard.  Everything that mutates slots or page
tables takes the write guard on the submission thread.
*/

use std::sync::Arc;

use crate::adaptive::AdaptiveVirtualTexture;
use crate::cache::page_pool::{MapError, PagePool};
use crate::cache::physical_space::PhysicalSpaces;
use crate::producer::ProducerCollection;
use crate::space::Spaces;
use crate::space::allocated_vt::{AllocatedVirtualTexture, AllocatedVts};
use crate::tile::{MAX_SPACES, PageMapping, PhysicalAddress, PhysicalSpaceId, SpaceId};

pub(crate) struct Registry {
    pub(crate) frame: u32,
    pub(crate) producers: ProducerCollection,
    pub(crate) physical_spaces: PhysicalSpaces,
    pub(crate) spaces: Spaces,
    pub(crate) allocated_vts: AllocatedVts,
    pub(crate) adaptive: Vec<Option<Arc<dyn AdaptiveVirtualTexture>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            frame: 0,
            producers: ProducerCollection::new(),
            physical_spaces: PhysicalSpaces::new(),
            spaces: Spaces::new(),
            allocated_vts: AllocatedVts::new(),
            adaptive: (0..MAX_SPACES).map(|_| None).collect(),
        }
    }

    pub(crate) fn pool(&self, id: PhysicalSpaceId) -> Option<&PagePool> {
        self.physical_spaces.get(id).map(|s| s.pool())
    }

    pub(crate) fn adaptive(&self, space: SpaceId) -> Option<&Arc<dyn AdaptiveVirtualTexture>> {
        self.adaptive.get(space.0 as usize).and_then(Option::as_ref)
    }

    /// The texture owning `address` in `space`.
    pub(crate) fn find_vt(&self, space: SpaceId, address: u32) -> Option<&AllocatedVirtualTexture> {
        let id = self.spaces.get(space)?.find(address)?;
        self.allocated_vts.get(id)
    }

    pub(crate) fn map_page(
        &mut self,
        physical: PhysicalAddress,
        mapping: PageMapping,
        mapped_level: u8,
    ) -> Result<(), MapError> {
        let Registry {
            physical_spaces,
            spaces,
            ..
        } = self;
        match physical_spaces.get_mut(physical.physical_space) {
            Some(space) => space
                .pool_mut()
                .map_page(spaces, mapping, mapped_level, physical.slot),
            None => Err(MapError::StaleSlot(physical.slot)),
        }
    }

    /// Logs a failed mapping.  Mapping conflicts are dropped rather than surfaced.
    pub(crate) fn map_page_or_log(&mut self, physical: PhysicalAddress, mapping: PageMapping, mapped_level: u8) -> bool {
        match self.map_page(physical, mapping, mapped_level) {
            Ok(()) => true,
            Err(e) => {
                logwise::error_sync!(
                    "dropping page mapping: {error}",
                    error = logwise::privacy::LogIt(&e)
                );
                false
            }
        }
    }
}
