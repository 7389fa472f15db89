// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Allocated virtual textures.

An allocated virtual texture owns a block of a space's address range and routes each of its
page-table layers to one texture layer of one producer.  Producers smaller than the texture
are addressed with a mip bias: a producer half the texture's width supplies level 0 of its
own tiles for level 1 of the texture.
*/

use std::sync::{Arc, Mutex};

use crate::bittricks::{ceil_log2, morton_xy};
use crate::producer::{ProducerCollection, ProducerHandle};
use crate::tile::{MAX_LAYERS, MAX_LEVEL, PhysicalSpaceId, SpaceId};

/// Names an allocated virtual texture.  Generational, like [`ProducerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatedVtId {
    index: u32,
    generation: u32,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AllocateError {
    #[error("virtual texture has no layers")]
    NoLayers,
    #[error("virtual texture has {0} layers, the limit is 8")]
    TooManyLayers(usize),
    #[error("producer {0:?} is not registered")]
    UnknownProducer(ProducerHandle),
    #[error("producer {producer:?} has no texture layer {layer}")]
    LayerOutOfRange { producer: ProducerHandle, layer: u8 },
    #[error("producer {0:?} is not a power-of-two fraction of the texture size")]
    IncompatibleProducerSize(ProducerHandle),
    #[error("producers disagree on tile size")]
    IncompatibleTileSize,
    #[error("a {width}x{height} tile texture does not fit in a virtual space")]
    TooLarge { width: u32, height: u32 },
    #[error("every virtual space is in use")]
    OutOfSpaces,
}

/// Which producer texture layer a page-table layer shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerBinding {
    pub producer: ProducerHandle,
    pub producer_layer: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocatedVtDescription {
    /// One entry per page-table layer.
    pub layers: Vec<LayerBinding>,
    /// Never share the space with other textures.
    pub private_space: bool,
}

/// A producer used by an allocated virtual texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueProducer {
    pub handle: ProducerHandle,
    /// Levels of the texture above the producer's level 0.
    pub mip_bias: u8,
}

/// Where one page-table layer's tiles come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRoute {
    pub producer_index: u8,
    pub texture_layer_mask: u8,
    pub group: u8,
    pub physical_space: PhysicalSpaceId,
}

#[derive(Debug)]
pub struct AllocatedVirtualTexture {
    id: AllocatedVtId,
    description: AllocatedVtDescription,
    tile_size: u32,
    tile_border: u32,
    width_in_tiles: u32,
    height_in_tiles: u32,
    max_level: u8,
    frame_allocated: u32,
    unique_producers: Vec<UniqueProducer>,
    routes: Vec<LayerRoute>,
    persistent_highest_mip: bool,
    space: SpaceId,
    virtual_address: u32,
}

impl AllocatedVirtualTexture {
    /// Resolves producers and routing.  The space and address are assigned afterwards.
    pub(crate) fn new(
        id: AllocatedVtId,
        description: AllocatedVtDescription,
        producers: &ProducerCollection,
        frame: u32,
    ) -> Result<Self, AllocateError> {
        if description.layers.is_empty() {
            return Err(AllocateError::NoLayers);
        }
        if description.layers.len() > MAX_LAYERS {
            return Err(AllocateError::TooManyLayers(description.layers.len()));
        }
        let mut width_in_tiles = 0;
        let mut height_in_tiles = 0;
        let mut tile_size = None;
        for binding in &description.layers {
            let producer = producers
                .find(binding.producer)
                .ok_or(AllocateError::UnknownProducer(binding.producer))?;
            if binding.producer_layer as usize >= producer.num_texture_layers() {
                return Err(AllocateError::LayerOutOfRange {
                    producer: binding.producer,
                    layer: binding.producer_layer,
                });
            }
            let size = (producer.description().tile_size, producer.description().tile_border);
            if *tile_size.get_or_insert(size) != size {
                return Err(AllocateError::IncompatibleTileSize);
            }
            width_in_tiles = width_in_tiles.max(producer.width_in_tiles());
            height_in_tiles = height_in_tiles.max(producer.height_in_tiles());
        }

        let mut unique_producers: Vec<UniqueProducer> = Vec::new();
        let mut routes = Vec::with_capacity(description.layers.len());
        let mut max_level = 0u8;
        let mut persistent_highest_mip = false;
        for binding in &description.layers {
            let producer = producers
                .find(binding.producer)
                .ok_or(AllocateError::UnknownProducer(binding.producer))?;
            let producer_index = match unique_producers
                .iter()
                .position(|u| u.handle == binding.producer)
            {
                Some(index) => index,
                None => {
                    let ratio = width_in_tiles / producer.width_in_tiles();
                    let mip_bias = ceil_log2(ratio);
                    if producer.width_in_tiles() << mip_bias != width_in_tiles
                        || producer.height_in_tiles() << mip_bias != height_in_tiles
                    {
                        return Err(AllocateError::IncompatibleProducerSize(binding.producer));
                    }
                    let mip_bias = mip_bias as u8;
                    max_level = max_level.max(producer.max_level() + mip_bias);
                    persistent_highest_mip |= producer.description().persistent_highest_mip;
                    unique_producers.push(UniqueProducer {
                        handle: binding.producer,
                        mip_bias,
                    });
                    unique_producers.len() - 1
                }
            };
            let group = producer.group_for_layer(binding.producer_layer as usize);
            routes.push(LayerRoute {
                producer_index: producer_index as u8,
                texture_layer_mask: 1 << binding.producer_layer,
                group,
                physical_space: producer.physical_space_for_group(group),
            });
        }
        let (tile_size, tile_border) = tile_size.unwrap_or_default();

        Ok(AllocatedVirtualTexture {
            id,
            description,
            tile_size,
            tile_border,
            width_in_tiles,
            height_in_tiles,
            max_level: max_level.min(MAX_LEVEL),
            frame_allocated: frame,
            unique_producers,
            routes,
            persistent_highest_mip,
            space: SpaceId(0),
            virtual_address: 0,
        })
    }

    pub(crate) fn assign_address(&mut self, space: SpaceId, virtual_address: u32) {
        self.space = space;
        self.virtual_address = virtual_address;
    }

    pub fn id(&self) -> AllocatedVtId {
        self.id
    }
    pub fn description(&self) -> &AllocatedVtDescription {
        &self.description
    }
    pub fn space(&self) -> SpaceId {
        self.space
    }
    pub fn virtual_address(&self) -> u32 {
        self.virtual_address
    }
    /// Tile coordinates of the texture's origin in its space.
    pub fn virtual_page_xy(&self) -> (u32, u32) {
        morton_xy(self.virtual_address)
    }
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }
    pub fn tile_border(&self) -> u32 {
        self.tile_border
    }
    pub fn width_in_tiles(&self) -> u32 {
        self.width_in_tiles
    }
    pub fn height_in_tiles(&self) -> u32 {
        self.height_in_tiles
    }
    pub fn width_in_pixels(&self) -> u32 {
        self.width_in_tiles * self.tile_size
    }
    pub fn height_in_pixels(&self) -> u32 {
        self.height_in_tiles * self.tile_size
    }
    pub fn max_level(&self) -> u8 {
        self.max_level
    }
    pub fn frame_allocated(&self) -> u32 {
        self.frame_allocated
    }
    pub fn num_page_table_layers(&self) -> usize {
        self.routes.len()
    }
    pub fn route(&self, page_table_layer: usize) -> &LayerRoute {
        &self.routes[page_table_layer]
    }
    pub fn routes(&self) -> &[LayerRoute] {
        &self.routes
    }
    pub fn unique_producers(&self) -> &[UniqueProducer] {
        &self.unique_producers
    }
    pub fn persistent_highest_mip(&self) -> bool {
        self.persistent_highest_mip
    }
    pub fn uses_producer(&self, producer: ProducerHandle) -> bool {
        self.unique_producers.iter().any(|u| u.handle == producer)
    }
}

struct Entry {
    generation: u32,
    vt: Option<AllocatedVirtualTexture>,
}

/// Generational storage for allocated virtual textures.
#[derive(Default)]
pub struct AllocatedVts {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl AllocatedVts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id for a texture about to be created.
    pub(crate) fn next_id(&self) -> AllocatedVtId {
        match self.free.last() {
            Some(index) => AllocatedVtId {
                index: *index,
                generation: self.entries[*index as usize].generation,
            },
            None => AllocatedVtId {
                index: self.entries.len() as u32,
                generation: 1,
            },
        }
    }

    /// Stores `vt` under the id previously returned by [`AllocatedVts::next_id`].
    pub(crate) fn insert(&mut self, vt: AllocatedVirtualTexture) {
        let id = vt.id();
        if self.free.last() == Some(&id.index) {
            self.free.pop();
            self.entries[id.index as usize].vt = Some(vt);
        } else {
            debug_assert_eq!(id.index as usize, self.entries.len());
            self.entries.push(Entry {
                generation: id.generation,
                vt: Some(vt),
            });
        }
    }

    pub fn get(&self, id: AllocatedVtId) -> Option<&AllocatedVirtualTexture> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.vt.as_ref())
    }

    pub(crate) fn remove(&mut self, id: AllocatedVtId) -> Option<AllocatedVirtualTexture> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)?;
        let vt = entry.vt.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(vt)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocatedVirtualTexture> {
        self.entries.iter().filter_map(|e| e.vt.as_ref())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/**
Queues destruction of allocated virtual textures from any thread.

Queued textures are destroyed at the start of the next update, and before any new
allocation, on the thread that owns the system.  Nothing resolves requests against a
texture between queueing and destruction.
*/
#[derive(Debug, Clone, Default)]
pub struct DestroyQueue {
    pending: Arc<Mutex<Vec<AllocatedVtId>>>,
}

impl DestroyQueue {
    pub fn destroy(&self, id: AllocatedVtId) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).push(id);
    }

    /// Whether `id` is waiting to be destroyed.
    pub fn contains(&self, id: AllocatedVtId) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).contains(&id)
    }

    pub(crate) fn take(&self) -> Vec<AllocatedVtId> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
