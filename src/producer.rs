// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Producers supply tile data.

A producer is anything that can fill a physical cache slot with the pixels of one tile: a
streamed asset, a procedural generator, a render-to-texture pass.  The system only knows it
through the [`Producer`] trait and a [`ProducerDescription`] supplied at registration.

# Physical groups

A producer has one or more texture layers (say, base color and normals).  Layers are
partitioned into *physical groups*; every group is cached in its own physical space, so one
tile of a producer occupies one slot per group.  Loads name the groups they need with a
bitmask.
*/

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::cache::physical_space::{LayerFormat, PhysicalSpaceDescription};
use crate::tile::{MAX_LAYERS, MAX_LEVEL, PhysicalSpaceId};

/**
Names a registered producer.

Handles are generational: once [`crate::VirtualTextureSystem::release_producer`] returns,
the handle never resolves again, even if its index is reused by a later registration.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerHandle {
    index: u32,
    generation: u32,
}

impl ProducerHandle {
    pub const fn index(&self) -> u32 {
        self.index
    }
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProducerError {
    #[error("producer {0:?} is not registered")]
    UnknownProducer(ProducerHandle),
    #[error("invalid producer description: {0}")]
    InvalidDescription(&'static str),
}

/// Outcome of [`Producer::request_page_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPageResult {
    /// Data can be produced now; the value is passed back to
    /// [`Producer::produce_page_data`].
    Available(u64),
    /// Data is still streaming in.  The request is retried on a later frame, unless the
    /// tile is being locked, in which case it is produced anyway.
    Pending,
    /// The request does not make sense for this producer.  Dropped without retry.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    Normal,
    High,
}

/// Why a tile is being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceKind {
    /// A new slot was allocated for the tile.
    Load,
    /// The tile is already resident and mapped; its content is regenerated in place.
    Refresh,
    /// The tile is resident and its physical space asked for continuous updates.
    ContinuousUpdate,
}

/**
Where one texture layer of a produced tile should be written.

`location` is the tile position in the physical texture of the physical space, in tiles.
The external resource owner turns this into a texel offset with `tile_size_with_border`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceTarget {
    pub physical_space: PhysicalSpaceId,
    /// Index of the texture within the physical space (the layer's position in its group).
    pub texture_index: u8,
    pub slot: u32,
    pub location: (u32, u32),
    pub tile_size_with_border: u32,
}

/// Deferred work issued once after every produce call of an update.
pub trait Finalizer: Send + Sync {
    fn finalize(&self);
}

/**
A source of tile data.

The system calls [`Producer::request_page_data`] first and only calls
[`Producer::produce_page_data`] for tiles it reported (or was forced to treat) as
available.  Both are called on the submission thread; [`Producer::local_mip_bias`] is also
called from gather workers.
*/
pub trait Producer: Send + Sync {
    fn request_page_data(
        &self,
        producer: ProducerHandle,
        layer_mask: u8,
        level: u8,
        address: u32,
        priority: RequestPriority,
    ) -> RequestPageResult;

    /**
    Writes the tile.

    `targets` has one entry per texture layer of the producer; entries outside `layer_mask`
    are `None`.
    */
    #[allow(clippy::too_many_arguments)]
    fn produce_page_data(
        &self,
        kind: ProduceKind,
        producer: ProducerHandle,
        layer_mask: u8,
        level: u8,
        address: u32,
        request: u64,
        targets: &[Option<ProduceTarget>],
    ) -> Option<Arc<dyn Finalizer>>;

    /// Extra mip levels to skip for a sparse region that only exists at coarser levels.
    fn local_mip_bias(&self, _level: u8, _address: u32) -> u8 {
        0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerDescription {
    pub name: String,
    pub tile_size: u32,
    pub tile_border: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub max_level: u8,
    /// Format of each texture layer.
    pub layer_formats: Vec<LayerFormat>,
    /// Physical group of each texture layer.  Groups must be numbered densely from 0.
    pub layer_groups: Vec<u8>,
    /// Slots in the physical space backing each group.
    pub pool_capacity: u32,
    pub continuous_update: bool,
    /// The coarsest mip stays resident, so new textures can be mapped to it immediately.
    pub persistent_highest_mip: bool,
}

impl Default for ProducerDescription {
    fn default() -> Self {
        ProducerDescription {
            name: String::new(),
            tile_size: 128,
            tile_border: 4,
            width_in_tiles: 1,
            height_in_tiles: 1,
            max_level: 0,
            layer_formats: vec![LayerFormat(0)],
            layer_groups: vec![0],
            pool_capacity: 64,
            continuous_update: false,
            persistent_highest_mip: false,
        }
    }
}

impl ProducerDescription {
    pub fn num_texture_layers(&self) -> usize {
        self.layer_formats.len()
    }

    pub fn num_physical_groups(&self) -> usize {
        self.layer_groups
            .iter()
            .map(|g| *g as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ProducerError> {
        if self.tile_size == 0 {
            return Err(ProducerError::InvalidDescription("tile size is zero"));
        }
        if self.width_in_tiles == 0 || self.height_in_tiles == 0 {
            return Err(ProducerError::InvalidDescription("producer has no tiles"));
        }
        if self.max_level > MAX_LEVEL {
            return Err(ProducerError::InvalidDescription("max level too large"));
        }
        if self.layer_formats.is_empty() || self.layer_formats.len() > MAX_LAYERS {
            return Err(ProducerError::InvalidDescription(
                "texture layer count out of range",
            ));
        }
        if self.layer_groups.len() != self.layer_formats.len() {
            return Err(ProducerError::InvalidDescription(
                "every texture layer needs a physical group",
            ));
        }
        for group in 0..self.num_physical_groups() {
            if !self.layer_groups.iter().any(|g| *g as usize == group) {
                return Err(ProducerError::InvalidDescription(
                    "physical groups are not dense",
                ));
            }
        }
        if self.pool_capacity == 0 {
            return Err(ProducerError::InvalidDescription("pool capacity is zero"));
        }
        Ok(())
    }

    /// The description of the physical space backing `group`.
    pub fn physical_space_description(&self, group: u8) -> PhysicalSpaceDescription {
        PhysicalSpaceDescription {
            tile_size: self.tile_size,
            tile_border: self.tile_border,
            layer_formats: self
                .layer_formats
                .iter()
                .zip(self.layer_groups.iter())
                .filter(|(_, g)| **g == group)
                .map(|(f, _)| *f)
                .collect(),
            num_tiles: self.pool_capacity,
            continuous_update: self.continuous_update,
        }
    }
}

/// A producer as the system tracks it.
pub struct RegisteredProducer {
    description: ProducerDescription,
    producer: Arc<dyn Producer>,
    physical_spaces: Vec<PhysicalSpaceId>,
}

impl Debug for RegisteredProducer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProducer")
            .field("name", &self.description.name)
            .field("physical_spaces", &self.physical_spaces)
            .finish()
    }
}

impl RegisteredProducer {
    pub fn description(&self) -> &ProducerDescription {
        &self.description
    }
    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }
    pub fn num_texture_layers(&self) -> usize {
        self.description.num_texture_layers()
    }
    pub fn num_physical_groups(&self) -> usize {
        self.physical_spaces.len()
    }
    pub fn group_for_layer(&self, layer: usize) -> u8 {
        self.description.layer_groups[layer]
    }
    pub fn physical_space_for_group(&self, group: u8) -> PhysicalSpaceId {
        self.physical_spaces[group as usize]
    }
    pub fn physical_spaces(&self) -> &[PhysicalSpaceId] {
        &self.physical_spaces
    }
    pub fn max_level(&self) -> u8 {
        self.description.max_level
    }
    pub fn width_in_tiles(&self) -> u32 {
        self.description.width_in_tiles
    }
    pub fn height_in_tiles(&self) -> u32 {
        self.description.height_in_tiles
    }

    /// Texture layers belonging to the groups in `group_mask`.
    pub fn layer_mask_for_groups(&self, group_mask: u8) -> u8 {
        let mut mask = 0u8;
        for (layer, group) in self.description.layer_groups.iter().enumerate() {
            if group_mask & (1 << group) != 0 {
                mask |= 1 << layer;
            }
        }
        mask
    }
}

struct Entry {
    generation: u32,
    producer: Option<RegisteredProducer>,
}

/// Generational storage for registered producers.
#[derive(Default)]
pub struct ProducerCollection {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl ProducerCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        description: ProducerDescription,
        producer: Arc<dyn Producer>,
        physical_spaces: Vec<PhysicalSpaceId>,
    ) -> ProducerHandle {
        let registered = RegisteredProducer {
            description,
            producer,
            physical_spaces,
        };
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.producer = Some(registered);
                ProducerHandle {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 1,
                    producer: Some(registered),
                });
                ProducerHandle {
                    index,
                    generation: 1,
                }
            }
        }
    }

    pub fn find(&self, handle: ProducerHandle) -> Option<&RegisteredProducer> {
        self.entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.producer.as_ref())
    }

    pub fn release(&mut self, handle: ProducerHandle) -> Result<RegisteredProducer, ProducerError> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .ok_or(ProducerError::UnknownProducer(handle))?;
        let producer = entry
            .producer
            .take()
            .ok_or(ProducerError::UnknownProducer(handle))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(producer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProducerHandle, &RegisteredProducer)> {
        self.entries.iter().enumerate().filter_map(|(index, e)| {
            e.producer.as_ref().map(|p| {
                (
                    ProducerHandle {
                        index: index as u32,
                        generation: e.generation,
                    },
                    p,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.producer.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
