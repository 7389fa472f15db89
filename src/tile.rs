// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Identity types shared by the cache, the page tables and the request pipeline.

There are two ways to name a tile:

* virtually, as an entry in a page table: `(space, page-table layer, level, Morton address)`,
  see [`PageMapping`];
* locally, as the producer sees it: `(producer, address, level)` in the producer's own
  tile grid, see [`LocalTile`].

The gatherer translates the first into the second; the page pool is keyed by the second
and records which instances of the first currently point at each slot.
*/

use crate::producer::ProducerHandle;

/// Maximum number of virtual spaces; the feedback encoding reserves 4 bits for the id.
pub const MAX_SPACES: usize = 16;

/// Maximum page-table layers in one space, and texture layers in one producer.
pub const MAX_LAYERS: usize = 8;

/// Maximum mip level addressable by the feedback encoding.
pub const MAX_LEVEL: u8 = 14;

/// Identifies a virtual space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub u8);

/// Identifies a physical space (one bounded cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalSpaceId(pub u16);

/**
A tile in a producer's local addressing.

`local_address` is a Morton address relative to the level, so the parent of a tile is
`local_address >> 2` at `local_level + 1`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalTile {
    pub producer: ProducerHandle,
    pub local_address: u32,
    pub local_level: u8,
}

impl LocalTile {
    pub fn new(producer: ProducerHandle, local_address: u32, local_level: u8) -> Self {
        LocalTile {
            producer,
            local_address,
            local_level,
        }
    }
}

/// One page-table entry: a virtual page of one layer of one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageMapping {
    pub space: SpaceId,
    pub page_table_layer: u8,
    pub v_level: u8,
    pub v_address: u32,
}

/// A physical cache location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalAddress {
    pub physical_space: PhysicalSpaceId,
    pub slot: u32,
}

/**
A rectangle of level-0 tiles, `min` inclusive and `max` exclusive.

An empty region means "everything".
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileRegion {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileRegion {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        TileRegion {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    /// Whether the tile `(x, y)` at `level` overlaps this region.
    pub fn intersects_tile(&self, x: u32, y: u32, level: u8) -> bool {
        if self.is_empty() {
            return true;
        }
        let x0 = x << level;
        let y0 = y << level;
        let x1 = (x + 1) << level;
        let y1 = (y + 1) << level;
        x0 < self.max_x && x1 > self.min_x && y0 < self.max_y && y1 > self.min_y
    }
}
