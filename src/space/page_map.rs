// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The CPU-side page table of one page-table layer.

Entries are keyed by `(level, address)` where `address` is the level-0 Morton address of the
page's first tile, so a page at level `n` has its low `2n` address bits clear.
*/

use std::collections::HashMap;

use crate::tile::PhysicalAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub physical: PhysicalAddress,
    /// The virtual level the physical tile's content corresponds to.
    pub mapped_level: u8,
}

/// A change the renderer applies to its copy of the page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableUpdate {
    Map {
        page_table_layer: u8,
        v_level: u8,
        v_address: u32,
        entry: PageTableEntry,
    },
    Unmap {
        page_table_layer: u8,
        v_level: u8,
        v_address: u32,
    },
}

#[derive(Debug, Default)]
pub struct PageMap {
    entries: HashMap<(u8, u32), PageTableEntry>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, level: u8, address: u32) -> Option<PhysicalAddress> {
        self.entries.get(&(level, address)).map(|e| e.physical)
    }

    pub fn entry(&self, level: u8, address: u32) -> Option<PageTableEntry> {
        self.entries.get(&(level, address)).copied()
    }

    /**
    Inserts an entry.

    Re-inserting the same physical address is a no-op that returns `Ok(false)`; an entry
    pointing elsewhere is left alone and returned as the error.
    */
    pub fn insert(&mut self, level: u8, address: u32, entry: PageTableEntry) -> Result<bool, PhysicalAddress> {
        match self.entries.get(&(level, address)) {
            Some(existing) if existing.physical == entry.physical => Ok(false),
            Some(existing) => Err(existing.physical),
            None => {
                self.entries.insert((level, address), entry);
                Ok(true)
            }
        }
    }

    /// Removes the entry if it points at `physical`.
    pub fn remove(&mut self, level: u8, address: u32, physical: PhysicalAddress) -> bool {
        if self.find(level, address) == Some(physical) {
            self.entries.remove(&(level, address));
            true
        } else {
            false
        }
    }

    /// Removes every entry whose address lies in `range`.
    pub fn remove_range(&mut self, range: std::ops::Range<u64>) -> Vec<(u8, u32, PhysicalAddress)> {
        let mut removed = Vec::new();
        self.entries.retain(|(level, address), entry| {
            if range.contains(&(*address as u64)) {
                removed.push((*level, *address, entry.physical));
                false
            } else {
                true
            }
        });
        removed.sort_by_key(|(level, address, _)| (*level, *address));
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
