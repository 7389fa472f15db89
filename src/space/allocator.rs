// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Buddy allocation of virtual address ranges.

A space is a square of `2^log2_size` tiles per side.  Because addresses are Morton codes, an
aligned square block of side `2^order` is the contiguous address range
`base..base + 4^order`, and splitting a block yields four blocks whose bases are spaced
`4^(order - 1)` apart.  The allocator hands out such blocks, lowest address first.
*/

use std::collections::{BTreeMap, BTreeSet};

use crate::bittricks::ceil_log2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block<T> {
    order: u32,
    owner: T,
}

#[derive(Debug)]
pub struct AddressAllocator<T> {
    log2_size: u32,
    /// Free block bases, per order.
    free: Vec<BTreeSet<u32>>,
    allocated: BTreeMap<u32, Block<T>>,
}

/// Number of addresses in a block of `order`.
const fn block_len(order: u32) -> u64 {
    1u64 << (2 * order)
}

impl<T: Copy> AddressAllocator<T> {
    pub fn new(log2_size: u32) -> Self {
        let mut free = vec![BTreeSet::new(); log2_size as usize + 1];
        free[log2_size as usize].insert(0);
        AddressAllocator {
            log2_size,
            free,
            allocated: BTreeMap::new(),
        }
    }

    pub fn size_in_tiles(&self) -> u32 {
        1 << self.log2_size
    }

    /// The block order needed for a `width` x `height` tile rectangle.
    pub fn order_for(width: u32, height: u32) -> u32 {
        ceil_log2(width.max(height).max(1))
    }

    /// Allocates a block for `width` x `height` tiles.  Returns its base address.
    pub fn alloc(&mut self, width: u32, height: u32, owner: T) -> Option<u32> {
        let order = Self::order_for(width, height);
        if order > self.log2_size {
            return None;
        }
        let source = (order..=self.log2_size).find(|o| !self.free[*o as usize].is_empty())?;
        let base = self.free[source as usize].pop_first()?;
        //split down, keeping the lowest child each time
        let mut current = source;
        while current > order {
            current -= 1;
            let child = block_len(current) as u32;
            for i in 1..4u32 {
                self.free[current as usize].insert(base + i * child);
            }
        }
        debug_assert_eq!(base as u64 % block_len(order), 0);
        self.allocated.insert(base, Block { order, owner });
        Some(base)
    }

    /// Frees the block at `base`, merging buddies.  Returns its owner.
    pub fn free(&mut self, base: u32) -> Option<T> {
        let block = self.allocated.remove(&base)?;
        let mut order = block.order;
        let mut base = base;
        while order < self.log2_size {
            let parent_len = block_len(order + 1);
            let parent = (base as u64 / parent_len * parent_len) as u32;
            let child = block_len(order) as u32;
            let siblings: Vec<u32> = (0..4u32)
                .map(|i| parent + i * child)
                .filter(|b| *b != base)
                .collect();
            if !siblings.iter().all(|b| self.free[order as usize].contains(b)) {
                break;
            }
            for sibling in siblings {
                self.free[order as usize].remove(&sibling);
            }
            base = parent;
            order += 1;
        }
        self.free[order as usize].insert(base);
        Some(block.owner)
    }

    /// The owner of the block containing `address`.
    pub fn find(&self, address: u32) -> Option<T> {
        let (base, block) = self.allocated.range(..=address).next_back()?;
        ((address as u64) < *base as u64 + block_len(block.order)).then_some(block.owner)
    }

    /// The address range of the block at `base`.
    pub fn range(&self, base: u32) -> Option<std::ops::Range<u64>> {
        self.allocated
            .get(&base)
            .map(|b| base as u64..base as u64 + block_len(b.order))
    }

    pub fn num_allocations(&self) -> usize {
        self.allocated.len()
    }
}
