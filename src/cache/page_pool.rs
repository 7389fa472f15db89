// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The slot table of one physical space.

A [`PagePool`] owns a fixed number of slots.  Each allocated slot holds one tile of one
physical group of one producer, identified by a [`PageKey`], and remembers every page-table
entry that currently points at it so those entries can be removed before the slot is reused.

# Slot states

```text
Free -> Allocated -> (Locked <-> Allocated) -> Free
```

Only an allocated slot with a lock count of zero may be freed or evicted.  "Mapped" is
orthogonal: a slot is mapped while any page-table entry references it.

# Recency

Recency lives behind the pool's own mutex so gather workers can touch it while holding only
a shared reference to the pool.  All other state is mutated through `&mut self`, which the
system only hands out on the submission thread.
*/

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, TryLockError};

use crate::config::EvictionPolicy;
use crate::producer::ProducerHandle;
use crate::tile::{LocalTile, PageMapping, PhysicalAddress, PhysicalSpaceId, SpaceId, TileRegion};

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub producer: ProducerHandle,
    pub group: u8,
    pub local_address: u32,
    pub local_level: u8,
}

impl PageKey {
    pub fn new(producer: ProducerHandle, group: u8, local_address: u32, local_level: u8) -> Self {
        PageKey {
            producer,
            group,
            local_address,
            local_level,
        }
    }
    pub fn tile(&self) -> LocalTile {
        LocalTile::new(self.producer, self.local_address, self.local_level)
    }
    /// The key of the parent tile, one level coarser.  `None` past the last representable level.
    fn parent(&self) -> Option<PageKey> {
        Some(PageKey {
            local_address: self.local_address >> 2,
            local_level: self.local_level.checked_add(1)?,
            ..*self
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    #[error("every slot of {0:?} is locked or too recently used")]
    NoEvictableSlot(PhysicalSpaceId),
    #[error("slot {0} is locked")]
    SlotLocked(u32),
    #[error("slot {0} is not locked")]
    SlotNotLocked(u32),
    #[error("slot {0} is not allocated")]
    SlotNotAllocated(u32),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MapError {
    #[error("{mapping:?} is already mapped to {existing:?}")]
    AlreadyMapped {
        mapping: PageMapping,
        existing: PhysicalAddress,
    },
    #[error("slot {0} is not allocated")]
    StaleSlot(u32),
    #[error("{0:?} does not exist")]
    UnknownSpace(SpaceId),
    #[error("page-table layer {0} out of range")]
    UnknownLayer(u8),
}

/**
The page tables a pool writes into.

Implemented by [`crate::space::Spaces`]; the pool calls it to add entries for a slot and to
remove every entry of a slot before the slot is reused.
*/
pub trait PageTables {
    fn map(
        &mut self,
        mapping: PageMapping,
        physical: PhysicalAddress,
        mapped_level: u8,
    ) -> Result<(), MapError>;
    fn unmap(&mut self, mapping: PageMapping, physical: PhysicalAddress);
}

#[derive(Debug, Clone, Default)]
struct Slot {
    key: Option<PageKey>,
    /// Frame of the allocation.  A slot is never evicted in the frame it was allocated.
    allocated_frame: Option<u32>,
    lock_count: u32,
    mappings: Vec<PageMapping>,
}

/// Recency stamps, indexed both by slot and by `(stamp, slot)` for oldest-first search.
#[derive(Debug, Default)]
struct Recency {
    stamps: Vec<Option<u32>>,
    order: BTreeSet<(u32, u32)>,
}

impl Recency {
    fn with_capacity(capacity: u32) -> Self {
        Recency {
            stamps: vec![None; capacity as usize],
            order: BTreeSet::new(),
        }
    }

    fn insert(&mut self, frame: u32, slot: u32) {
        self.remove(slot);
        self.stamps[slot as usize] = Some(frame);
        self.order.insert((frame, slot));
    }

    fn remove(&mut self, slot: u32) {
        if let Some(old) = self.stamps[slot as usize].take() {
            self.order.remove(&(old, slot));
        }
    }

    /// Free slots are not tracked, so touching one is a no-op.
    fn touch(&mut self, frame: u32, slot: u32) {
        let Some(entry) = self.stamps.get_mut(slot as usize) else {
            return;
        };
        if let Some(old) = *entry {
            if old < frame {
                self.order.remove(&(old, slot));
                self.order.insert((frame, slot));
                *entry = Some(frame);
            }
        }
    }
}

#[derive(Debug)]
pub struct PagePool {
    id: PhysicalSpaceId,
    policy: EvictionPolicy,
    slots: Vec<Slot>,
    index: HashMap<PageKey, u32>,
    free: BTreeSet<u32>,
    recency: Mutex<Recency>,
}

impl PagePool {
    pub fn new(id: PhysicalSpaceId, capacity: u32, policy: EvictionPolicy) -> Self {
        PagePool {
            id,
            policy,
            slots: vec![Slot::default(); capacity as usize],
            index: HashMap::new(),
            free: (0..capacity).collect(),
            recency: Mutex::new(Recency::with_capacity(capacity)),
        }
    }

    pub fn id(&self) -> PhysicalSpaceId {
        self.id
    }
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
    pub fn set_policy(&mut self, policy: EvictionPolicy) {
        self.policy = policy;
    }

    fn recency_mut(&mut self) -> &mut Recency {
        //recency is advisory, a poisoned lock still holds usable stamps
        self.recency.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, slot: u32) -> Result<&Slot, PoolError> {
        self.slots
            .get(slot as usize)
            .filter(|s| s.key.is_some())
            .ok_or(PoolError::SlotNotAllocated(slot))
    }

    fn slot_mut(&mut self, slot: u32) -> Result<&mut Slot, PoolError> {
        self.slots
            .get_mut(slot as usize)
            .filter(|s| s.key.is_some())
            .ok_or(PoolError::SlotNotAllocated(slot))
    }

    pub fn find_page_address(&self, key: &PageKey) -> Option<u32> {
        self.index.get(key).copied()
    }

    /**
    Finds the most detailed resident tile at `key`'s level or coarser, up to `max_level`.

    Returns the slot and the level it was found at.
    */
    pub fn find_nearest_page_address(&self, key: &PageKey, max_level: u8) -> Option<(u32, u8)> {
        let mut key = Some(*key);
        while let Some(k) = key.filter(|k| k.local_level <= max_level) {
            if let Some(slot) = self.index.get(&k) {
                return Some((*slot, k.local_level));
            }
            key = k.parent();
        }
        None
    }

    pub fn key(&self, slot: u32) -> Option<PageKey> {
        self.slots.get(slot as usize).and_then(|s| s.key)
    }
    pub fn local_tile(&self, slot: u32) -> Option<LocalTile> {
        self.key(slot).map(|k| k.tile())
    }
    pub fn local_level(&self, slot: u32) -> Option<u8> {
        self.key(slot).map(|k| k.local_level)
    }

    pub fn lock_count(&self, slot: u32) -> u32 {
        self.slots.get(slot as usize).map_or(0, |s| s.lock_count)
    }
    pub fn is_locked(&self, slot: u32) -> bool {
        self.lock_count(slot) > 0
    }
    pub fn is_mapped(&self, slot: u32) -> bool {
        self.slots
            .get(slot as usize)
            .is_some_and(|s| !s.mappings.is_empty())
    }
    pub fn mappings(&self, slot: u32) -> &[PageMapping] {
        self.slots
            .get(slot as usize)
            .map_or(&[], |s| s.mappings.as_slice())
    }

    pub fn num_allocated(&self) -> u32 {
        self.index.len() as u32
    }
    pub fn num_locked(&self) -> u32 {
        self.slots.iter().filter(|s| s.lock_count > 0).count() as u32
    }
    pub fn num_mapped(&self) -> u32 {
        self.slots.iter().filter(|s| !s.mappings.is_empty()).count() as u32
    }

    pub fn recency_stamp(&self, slot: u32) -> Option<u32> {
        let recency = self.recency.lock().unwrap_or_else(|e| e.into_inner());
        recency.stamps.get(slot as usize).copied().flatten()
    }

    /// The slot [`PagePool::alloc`] would evict at `frame`.
    fn eviction_candidate(&self, recency: &Recency, frame: u32) -> Option<u32> {
        for &(stamp, slot) in &recency.order {
            let entry = &self.slots[slot as usize];
            if entry.lock_count > 0 || entry.allocated_frame == Some(frame) {
                continue;
            }
            //order is by stamp, so nothing after this is evictable either
            return self.policy.evictable(stamp, frame).then_some(slot);
        }
        None
    }

    /// Whether [`PagePool::alloc`] can succeed at `frame`.
    pub fn any_free_available(&self, frame: u32) -> bool {
        if !self.free.is_empty() {
            return true;
        }
        let recency = self.recency.lock().unwrap_or_else(|e| e.into_inner());
        self.eviction_candidate(&recency, frame).is_some()
    }

    fn unmap_slot<T: PageTables + ?Sized>(&mut self, tables: &mut T, slot: u32) {
        let physical = PhysicalAddress {
            physical_space: self.id,
            slot,
        };
        for mapping in self.slots[slot as usize].mappings.drain(..) {
            tables.unmap(mapping, physical);
        }
    }

    /**
    Allocates a slot for `key`, evicting the least recently used unlocked slot if none is free.

    Free slots are taken lowest index first.  Eviction picks the oldest recency stamp, ties
    broken by lowest slot index, and skips slots inside the policy's hysteresis window as well
    as slots allocated at `frame`.
    The evicted slot's page-table entries are removed first.

    If `key` is already resident its slot is returned (and locked, if `lock`).
    */
    pub fn alloc<T: PageTables + ?Sized>(
        &mut self,
        tables: &mut T,
        frame: u32,
        key: PageKey,
        lock: bool,
    ) -> Result<u32, PoolError> {
        if let Some(&slot) = self.index.get(&key) {
            if lock {
                self.slots[slot as usize].lock_count += 1;
            }
            self.recency_mut().touch(frame, slot);
            return Ok(slot);
        }
        let slot = match self.free.pop_first() {
            Some(slot) => slot,
            None => {
                let candidate = {
                    let recency = self.recency.lock().unwrap_or_else(|e| e.into_inner());
                    self.eviction_candidate(&recency, frame)
                };
                let slot = candidate.ok_or(PoolError::NoEvictableSlot(self.id))?;
                self.unmap_slot(tables, slot);
                if let Some(old) = self.slots[slot as usize].key.take() {
                    self.index.remove(&old);
                }
                slot
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.key = Some(key);
        entry.allocated_frame = Some(frame);
        entry.lock_count = u32::from(lock);
        debug_assert!(entry.mappings.is_empty());
        self.index.insert(key, slot);
        self.recency_mut().insert(frame, slot);
        Ok(slot)
    }

    /// Returns `slot` to the free list after removing its page-table entries.
    pub fn free<T: PageTables + ?Sized>(&mut self, tables: &mut T, slot: u32) -> Result<(), PoolError> {
        let entry = self.slot(slot)?;
        if entry.lock_count > 0 {
            return Err(PoolError::SlotLocked(slot));
        }
        self.release_slot(tables, slot);
        Ok(())
    }

    fn release_slot<T: PageTables + ?Sized>(&mut self, tables: &mut T, slot: u32) {
        self.unmap_slot(tables, slot);
        let entry = &mut self.slots[slot as usize];
        entry.lock_count = 0;
        entry.allocated_frame = None;
        if let Some(key) = entry.key.take() {
            self.index.remove(&key);
        }
        self.recency_mut().remove(slot);
        self.free.insert(slot);
    }

    pub fn lock(&mut self, slot: u32) -> Result<(), PoolError> {
        self.slot_mut(slot)?.lock_count += 1;
        Ok(())
    }

    /// Drops one lock.  The slot's recency becomes `frame`, so it is not evicted immediately.
    pub fn unlock(&mut self, frame: u32, slot: u32) -> Result<(), PoolError> {
        let entry = self.slot_mut(slot)?;
        if entry.lock_count == 0 {
            return Err(PoolError::SlotNotLocked(slot));
        }
        entry.lock_count -= 1;
        self.recency_mut().touch(frame, slot);
        Ok(())
    }

    /**
    Points a page-table entry at `slot`.

    `mapped_level` is the virtual level the tile content corresponds to, which is coarser
    than `mapping.v_level` when a lower-resolution producer backs the entry.
    */
    pub fn map_page<T: PageTables + ?Sized>(
        &mut self,
        tables: &mut T,
        mapping: PageMapping,
        mapped_level: u8,
        slot: u32,
    ) -> Result<(), MapError> {
        if self.slot(slot).is_err() {
            return Err(MapError::StaleSlot(slot));
        }
        tables.map(
            mapping,
            PhysicalAddress {
                physical_space: self.id,
                slot,
            },
            mapped_level,
        )?;
        let mappings = &mut self.slots[slot as usize].mappings;
        if !mappings.contains(&mapping) {
            mappings.push(mapping);
        }
        Ok(())
    }

    /// Drops the record of `mapping` after its page-table entry was removed by someone else.
    pub fn forget_mapping(&mut self, slot: u32, mapping: &PageMapping) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            entry.mappings.retain(|m| m != mapping);
        }
    }

    pub fn update_usage(&self, frame: u32, slot: u32) {
        let mut recency = self.recency.lock().unwrap_or_else(|e| e.into_inner());
        recency.touch(frame, slot);
    }

    /**
    Touches many slots under one acquisition of the recency lock.

    When `block` is false and the lock is contended, nothing is touched and `false` is
    returned.
    */
    pub fn update_usage_batch(
        &self,
        frame: u32,
        slots: impl IntoIterator<Item = u32>,
        block: bool,
    ) -> bool {
        let mut recency = if block {
            self.recency.lock().unwrap_or_else(|e| e.into_inner())
        } else {
            match self.recency.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => return false,
            }
        };
        for slot in slots {
            recency.touch(frame, slot);
        }
        true
    }

    /**
    Evicts the tiles of `producer` that intersect `region` (in level-0 tiles of the
    producer) at levels up to `max_level`.

    Locked tiles stay resident and are added to `locked`.  The page-table entries of evicted
    tiles are appended to `unmapped`.
    */
    pub fn evict_pages<T: PageTables + ?Sized>(
        &mut self,
        tables: &mut T,
        producer: ProducerHandle,
        region: TileRegion,
        max_level: u8,
        locked: &mut BTreeSet<LocalTile>,
        unmapped: &mut Vec<PageMapping>,
    ) {
        let matching: Vec<u32> = self
            .index
            .iter()
            .filter(|(key, _)| key.producer == producer && key.local_level <= max_level)
            .filter(|(key, _)| {
                let (x, y) = crate::bittricks::morton_xy(key.local_address);
                region.intersects_tile(x, y, key.local_level)
            })
            .map(|(_, slot)| *slot)
            .collect();
        for slot in matching {
            let entry = &self.slots[slot as usize];
            if entry.lock_count > 0 {
                if let Some(key) = entry.key {
                    locked.insert(key.tile());
                }
            } else {
                unmapped.extend_from_slice(&entry.mappings);
                self.release_slot(tables, slot);
            }
        }
    }

    /// Evicts every unlocked tile.
    pub fn evict_all_pages<T: PageTables + ?Sized>(&mut self, tables: &mut T) {
        let unlocked: Vec<u32> = self
            .index
            .values()
            .copied()
            .filter(|slot| self.slots[*slot as usize].lock_count == 0)
            .collect();
        for slot in unlocked {
            self.release_slot(tables, slot);
        }
    }

    pub fn get_all_locked_pages(&self, out: &mut BTreeSet<LocalTile>) {
        for entry in &self.slots {
            if entry.lock_count > 0 {
                if let Some(key) = entry.key {
                    out.insert(key.tile());
                }
            }
        }
    }

    /// Frees every slot of `producer`, locked or not.  Returns how many were freed.
    pub fn evict_producer<T: PageTables + ?Sized>(&mut self, tables: &mut T, producer: ProducerHandle) -> usize {
        let owned: Vec<u32> = self
            .index
            .iter()
            .filter(|(key, _)| key.producer == producer)
            .map(|(_, slot)| *slot)
            .collect();
        for slot in &owned {
            self.release_slot(tables, *slot);
        }
        owned.len()
    }

    /// Allocated slots in slot order.
    pub fn allocated(&self) -> impl Iterator<Item = (u32, PageKey)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.key.map(|k| (i as u32, k)))
    }
}
