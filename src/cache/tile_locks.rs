// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Explicit lock counts per producer-local tile.

This is the caller-facing side of locking: a tile with a nonzero count here is pinned in
every physical group of its producer once it is resident.
*/

use std::collections::BTreeMap;

use crate::producer::ProducerHandle;
use crate::tile::LocalTile;

#[derive(Debug, Default)]
pub struct TileLocks {
    counts: BTreeMap<LocalTile, u32>,
}

impl TileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lock.  Returns `true` if the tile was not locked before.
    pub fn lock(&mut self, tile: LocalTile) -> bool {
        let count = self.counts.entry(tile).or_insert(0);
        *count += 1;
        *count == 1
    }

    /**
    Removes a lock.  Returns `true` if this was the last one.

    Unlocking a tile that is not locked returns `false` and changes nothing.
    */
    pub fn unlock(&mut self, tile: LocalTile) -> bool {
        match self.counts.get_mut(&tile) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&tile);
                true
            }
            None => false,
        }
    }

    pub fn is_locked(&self, tile: &LocalTile) -> bool {
        self.counts.contains_key(tile)
    }

    pub fn lock_count(&self, tile: &LocalTile) -> u32 {
        self.counts.get(tile).copied().unwrap_or(0)
    }

    /// Removes every lock of `producer`, returning the tiles that were locked.
    pub fn force_unlock_all(&mut self, producer: ProducerHandle) -> Vec<LocalTile> {
        let tiles: Vec<LocalTile> = self
            .counts
            .keys()
            .filter(|t| t.producer == producer)
            .copied()
            .collect();
        for tile in &tiles {
            self.counts.remove(tile);
        }
        tiles
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::page_pool::tests::handles;

    #[test]
    fn counts_nest() {
        let p = handles(1)[0];
        let tile = LocalTile::new(p, 5, 1);
        let mut locks = TileLocks::new();
        assert!(locks.lock(tile));
        assert!(!locks.lock(tile));
        assert!(!locks.unlock(tile));
        assert!(locks.is_locked(&tile));
        assert!(locks.unlock(tile));
        assert!(!locks.is_locked(&tile));
        assert!(!locks.unlock(tile));
    }

    #[test]
    fn force_unlock_is_per_producer() {
        let producers = handles(2);
        let mut locks = TileLocks::new();
        locks.lock(LocalTile::new(producers[0], 0, 0));
        locks.lock(LocalTile::new(producers[0], 0, 0));
        locks.lock(LocalTile::new(producers[0], 1, 0));
        locks.lock(LocalTile::new(producers[1], 0, 0));
        let released = locks.force_unlock_all(producers[0]);
        assert_eq!(released.len(), 2);
        assert_eq!(locks.len(), 1);
    }
}
