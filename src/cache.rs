// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The physical side: bounded caches of tile slots.

* [`page_pool`] is the slot table with allocation, eviction, locking and mapping.
* [`physical_space`] wraps a pool with the description it was created for and shares it
  between producers.
* [`page_update_buffer`] batches recency touches from parallel gather workers.
* [`tile_locks`] tracks caller-requested locks on producer-local tiles.
*/

pub mod page_pool;
pub mod page_update_buffer;
pub mod physical_space;
pub mod tile_locks;
