// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Batches recency touches from a gather worker.

Each gather shard keeps one buffer per physical space.  Touches accumulate until the
configured flush count is reached; from then on every new touch tries to take the pool's
recency lock without blocking and applies the whole batch.  Only a full buffer blocks.
*/

use crate::cache::page_pool::PagePool;
use crate::config::PAGE_UPDATE_BUFFER_CAPACITY;

#[derive(Debug)]
pub struct PageUpdateBuffer {
    pending: Vec<u32>,
    previous: Option<u32>,
    num_page_updates: u32,
    working_set_size: u32,
}

impl Default for PageUpdateBuffer {
    fn default() -> Self {
        PageUpdateBuffer {
            pending: Vec::with_capacity(PAGE_UPDATE_BUFFER_CAPACITY),
            previous: None,
            num_page_updates: 0,
            working_set_size: 0,
        }
    }
}

impl PageUpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a touch of `slot`.  Consecutive touches of one slot collapse.
    pub fn add(&mut self, pool: &PagePool, frame: u32, flush_count: usize, slot: u32) {
        if self.previous == Some(slot) {
            return;
        }
        self.previous = Some(slot);

        let len = self.pending.len();
        if len >= flush_count {
            let block = len >= PAGE_UPDATE_BUFFER_CAPACITY;
            let batch = self.pending.iter().copied().chain(std::iter::once(slot));
            if pool.update_usage_batch(frame, batch, block) {
                self.num_page_updates += len as u32 + 1;
                self.pending.clear();
                return;
            }
        }
        debug_assert!(self.pending.len() < PAGE_UPDATE_BUFFER_CAPACITY);
        self.pending.push(slot);
    }

    /// Applies everything still pending, blocking on the pool's lock.
    pub fn flush(&mut self, pool: &PagePool, frame: u32) {
        if self.pending.is_empty() {
            return;
        }
        pool.update_usage_batch(frame, self.pending.iter().copied(), true);
        self.num_page_updates += self.pending.len() as u32;
        self.pending.clear();
    }

    pub fn add_working_set(&mut self, count: u32) {
        self.working_set_size += count;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
    /// Touches applied so far.
    pub fn num_page_updates(&self) -> u32 {
        self.num_page_updates
    }
    pub fn working_set_size(&self) -> u32 {
        self.working_set_size
    }
}
