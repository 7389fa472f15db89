// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
De-duplicated page requests.

Counts are weights for sorting, not exact tallies, and saturate at `u16::MAX`.
*/

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct UniquePageList {
    index: HashMap<u32, usize>,
    pages: Vec<u32>,
    counts: Vec<u16>,
}

impl UniquePageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `page` with `count`, or adds `count` to its existing entry.
    pub fn add(&mut self, page: u32, count: u16) {
        match self.index.get(&page) {
            Some(&i) => self.counts[i] = self.counts[i].saturating_add(count),
            None => {
                self.index.insert(page, self.pages.len());
                self.pages.push(page);
                self.counts.push(count);
            }
        }
    }

    /// Adds every entry of `other`, keeping this list's order for pages already present.
    pub fn merge(&mut self, other: &UniquePageList) {
        for (page, count) in other.iter() {
            self.add(page, count);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
    pub fn page(&self, i: usize) -> u32 {
        self.pages[i]
    }
    pub fn count(&self, i: usize) -> u16 {
        self.counts[i]
    }
    pub fn count_of(&self, page: u32) -> Option<u16> {
        self.index.get(&page).map(|i| self.counts[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.pages.iter().copied().zip(self.counts.iter().copied())
    }
}
