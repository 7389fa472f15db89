// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Reading the GPU feedback buffer.

The renderer writes one encoded page per sampled texel (see [`crate::bittricks::encode_page`]).
[`FeedbackAnalyzer`] splits the buffer into contiguous shards, reduces each to a
[`UniquePageList`] in parallel and merges the shards in order.
*/

use std::sync::Arc;

use some_executor::hint::Hint;

use crate::Priority;
use crate::bittricks::EMPTY_FEEDBACK;
use crate::requests::unique_page_list::UniquePageList;

/**
A source of feedback.

[`FeedbackReadback::map`] is called once per update.  The data is copied out before
[`FeedbackReadback::unmap`] is called, so the mapping is released before any analysis runs.
*/
pub trait FeedbackReadback {
    /// The feedback for this frame, or `None` if nothing is ready.
    fn map(&mut self) -> Option<&[u32]>;
    fn unmap(&mut self);
}

/// Feedback that never has anything ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeedback;

impl FeedbackReadback for NoFeedback {
    fn map(&mut self) -> Option<&[u32]> {
        None
    }
    fn unmap(&mut self) {}
}

/// Feedback pushed from CPU memory.  Each pushed buffer is read once.
#[derive(Debug, Default, Clone)]
pub struct VecFeedback {
    buffer: Vec<u32>,
    mapped: bool,
}

impl VecFeedback {
    pub fn new() -> Self {
        Self::default()
    }
    /// Replaces the buffer the next update reads.
    pub fn push(&mut self, buffer: Vec<u32>) {
        self.buffer = buffer;
    }
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

impl FeedbackReadback for VecFeedback {
    fn map(&mut self) -> Option<&[u32]> {
        if self.buffer.is_empty() {
            return None;
        }
        self.mapped = true;
        Some(&self.buffer)
    }
    fn unmap(&mut self) {
        self.mapped = false;
        self.buffer.clear();
    }
}

/**
Reduces one shard.

Empty texels are skipped.  Runs of one page are common (neighbouring texels sample the same
page) and are added as a single weighted entry.
*/
pub fn analyze_range(buffer: &[u32], list: &mut UniquePageList) {
    let mut iter = buffer.iter().copied().filter(|p| *p != EMPTY_FEEDBACK).peekable();
    while let Some(page) = iter.next() {
        let mut count: u32 = 1;
        while iter.peek() == Some(&page) {
            iter.next();
            count += 1;
        }
        list.add(page, count.min(u16::MAX as u32) as u16);
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackAnalyzer {
    tasks: usize,
    strategy: vec_parallel::Strategy,
    priority: Priority,
}

impl FeedbackAnalyzer {
    pub fn new(tasks: usize, strategy: vec_parallel::Strategy, priority: Priority) -> Self {
        FeedbackAnalyzer {
            tasks: tasks.max(1),
            strategy,
            priority,
        }
    }

    pub async fn analyze(&self, buffer: Arc<[u32]>) -> UniquePageList {
        let len = buffer.len();
        if len == 0 {
            return UniquePageList::new();
        }
        let per_task = len.div_ceil(self.tasks);
        let shards = len.div_ceil(per_task);
        logwise::trace_sync!(
            "analyzing {len} feedback texels in {shards} shards",
            len = len,
            shards = shards
        );
        let shard_buffer = buffer.clone();
        let build = vec_parallel::build_vec(shards, self.strategy.clone(), move |shard| {
            let start = shard * per_task;
            let end = (start + per_task).min(shard_buffer.len());
            let mut list = UniquePageList::new();
            analyze_range(&shard_buffer[start..end], &mut list);
            list
        });
        let mut executor = some_executor::current_executor::current_executor();
        let perf = logwise::perfwarn_begin!("FeedbackAnalyzer::analyze join");
        let lists = build.spawn_on(&mut executor, self.priority, Hint::CPU).await;
        drop(perf);
        let mut merged = UniquePageList::new();
        for list in &lists {
            merged.merge(list);
        }
        merged
    }
}
