// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Adaptive virtual textures.

An adaptive virtual texture owns a whole space and allocates smaller textures inside it on
demand.  Feedback for the coarsest levels of its space carries allocation requests rather
than ordinary tile requests; the gatherer hands those pages to the adaptive texture, which
packs them into opaque values and receives them back, de-duplicated, after the merge.
*/

/// Registered per space with [`crate::VirtualTextureSystem::register_adaptive`].
pub trait AdaptiveVirtualTexture: Send + Sync {
    /**
    Called from gather workers for feedback at level 0 of the space (`level_plus_one` 0 or 1).

    Returns a packed request to queue, or `None` if the page needs no allocation.
    */
    fn packed_allocation_request(&self, v_address: u32, level_plus_one: u8, frame: u32) -> Option<u32>;

    /// Receives the merged requests of one update.
    fn queue_allocation_requests(&self, requests: &[u32], frame: u32);

    /// Called at the start of every update, before feedback is read.
    fn update_allocations(&self, frame: u32);
}
