//! Per-Queue State: one instance per logical queue, holding the buffer and
//! image access maps for every resource the queue has touched, plus a
//! mutex-protected "awaiting forgets" list so that destroy callbacks running
//! on any thread can asynchronously request a handle's removal.
//!
//! Grounded on `graal`'s per-context `resources: ResourceMap` combined with
//! the forget/cleanup path of `Context::cleanup_resources`, split one per
//! queue (graal tracks resources globally; this crate tracks
//! them per queue, since a buffer/image's access history only matters to the
//! queue currently synchronizing against it).

use crate::access_map::{BufferAccessMap, ImageAccessMap};
use crate::resource::{BufferId, ImageAccessRange, ImageId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-queue tracked state for one live buffer or image.
pub struct PerQueueState {
    buffers: HashMap<BufferId, BufferAccessMap>,
    images: HashMap<ImageId, ImageAccessMap>,
    awaiting_forgets: Mutex<Vec<ResourceHandle>>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResourceHandle {
    Buffer(BufferId),
    Image(ImageId),
}

impl Default for PerQueueState {
    fn default() -> Self {
        PerQueueState { buffers: HashMap::new(), images: HashMap::new(), awaiting_forgets: Mutex::new(Vec::new()) }
    }
}

impl PerQueueState {
    pub fn new() -> PerQueueState {
        Default::default()
    }

    pub fn buffer_map(&mut self, id: BufferId) -> &mut BufferAccessMap {
        self.buffers.entry(id).or_insert_with(|| BufferAccessMap::new(id))
    }

    pub fn image_map(&mut self, id: ImageId, whole_range: ImageAccessRange) -> &mut ImageAccessMap {
        self.images.entry(id).or_insert_with(|| ImageAccessMap::new(id, whole_range))
    }

    pub fn has_buffer(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn has_image(&self, id: ImageId) -> bool {
        self.images.contains_key(&id)
    }

    /// Called by any thread (typically a deferred-destructor callback) to
    /// request that `handle` be dropped from this queue's state; actually
    /// removed at the start of the next submit via `drain_forgets`.
    pub fn request_forget(&self, handle: ResourceHandle) {
        self.awaiting_forgets.lock().unwrap().push(handle);
    }

    /// Drains and applies every pending forget request. Must be called by
    /// the thread that owns this queue's submit critical section, before
    /// recording any new job against this state.
    pub fn drain_forgets(&mut self) {
        let pending: Vec<_> = std::mem::take(&mut *self.awaiting_forgets.lock().unwrap());
        for handle in pending {
            match handle {
                ResourceHandle::Buffer(id) => {
                    self.buffers.remove(&id);
                }
                ResourceHandle::Image(id) => {
                    self.images.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn forget_is_deferred_until_drained() {
        let mut state = PerQueueState::new();
        let mut keys: SlotMap<crate::resource::ResourceId, ()> = SlotMap::with_key();
        let id = BufferId(keys.insert(()));
        state.buffer_map(id);
        assert!(state.has_buffer(id));

        state.request_forget(ResourceHandle::Buffer(id));
        assert!(state.has_buffer(id));

        state.drain_forgets();
        assert!(!state.has_buffer(id));
    }
}
