//! Cross-Queue Synchronizer: a device-wide registry of exported resource
//! accesses, broadcast by the producing queue and consumed by any other
//! queue that later touches the same resource.
//!
//! Grounded on `graal`'s `xq_sync_table` (documented at the top of
//! `context/mod.rs` and mutated in `context/frame.rs`'s
//! `add_memory_dependency`), generalized from graal's single global frame
//! model to per-job timestamps.

use crate::resource::{BufferId, ImageId, Layout, ResourceAccess};
use crate::timestamp::JobSemaphore;
use std::collections::{HashMap, VecDeque};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResourceHandle {
    Buffer(BufferId),
    Image(ImageId),
}

/// A promise that, after `semaphore` is reached, a resource range is in
/// `access` (and, for images, `layout`), currently owned by `current_family`
/// with an intended consumer of `dst_family`.
#[derive(Clone, Debug)]
pub struct ExportEntry {
    pub handle: ResourceHandle,
    pub semaphore: JobSemaphore,
    pub access: ResourceAccess,
    pub layout: Option<Layout>,
    pub current_family: u32,
    pub dst_family: u32,
    /// Set once a consumer has observed this entry via `query_incoming`.
    pub transferred: bool,
}

const CACHE_CAPACITY: usize = 1024;

/// A (source queue, from-timestamp exclusive, to-timestamp inclusive] window
/// to search for incoming exports.
#[derive(Copy, Clone, Debug)]
pub struct Period {
    pub queue: usize,
    pub from_exclusive: u64,
    pub to_inclusive: u64,
}

pub struct CrossQueueSynchronizer {
    entries: HashMap<ResourceHandle, Vec<ExportEntry>>,
    /// Time-sorted bounded cache of the most recent broadcasts, letting
    /// `query_incoming` skip resources that could not possibly have been
    /// exported in the queried window.
    cache: VecDeque<(JobSemaphore, ResourceHandle)>,
}

impl Default for CrossQueueSynchronizer {
    fn default() -> Self {
        CrossQueueSynchronizer { entries: HashMap::new(), cache: VecDeque::new() }
    }
}

impl CrossQueueSynchronizer {
    pub fn new() -> CrossQueueSynchronizer {
        Default::default()
    }

    /// Removes any existing entry for `handle` whose range is fully
    /// contained in the new export (newer entries dominate older,
    /// range-subsumed ones), appends the new entry, and inserts it into the
    /// time-sorted cache, evicting the oldest entry if full.
    pub fn broadcast_export(
        &mut self,
        handle: ResourceHandle,
        semaphore: JobSemaphore,
        access: ResourceAccess,
        layout: Option<Layout>,
        current_family: u32,
        dst_family: u32,
    ) {
        let list = self.entries.entry(handle).or_insert_with(Vec::new);
        list.retain(|e| e.semaphore.timestamp() > semaphore.timestamp() || e.semaphore.queue() != semaphore.queue());
        list.push(ExportEntry {
            handle,
            semaphore,
            access,
            layout,
            current_family,
            dst_family,
            transferred: false,
        });

        if self.cache.len() >= CACHE_CAPACITY {
            self.cache.pop_front();
        }
        self.cache.push_back((semaphore, handle));
    }

    /// Erases every entry for `handle`; returns the list of per-queue
    /// forget requests the caller must dispatch (one per `PerQueueState`).
    pub fn broadcast_forget(&mut self, handle: ResourceHandle) {
        self.entries.remove(&handle);
        self.cache.retain(|&(_, h)| h != handle);
    }

    /// Returns every export entry whose semaphore falls within one of
    /// `periods` and whose destination family is `dst_family`, marking each
    /// as transferred (its current family becomes `dst_family`) so a later
    /// query never returns it again.
    pub fn query_incoming(&mut self, periods: &[Period], dst_family: u32) -> Vec<ExportEntry> {
        let cache_covers_all = periods.iter().all(|p| {
            self.cache
                .iter()
                .any(|&(sem, _)| sem.queue() == p.queue && sem.timestamp() > p.from_exclusive)
                || self.cache.is_empty()
        });

        let mut out = Vec::new();
        // Resource handles that could plausibly match, derived from the
        // cache when it covers the queried window; otherwise fall back to a
        // full scan of the map.
        let candidate_handles: Vec<ResourceHandle> = if cache_covers_all {
            self.cache.iter().map(|&(_, h)| h).collect()
        } else {
            self.entries.keys().copied().collect()
        };

        for handle in candidate_handles {
            if let Some(list) = self.entries.get_mut(&handle) {
                for entry in list.iter_mut() {
                    if entry.transferred || entry.dst_family != dst_family {
                        continue;
                    }
                    let matches = periods.iter().any(|p| {
                        p.queue == entry.semaphore.queue()
                            && entry.semaphore.timestamp() > p.from_exclusive
                            && entry.semaphore.timestamp() <= p.to_inclusive
                    });
                    if matches {
                        entry.transferred = true;
                        entry.current_family = dst_family;
                        out.push(entry.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{AccessFlags, PipelineStageFlags};
    use slotmap::SlotMap;

    fn buffer_handle() -> ResourceHandle {
        let mut keys: SlotMap<crate::resource::ResourceId, ()> = SlotMap::with_key();
        ResourceHandle::Buffer(BufferId(keys.insert(())))
    }

    #[test]
    fn export_is_returned_exactly_once() {
        let mut sync = CrossQueueSynchronizer::new();
        let handle = buffer_handle();
        let sem = JobSemaphore::new(0, 10);
        sync.broadcast_export(
            handle,
            sem,
            ResourceAccess { stage_mask: PipelineStageFlags::TRANSFER, access_mask: AccessFlags::TRANSFER_READ },
            None,
            0,
            1,
        );

        let periods = [Period { queue: 0, from_exclusive: 0, to_inclusive: 20 }];
        let first = sync.query_incoming(&periods, 1);
        assert_eq!(first.len(), 1);
        assert!(first[0].transferred);

        let second = sync.query_incoming(&periods, 1);
        assert!(second.is_empty());
    }

    #[test]
    fn forget_erases_all_entries() {
        let mut sync = CrossQueueSynchronizer::new();
        let handle = buffer_handle();
        let sem = JobSemaphore::new(0, 5);
        sync.broadcast_export(
            handle,
            sem,
            ResourceAccess { stage_mask: PipelineStageFlags::TRANSFER, access_mask: AccessFlags::TRANSFER_READ },
            None,
            0,
            1,
        );
        sync.broadcast_forget(handle);
        let periods = [Period { queue: 0, from_exclusive: 0, to_inclusive: 100 }];
        assert!(sync.query_incoming(&periods, 1).is_empty());
    }
}
