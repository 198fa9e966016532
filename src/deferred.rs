//! Deferred Destructor: one FIFO per destructible native handle kind,
//! draining handles whose enqueue timestamp has been reached on every
//! queue.
//!
//! Grounded on `graal`'s `DeviceObjects`/`ZombieList` pattern
//! (`device.rs`'s `ZombieList<T>` and the `destroy_on_frame_completed`
//! family of methods) generalized from per-frame draining to the explicit
//! Timeline Manager frontier.

use std::collections::VecDeque;

/// A single FIFO of handles of one kind, ordered by the (monotonic)
/// timestamp at which they were queued for destruction.
struct ZombieQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> Default for ZombieQueue<T> {
    fn default() -> Self {
        ZombieQueue { entries: VecDeque::new() }
    }
}

impl<T> ZombieQueue<T> {
    fn push(&mut self, timestamp: u64, handle: T) {
        debug_assert!(self.entries.back().map_or(true, |&(t, _)| timestamp >= t));
        self.entries.push_back((timestamp, handle));
    }

    /// Pops every entry whose timestamp is <= `ts`, in FIFO (and therefore
    /// timestamp) order.
    fn drain_up_to(&mut self, ts: u64) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(&(t, _)) = self.entries.front() {
            if t <= ts {
                out.push(self.entries.pop_front().unwrap().1);
            } else {
                break;
            }
        }
        out
    }
}

/// Kinds of native object that are safe to destroy immediately regardless of
/// outstanding device work, because they are "cold metadata" with no
/// interaction with in-flight command buffers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImmediateDestroyKind {
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    PipelineCache,
    DescriptorUpdateTemplate,
}

/// Kinds of native object whose destruction must wait for the Timeline
/// Manager to report their enqueue timestamp reached on every queue.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Ord, PartialOrd)]
pub enum DeferredKind {
    Buffer,
    Image,
    ImageView,
    BufferView,
    Sampler,
    Pipeline,
    Framebuffer,
    DescriptorSet,
    Semaphore,
    CommandPool,
    MemoryAllocation,
}

const DEFERRED_KIND_COUNT: usize = 11;

fn kind_index(kind: DeferredKind) -> usize {
    kind as usize
}

/// A type-erased native handle paired with its kind, used by queue entries
/// and delivered back to the caller-supplied destroy function.
pub struct ZombieHandle {
    pub kind: DeferredKind,
    pub raw: u64,
}

/// Dispatches destruction of deferred handles by kind. Implemented by the
/// logical device: for resources it additionally forgets the handle from the
/// Cross-Queue Synchronizer, and for memory allocations it releases the
/// underlying allocator block.
pub trait DeferredDestroy {
    fn destroy_deferred(&self, kind: DeferredKind, raw: u64);
}

/// Maintains one FIFO per native handle kind.
pub struct DeferredDestructor {
    queues: Vec<ZombieQueue<u64>>,
}

impl Default for DeferredDestructor {
    fn default() -> Self {
        DeferredDestructor {
            queues: (0..DEFERRED_KIND_COUNT).map(|_| ZombieQueue::default()).collect(),
        }
    }
}

impl DeferredDestructor {
    pub fn new() -> DeferredDestructor {
        Default::default()
    }

    /// Appends `(handle, timestamp)` to the FIFO for `kind`.
    pub fn queue_for_destruction(&mut self, kind: DeferredKind, raw: u64, timestamp: u64) {
        self.queues[kind_index(kind)].push(timestamp, raw);
    }

    /// Pops every entry of every kind whose insertion timestamp is <= `ts`,
    /// invoking `destroyer.destroy_deferred` for each.
    pub fn destroy_up_to(&mut self, ts: u64, destroyer: &dyn DeferredDestroy) {
        for (i, q) in self.queues.iter_mut().enumerate() {
            let kind = ALL_KINDS[i];
            for raw in q.drain_up_to(ts) {
                destroyer.destroy_deferred(kind, raw);
            }
        }
    }

    /// Drains every queue unconditionally — used on shutdown, after waiting
    /// for device idle.
    pub fn destroy_all(&mut self, destroyer: &dyn DeferredDestroy) {
        self.destroy_up_to(u64::MAX, destroyer);
    }

    pub fn pending_count(&self, kind: DeferredKind) -> usize {
        self.queues[kind_index(kind)].entries.len()
    }
}

const ALL_KINDS: [DeferredKind; DEFERRED_KIND_COUNT] = [
    DeferredKind::Buffer,
    DeferredKind::Image,
    DeferredKind::ImageView,
    DeferredKind::BufferView,
    DeferredKind::Sampler,
    DeferredKind::Pipeline,
    DeferredKind::Framebuffer,
    DeferredKind::DescriptorSet,
    DeferredKind::Semaphore,
    DeferredKind::CommandPool,
    DeferredKind::MemoryAllocation,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recorder(RefCell<Vec<(DeferredKind, u64)>>);
    impl DeferredDestroy for Recorder {
        fn destroy_deferred(&self, kind: DeferredKind, raw: u64) {
            self.0.borrow_mut().push((kind, raw));
        }
    }

    #[test]
    fn destroy_up_to_is_fifo_per_kind_and_respects_timestamp() {
        let mut dd = DeferredDestructor::new();
        dd.queue_for_destruction(DeferredKind::Buffer, 1, 10);
        dd.queue_for_destruction(DeferredKind::Buffer, 2, 20);
        dd.queue_for_destruction(DeferredKind::Image, 3, 5);

        let rec = Recorder(RefCell::new(Vec::new()));
        dd.destroy_up_to(10, &rec);
        assert_eq!(rec.0.borrow().as_slice(), &[(DeferredKind::Image, 3), (DeferredKind::Buffer, 1)]);
        assert_eq!(dd.pending_count(DeferredKind::Buffer), 1);

        dd.destroy_up_to(20, &rec);
        assert_eq!(dd.pending_count(DeferredKind::Buffer), 0);
    }

    #[test]
    fn destroy_all_drains_everything() {
        let mut dd = DeferredDestructor::new();
        dd.queue_for_destruction(DeferredKind::Semaphore, 7, 1_000_000);
        let rec = Recorder(RefCell::new(Vec::new()));
        dd.destroy_all(&rec);
        assert_eq!(dd.pending_count(DeferredKind::Semaphore), 0);
    }
}
