//! Tephra: a mid-level job execution engine sitting above a Vulkan-class
//! explicit graphics API. Callers record [`job::Job`]s against a queue with
//! a [`job::recorder::JobRecorder`], enqueue them, and periodically call
//! [`Engine::submit_queued_jobs`] to compile and submit whatever has
//! accumulated; the engine tracks resource accesses per queue and inserts
//! pipeline barriers and queue-family-ownership transfers automatically.
//!
//! Grounded on `graal`'s top-level `Context` (`context/mod.rs`), generalized
//! from "one context driving one frame of passes" to "N independent queues
//! each driving their own stream of jobs".

pub mod access_map;
pub mod barrier;
pub mod debug;
pub mod deferred;
pub mod error;
pub(crate) mod handle;
pub mod job;
pub mod pool;
pub mod queue_state;
pub mod resource;
pub mod stats;
pub mod submission;
pub mod timeline;
pub mod timestamp;
pub mod transient;
pub mod xqsync;

use crate::debug::{default_handler, SharedDebugHandler};
use crate::deferred::{DeferredDestroy, DeferredDestructor};
use crate::job::recorder::JobRecorder;
use crate::job::Job;
use crate::queue_state::PerQueueState;
use crate::submission::{NativeApi, QueueSubmitter, ResourceResolver};
use crate::timeline::TimelineManager;
use crate::timestamp::JobSemaphore;
use crate::xqsync::CrossQueueSynchronizer;
use std::time::Duration;

/// Hard upper bound on the number of queues a single engine can drive.
/// [`timestamp::JobSemaphore`] and [`timestamp::Timestamps`] pack a queue
/// index into their representations and rely on this bound.
pub const MAX_QUEUES: usize = 4;

/// A job drawn from a queue's pool together with its recorder, returned by
/// [`Engine::begin_job`] and handed back to [`Engine::enqueue_job`] once
/// recording is finished.
pub struct JobHandle {
    queue_index: usize,
    job: Box<Job>,
}

impl JobHandle {
    /// Borrows a recorder for the job this handle owns.
    pub fn recorder(&mut self) -> JobRecorder<'_> {
        JobRecorder::new(&mut self.job)
    }

    pub fn set_small(&mut self, small: bool) {
        if small {
            self.job.flags |= crate::job::JobFlags::SMALL;
        } else {
            self.job.flags -= crate::job::JobFlags::SMALL;
        }
    }

    pub fn wait_job_semaphore(&mut self, semaphore: JobSemaphore) {
        self.job.wait_job_semaphores.push(semaphore);
    }

    pub fn wait_external(&mut self, semaphore: crate::timestamp::ExternalSemaphore) {
        self.job.wait_external.push(semaphore);
    }

    pub fn signal_external(&mut self, semaphore: crate::timestamp::ExternalSemaphore) {
        self.job.signal_external.push(semaphore);
    }
}

/// Per-queue bookkeeping the engine needs in addition to what
/// [`QueueSubmitter`] already tracks: the job pool (jobs drawn from here and
/// returned once their signal timestamp has been reached) and the jobs
/// currently queued for the next submit.
struct QueueResources {
    submitter: QueueSubmitter,
    state: PerQueueState,
    free_jobs: Vec<Box<Job>>,
    queued: Vec<Box<Job>>,
    /// Jobs handed out to a submit batch, kept alive until their signal
    /// timestamp is reached so they can be returned to `free_jobs`.
    in_flight: Vec<Box<Job>>,
    next_pool_id: u64,
}

impl QueueResources {
    fn new(queue_family: u32, queue_index: usize) -> QueueResources {
        QueueResources {
            submitter: QueueSubmitter::new(queue_family, queue_index),
            state: PerQueueState::new(),
            free_jobs: Vec::new(),
            queued: Vec::new(),
            in_flight: Vec::new(),
            next_pool_id: 1,
        }
    }

    fn take_job(&mut self) -> Box<Job> {
        match self.free_jobs.pop() {
            Some(job) => job,
            None => {
                let id = self.next_pool_id;
                self.next_pool_id += 1;
                Box::new(Job::new(id))
            }
        }
    }

    fn reclaim_finished(&mut self, reached: u64) {
        let mut i = 0;
        while i < self.in_flight.len() {
            let signalled = self.in_flight[i].signal.map_or(true, |s| s.timestamp() <= reached);
            if signalled {
                let mut job = self.in_flight.remove(i);
                job.reset_for_reuse();
                self.free_jobs.push(job);
            } else {
                i += 1;
            }
        }
    }
}

/// Ties the Timeline Manager, Cross-Queue Synchronizer, Deferred Destructor,
/// and one [`QueueSubmitter`] per queue together behind the public job
/// submission API. Generic over the native backend so the engine can be
/// driven by a real `ash` device or, in tests, a recording fake.
pub struct Engine<A: NativeApi + ResourceResolver + DeferredDestroy> {
    api: A,
    timelines: TimelineManager,
    xqsync: CrossQueueSynchronizer,
    deferred: DeferredDestructor,
    debug: SharedDebugHandler,
    queues: Vec<QueueResources>,
}

impl<A: NativeApi + ResourceResolver + DeferredDestroy> Engine<A> {
    /// Builds an engine driving `queue_families[i]` on logical queue `i`.
    /// `semaphores` must already be initialized timeline semaphores, one per
    /// queue, matching `queue_families`'s length.
    pub fn new(api: A, queue_families: Vec<u32>, semaphores: Vec<ash::vk::Semaphore>) -> Engine<A> {
        assert!(queue_families.len() <= MAX_QUEUES);
        assert_eq!(queue_families.len(), semaphores.len());
        let queues = queue_families.iter().enumerate().map(|(i, &family)| QueueResources::new(family, i)).collect();
        Engine {
            api,
            timelines: TimelineManager::new(semaphores),
            xqsync: CrossQueueSynchronizer::new(),
            deferred: DeferredDestructor::new(),
            debug: default_handler(),
            queues,
        }
    }

    pub fn with_debug_handler(mut self, handler: SharedDebugHandler) -> Engine<A> {
        self.debug = handler;
        self
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Draws a job from `queue_index`'s pool and returns a handle to record
    /// commands against it. The job is not visible to `submit_queued_jobs`
    /// until passed to [`Engine::enqueue_job`].
    pub fn begin_job(&mut self, queue_index: usize) -> JobHandle {
        let job = self.queues[queue_index].take_job();
        JobHandle { queue_index, job }
    }

    /// Marks a recorded job ready to be picked up by the next
    /// `submit_queued_jobs` call on its queue.
    pub fn enqueue_job(&mut self, handle: JobHandle) {
        self.queues[handle.queue_index].queued.push(handle.job);
    }

    /// Compiles and submits every job queued on `queue_index` since the last
    /// call, returning each job's assigned signal semaphore in submission
    /// order. Reclaims finished command pools and job records first.
    pub fn submit_queued_jobs(&mut self, queue_index: usize) -> Vec<JobSemaphore> {
        let reached = self.timelines.last_reached(queue_index);
        self.deferred.destroy_up_to(reached, &self.api);
        {
            let q = &mut self.queues[queue_index];
            q.submitter.reclaim_completed_pools(&self.timelines, &self.api);
            q.reclaim_finished(reached);
        }

        let q = &mut self.queues[queue_index];
        if q.queued.is_empty() {
            return Vec::new();
        }
        let mut jobs: Vec<Box<Job>> = std::mem::take(&mut q.queued);
        let mut refs: Vec<&mut Job> = jobs.iter_mut().map(|b| &mut **b).collect();
        let signals = q.submitter.submit_jobs(&mut refs, &mut q.state, &mut self.xqsync, &self.timelines, &self.debug, &self.api, &self.api);
        q.in_flight.append(&mut jobs);
        signals
    }

    /// Blocks the calling thread until every semaphore in `semaphores` has
    /// been reached, or `timeout` elapses. Returns whether all were reached.
    pub fn wait_for_job_semaphores(&self, semaphores: &[JobSemaphore], timeout: Duration) -> bool {
        let handles: Vec<_> = semaphores.iter().map(|s| self.timelines.semaphore(s.queue())).collect();
        let values: Vec<_> = semaphores.iter().map(|s| s.timestamp()).collect();
        self.api.wait_semaphores(&handles, &values, true, timeout)
    }

    pub fn is_job_semaphore_signalled(&self, semaphore: JobSemaphore) -> bool {
        self.timelines.last_reached(semaphore.queue()) >= semaphore.timestamp()
    }

    pub fn debug_handler(&self) -> &SharedDebugHandler {
        &self.debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DeferredKind;
    use ash::vk;
    use ash::vk::Handle;
    use slotmap::SlotMap;
    use std::sync::Mutex;

    fn buffer_id() -> crate::resource::BufferId {
        let mut keys: SlotMap<crate::resource::ResourceId, ()> = SlotMap::with_key();
        crate::resource::BufferId(keys.insert(()))
    }

    #[derive(Default)]
    struct FakeApi {
        submits: Mutex<u32>,
    }

    impl NativeApi for FakeApi {
        fn create_command_pool(&self, _queue_family: u32) -> vk::CommandPool {
            unsafe { vk::CommandPool::from_raw(1) }
        }
        fn reset_command_pool(&self, _pool: vk::CommandPool) {}
        fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> vk::CommandBuffer {
            unsafe { vk::CommandBuffer::from_raw(1) }
        }
        fn begin_command_buffer(&self, _cb: vk::CommandBuffer) {}
        fn end_command_buffer(&self, _cb: vk::CommandBuffer) {}
        fn cmd_pipeline_barrier(
            &self,
            _cb: vk::CommandBuffer,
            _src: vk::PipelineStageFlags,
            _dst: vk::PipelineStageFlags,
            _buffer_barriers: &[vk::BufferMemoryBarrier],
            _image_barriers: &[vk::ImageMemoryBarrier],
        ) {
        }
        fn queue_submit(
            &self,
            _queue_family: u32,
            _queue_index: usize,
            _wait_semaphores: &[vk::Semaphore],
            _wait_values: &[u64],
            _wait_dst_stages: &[vk::PipelineStageFlags],
            _command_buffers: &[vk::CommandBuffer],
            _signal_semaphores: &[vk::Semaphore],
            _signal_values: &[u64],
        ) {
            *self.submits.lock().unwrap() += 1;
        }
        fn wait_semaphores(&self, _semaphores: &[vk::Semaphore], _values: &[u64], _wait_all: bool, _timeout: Duration) -> bool {
            true
        }
        fn destroy_deferred(&self, _kind: DeferredKind, _raw: u64) {}
    }

    impl ResourceResolver for FakeApi {
        fn buffer_handle(&self, _id: crate::resource::BufferId) -> vk::Buffer {
            vk::Buffer::null()
        }
        fn image_handle(&self, _id: crate::resource::ImageId) -> vk::Image {
            vk::Image::null()
        }
    }

    impl DeferredDestroy for FakeApi {
        fn destroy_deferred(&self, kind: DeferredKind, raw: u64) {
            NativeApi::destroy_deferred(self, kind, raw);
        }
    }

    #[test]
    fn engine_submits_a_recorded_job_and_tracks_its_semaphore() {
        let sem = unsafe { vk::Semaphore::from_raw(1) };
        let mut engine = Engine::new(FakeApi::default(), vec![0], vec![sem]);

        let mut handle = engine.begin_job(0);
        let buf = crate::resource::BufferRef::Resource(buffer_id());
        handle.recorder().fill_buffer(crate::resource::BufferView { buffer: buf, offset: 0, size: 16, format: None }, 0);
        engine.enqueue_job(handle);

        let signals = engine.submit_queued_jobs(0);
        assert_eq!(signals.len(), 1);
        assert!(signals[0].is_valid());
        assert!(!engine.is_job_semaphore_signalled(signals[0]));
    }

    #[test]
    fn submitting_with_no_queued_jobs_is_a_no_op() {
        let sem = unsafe { vk::Semaphore::from_raw(1) };
        let mut engine = Engine::new(FakeApi::default(), vec![0], vec![sem]);
        assert!(engine.submit_queued_jobs(0).is_empty());
    }
}
