//! Queue Submission Driver: drains a queue's ready jobs, batches contiguous
//! small ones into a single submit entry, resolves each job's waits against
//! the Timeline Manager and Cross-Queue Synchronizer, drives the Job
//! Compiler to emit barriers and commands, and hands the result to the
//! native API.
//!
//! Grounded on `graal`'s `context/submission.rs`: `CommandAllocator` is the
//! same pool-recycling object rewritten against the `NativeApi` seam instead
//! of `ash::Device` directly, and the small-job batching below walks a
//! queue's jobs the way `submit_frame` walks a frame's passes into
//! `CommandBatch`es.

use crate::barrier::{Barrier, BarrierList};
use crate::debug::{DebugMessage, SharedDebugHandler};
use crate::deferred::DeferredKind;
use crate::job::compiler::{JobCompiler, PrimaryBufferRecorder};
use crate::job::{CommandNode, Job};
use crate::queue_state::PerQueueState;
use crate::resource::{BufferId, ImageId};
use crate::timeline::TimelineManager;
use crate::timestamp::JobSemaphore;
use crate::xqsync::{CrossQueueSynchronizer, Period};
use crate::MAX_QUEUES;
use ash::vk;
use std::collections::HashMap;
use std::time::Duration;

/// Resolves a tracked resource id to the native handle a barrier needs to
/// name. Implemented by the logical device, which is the only thing that
/// keeps resource id -> handle tables.
pub trait ResourceResolver {
    fn buffer_handle(&self, id: BufferId) -> vk::Buffer;
    fn image_handle(&self, id: ImageId) -> vk::Image;
}

/// The native operations the submission driver needs from the underlying
/// API boundary. One real implementor wraps `ash`;
/// `RecordingApi` below is a device-free fake for tests.
pub trait NativeApi: Send + Sync {
    fn create_command_pool(&self, queue_family: u32) -> vk::CommandPool;
    fn reset_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> vk::CommandBuffer;
    fn begin_command_buffer(&self, cb: vk::CommandBuffer);
    fn end_command_buffer(&self, cb: vk::CommandBuffer);
    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    );
    #[allow(clippy::too_many_arguments)]
    fn queue_submit(
        &self,
        queue_family: u32,
        queue_index: usize,
        wait_semaphores: &[vk::Semaphore],
        wait_values: &[u64],
        wait_dst_stages: &[vk::PipelineStageFlags],
        command_buffers: &[vk::CommandBuffer],
        signal_semaphores: &[vk::Semaphore],
        signal_values: &[u64],
    );
    fn wait_semaphores(&self, semaphores: &[vk::Semaphore], values: &[u64], wait_all: bool, timeout: Duration) -> bool;
    fn destroy_deferred(&self, kind: DeferredKind, raw: u64);
}

/// Owns one command pool plus the command buffers allocated from it,
/// recycling buffers back to `free` once their owning pool is reset.
struct CommandAllocator {
    command_pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    used: Vec<vk::CommandBuffer>,
}

impl CommandAllocator {
    fn new(command_pool: vk::CommandPool) -> CommandAllocator {
        CommandAllocator { command_pool, free: Vec::new(), used: Vec::new() }
    }

    fn allocate_command_buffer(&mut self, api: &dyn NativeApi) -> vk::CommandBuffer {
        let cb = self.free.pop().unwrap_or_else(|| api.allocate_command_buffer(self.command_pool));
        self.used.push(cb);
        cb
    }

    fn reset(&mut self, api: &dyn NativeApi) {
        api.reset_command_pool(self.command_pool);
        self.free.append(&mut self.used);
    }
}

/// Translates `JobCompiler`'s barrier/command stream into native calls,
/// resolving each memory dependency's resource id to a handle through
/// `resolver`.
struct NativeRecorder<'a> {
    api: &'a dyn NativeApi,
    resolver: &'a dyn ResourceResolver,
    command_buffer: vk::CommandBuffer,
}

impl<'a> NativeRecorder<'a> {
    fn buffer_barrier(&self, dep: &crate::barrier::BufferMemoryDependency) -> vk::BufferMemoryBarrier {
        vk::BufferMemoryBarrier {
            src_access_mask: dep.src_access_mask,
            dst_access_mask: dep.dst_access_mask,
            src_queue_family_index: dep.src_queue_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED),
            dst_queue_family_index: dep.dst_queue_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED),
            buffer: self.resolver.buffer_handle(dep.buffer),
            offset: dep.range.offset,
            size: dep.range.size,
            ..Default::default()
        }
    }

    fn image_barrier(&self, dep: &crate::barrier::ImageMemoryDependency) -> vk::ImageMemoryBarrier {
        let range = dep.range;
        vk::ImageMemoryBarrier {
            src_access_mask: dep.src_access_mask,
            dst_access_mask: dep.dst_access_mask,
            old_layout: dep.old_layout.to_vk(),
            new_layout: dep.new_layout.to_vk(),
            src_queue_family_index: dep.src_queue_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED),
            dst_queue_family_index: dep.dst_queue_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED),
            image: self.resolver.image_handle(dep.image),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: range.aspect_mask,
                base_mip_level: range.mip_mask.trailing_zeros(),
                level_count: range.mip_mask.count_ones(),
                base_array_layer: range.base_array_layer,
                layer_count: range.layer_count,
            },
            ..Default::default()
        }
    }
}

impl<'a> PrimaryBufferRecorder for NativeRecorder<'a> {
    fn emit_barrier(&mut self, barrier_index: usize, barriers: &BarrierList) {
        let b: &Barrier = barriers.get(barrier_index);
        let buffer_barriers: Vec<vk::BufferMemoryBarrier> = b.buffer_memory_barriers.iter().map(|d| self.buffer_barrier(d)).collect();
        let image_barriers: Vec<vk::ImageMemoryBarrier> = b.image_memory_barriers.iter().map(|d| self.image_barrier(d)).collect();
        if buffer_barriers.is_empty() && image_barriers.is_empty() && b.src_stage_mask.is_empty() && b.dst_stage_mask.is_empty() {
            return;
        }
        self.api.cmd_pipeline_barrier(self.command_buffer, b.extended_src_stage_mask, b.extended_dst_stage_mask, &buffer_barriers, &image_barriers);
    }

    fn emit_command(&mut self, _node: &CommandNode) {
        // Draw/dispatch/copy encoding happens inside each command's own
        // recorded callback; the driver only reacts to barrier placement.
    }

    fn begin_secondary(&mut self) {}

    fn end_secondary(&mut self) -> u32 {
        0
    }
}

/// Drives one logical queue's submission loop: the object
/// describes as owning command-pool recycling and the per-source-queue
/// watermark used to avoid requerying already-consumed export windows.
pub struct QueueSubmitter {
    pub queue_family: u32,
    pub queue_index: usize,
    available_command_pools: Vec<CommandAllocator>,
    in_flight_command_pools: Vec<(u64, CommandAllocator)>,
    /// High-water mark, per source queue, already folded into a prior
    /// `incoming_periods` query.
    synced_from: [u64; MAX_QUEUES],
}

impl QueueSubmitter {
    pub fn new(queue_family: u32, queue_index: usize) -> QueueSubmitter {
        QueueSubmitter {
            queue_family,
            queue_index,
            available_command_pools: Vec::new(),
            in_flight_command_pools: Vec::new(),
            synced_from: [0; MAX_QUEUES],
        }
    }

    fn acquire_pool(&mut self, api: &dyn NativeApi) -> CommandAllocator {
        self.available_command_pools
            .pop()
            .unwrap_or_else(|| CommandAllocator::new(api.create_command_pool(self.queue_family)))
    }

    /// Returns completed command pools (their signal timestamp now reached
    /// on this queue's timeline) to the free list. Must be polled
    /// periodically by the caller, typically right after `TimelineManager::update`.
    pub fn reclaim_completed_pools(&mut self, timelines: &TimelineManager, api: &dyn NativeApi) {
        let reached = timelines.last_reached(self.queue_index);
        let mut i = 0;
        while i < self.in_flight_command_pools.len() {
            if self.in_flight_command_pools[i].0 <= reached {
                let (_, mut pool) = self.in_flight_command_pools.remove(i);
                pool.reset(api);
                self.available_command_pools.push(pool);
            } else {
                i += 1;
            }
        }
    }

    /// Reduces `job.wait_job_semaphores` to at most one entry per source
    /// queue (the highest requested timestamp) and returns the `Period`s
    /// needed to query the Cross-Queue Synchronizer for exports that became
    /// visible in each source queue's newly-covered window (the
    /// 3). Advances `synced_from` so the same window is never requeried.
    fn reduce_waits(&mut self, job: &Job) -> (Vec<JobSemaphore>, Vec<Period>) {
        let mut highest = [0u64; MAX_QUEUES];
        for w in &job.wait_job_semaphores {
            let q = w.queue();
            highest[q] = highest[q].max(w.timestamp());
        }
        let mut waits = Vec::new();
        let mut periods = Vec::new();
        for (q, &ts) in highest.iter().enumerate() {
            if ts == 0 {
                continue;
            }
            waits.push(JobSemaphore::new(q, ts));
            let from = self.synced_from[q];
            if ts > from {
                periods.push(Period { queue: q, from_exclusive: from, to_inclusive: ts });
                self.synced_from[q] = ts;
            }
        }
        (waits, periods)
    }

    /// Runs the full submission algorithm over `jobs`, in enqueue order, on
    /// this queue: drains forgets, groups contiguous small waitless jobs into
    /// one submit entry, compiles each job's barriers and commands, and
    /// submits. Returns the signal assigned to each job, in the same order.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_jobs(
        &mut self,
        jobs: &mut [&mut Job],
        state: &mut PerQueueState,
        xqsync: &mut CrossQueueSynchronizer,
        timelines: &TimelineManager,
        debug: &SharedDebugHandler,
        resolver: &dyn ResourceResolver,
        api: &dyn NativeApi,
    ) -> Vec<JobSemaphore> {
        state.drain_forgets();

        let mut signals = Vec::with_capacity(jobs.len());
        let mut i = 0;
        while i < jobs.len() {
            let start = i;
            i += 1;
            if jobs[start].is_small() && !jobs[start].has_explicit_waits() {
                while i < jobs.len() && jobs[i].is_small() && !jobs[i].has_explicit_waits() {
                    i += 1;
                }
            }
            let mut pool = self.acquire_pool(api);
            let cb = pool.allocate_command_buffer(api);
            api.begin_command_buffer(cb);

            let mut wait_by_queue: HashMap<usize, u64> = HashMap::new();
            let mut external_waits = Vec::new();
            let mut batch_signal_value = 0u64;

            for idx in start..i {
                let (reduced_waits, periods) = self.reduce_waits(&*jobs[idx]);
                for w in &reduced_waits {
                    let entry = wait_by_queue.entry(w.queue()).or_insert(0);
                    *entry = (*entry).max(w.timestamp());
                }
                for ext in &jobs[idx].wait_external {
                    external_waits.push(*ext);
                }

                let ts = timelines.issue_next_timestamp(self.queue_index, true);
                let signal = JobSemaphore::new(self.queue_index, ts);
                jobs[idx].signal = Some(signal);
                batch_signal_value = batch_signal_value.max(ts);

                let mut compiler = JobCompiler {
                    queue_family: self.queue_family,
                    queue_index: self.queue_index,
                    job_id: ts,
                    state: &mut *state,
                    xqsync: &mut *xqsync,
                };
                let mut recorder = NativeRecorder { api, resolver, command_buffer: cb };
                let stats = compiler.compile(&mut *jobs[idx], signal, &periods, &mut recorder);
                debug.on_message(&DebugMessage::Stats { job_name: None, stats });

                signals.push(signal);
            }

            api.end_command_buffer(cb);

            let mut wait_semaphores = Vec::new();
            let mut wait_values = Vec::new();
            let mut wait_dst_stages = Vec::new();
            for (&q, &ts) in wait_by_queue.iter() {
                wait_semaphores.push(timelines.semaphore(q));
                wait_values.push(ts);
                wait_dst_stages.push(vk::PipelineStageFlags::TOP_OF_PIPE);
            }
            for ext in &external_waits {
                wait_semaphores.push(ext.handle);
                wait_values.push(ext.value);
                wait_dst_stages.push(vk::PipelineStageFlags::TOP_OF_PIPE);
            }

            let mut signal_semaphores = vec![timelines.semaphore(self.queue_index)];
            let mut signal_values = vec![batch_signal_value];
            for idx in start..i {
                for ext in &jobs[idx].signal_external {
                    signal_semaphores.push(ext.handle);
                    signal_values.push(ext.value);
                }
            }

            api.queue_submit(
                self.queue_family,
                self.queue_index,
                &wait_semaphores,
                &wait_values,
                &wait_dst_stages,
                &[cb],
                &signal_semaphores,
                &signal_values,
            );
            timelines.mark_pending(self.queue_index, batch_signal_value);
            self.in_flight_command_pools.push((batch_signal_value, pool));
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::default_handler;
    use crate::job::recorder::JobRecorder;
    use crate::job::JobFlags;
    use crate::resource::{BufferRef, BufferView, ResourceId};
    use ash::vk::Handle;
    use slotmap::SlotMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
        next_pool: Mutex<u64>,
        next_cb: Mutex<u64>,
    }

    impl NativeApi for RecordingApi {
        fn create_command_pool(&self, queue_family: u32) -> vk::CommandPool {
            self.calls.lock().unwrap().push(format!("create_command_pool({queue_family})"));
            let mut n = self.next_pool.lock().unwrap();
            *n += 1;
            vk::CommandPool::from_raw(*n)
        }

        fn reset_command_pool(&self, _pool: vk::CommandPool) {
            self.calls.lock().unwrap().push("reset_command_pool".into());
        }

        fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> vk::CommandBuffer {
            let mut n = self.next_cb.lock().unwrap();
            *n += 1;
            vk::CommandBuffer::from_raw(*n)
        }

        fn begin_command_buffer(&self, _cb: vk::CommandBuffer) {
            self.calls.lock().unwrap().push("begin".into());
        }

        fn end_command_buffer(&self, _cb: vk::CommandBuffer) {
            self.calls.lock().unwrap().push("end".into());
        }

        fn cmd_pipeline_barrier(
            &self,
            _cb: vk::CommandBuffer,
            _src: vk::PipelineStageFlags,
            _dst: vk::PipelineStageFlags,
            buffer_barriers: &[vk::BufferMemoryBarrier],
            image_barriers: &[vk::ImageMemoryBarrier],
        ) {
            self.calls.lock().unwrap().push(format!("barrier(b={}, i={})", buffer_barriers.len(), image_barriers.len()));
        }

        fn queue_submit(
            &self,
            _queue_family: u32,
            _queue_index: usize,
            _wait_semaphores: &[vk::Semaphore],
            _wait_values: &[u64],
            _wait_dst_stages: &[vk::PipelineStageFlags],
            command_buffers: &[vk::CommandBuffer],
            _signal_semaphores: &[vk::Semaphore],
            _signal_values: &[u64],
        ) {
            self.calls.lock().unwrap().push(format!("submit(cbs={})", command_buffers.len()));
        }

        fn wait_semaphores(&self, _semaphores: &[vk::Semaphore], _values: &[u64], _wait_all: bool, _timeout: Duration) -> bool {
            true
        }

        fn destroy_deferred(&self, _kind: DeferredKind, _raw: u64) {}
    }

    struct NullResolver;
    impl ResourceResolver for NullResolver {
        fn buffer_handle(&self, _id: BufferId) -> vk::Buffer {
            vk::Buffer::null()
        }
        fn image_handle(&self, _id: ImageId) -> vk::Image {
            vk::Image::null()
        }
    }

    #[test]
    fn submits_single_job_and_assigns_signal() {
        let mut keys: SlotMap<ResourceId, ()> = SlotMap::with_key();
        let buf = crate::resource::BufferId(keys.insert(()));

        let mut job = Job::new(0);
        {
            let mut rec = JobRecorder::new(&mut job);
            let view = BufferView { buffer: BufferRef::Resource(buf), offset: 0, size: 64, format: None };
            rec.fill_buffer(view, 0);
        }

        let api = RecordingApi::default();
        let mut submitter = QueueSubmitter::new(0, 0);
        let mut state = PerQueueState::new();
        let mut xqsync = CrossQueueSynchronizer::new();
        let timelines = TimelineManager::new(vec![vk::Semaphore::null()]);
        let debug = default_handler();
        let resolver = NullResolver;

        let mut jobs = vec![&mut job];
        let signals = submitter.submit_jobs(&mut jobs, &mut state, &mut xqsync, &timelines, &debug, &resolver, &api);

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].queue(), 0);
        assert_eq!(signals[0].timestamp(), 1);
        let calls = api.calls.lock().unwrap();
        assert!(calls.contains(&"submit(cbs=1)".to_string()));
    }

    #[test]
    fn contiguous_small_waitless_jobs_share_one_submit() {
        let mut job_a = Job::new(0);
        job_a.flags |= JobFlags::SMALL;
        let mut job_b = Job::new(0);
        job_b.flags |= JobFlags::SMALL;

        let api = RecordingApi::default();
        let mut submitter = QueueSubmitter::new(0, 0);
        let mut state = PerQueueState::new();
        let mut xqsync = CrossQueueSynchronizer::new();
        let timelines = TimelineManager::new(vec![vk::Semaphore::null()]);
        let debug = default_handler();
        let resolver = NullResolver;

        let mut jobs = vec![&mut job_a, &mut job_b];
        let signals = submitter.submit_jobs(&mut jobs, &mut state, &mut xqsync, &timelines, &debug, &resolver, &api);

        assert_eq!(signals.len(), 2);
        let submits = api.calls.lock().unwrap().iter().filter(|c| c.starts_with("submit")).count();
        assert_eq!(submits, 1);
    }
}
