//! Job and its intermediate representation.
//!
//! Grounded on `graal`'s `Frame`/`Pass` (`context/mod.rs`, `context/pass.rs`)
//! generalized from a single context-wide implicit frame made of passes
//! into an explicit `Job` recording an arena of command nodes.

pub mod compiler;
pub mod recorder;

use crate::debug::ErrorContext;
use crate::resource::{AllocationRequirements, BufferId, BufferView, ImageAccessRange, ImageId, ImageView, Layout, ResourceAccess};
use crate::timestamp::{ExternalSemaphore, JobSemaphore};
use crate::transient::Lifetime;
use ash::vk;
use bitflags::bitflags;

bitflags! {
    pub struct JobFlags: u32 {
        /// Hints that this job is cheap enough to be batched into a prior
        /// submit entry instead of becoming its own.
        const SMALL = 0b0000_0001;
    }
}

/// Exhaustive set of operations a job's intermediate representation can
/// encode.
pub enum CommandNode {
    FillBuffer { target: BufferView, value: u32 },
    UpdateBuffer { target: BufferView, data: Vec<u8> },
    CopyBuffer { src: BufferView, dst: BufferView },
    CopyBufferToImage { src: BufferView, dst: ImageView },
    CopyImageToBuffer { src: ImageView, dst: BufferView },
    CopyImage { src: ImageView, dst: ImageView },
    BlitImage { src: ImageView, dst: ImageView, filter: vk::Filter },
    ClearImage { target: ImageView, color: [f32; 4] },
    ResolveImage { src: ImageView, dst: ImageView },
    ExecuteComputePass { name: String, accesses: Vec<(ResourceAccess, ResourceKind)>, record: Box<dyn FnOnce(&mut dyn std::any::Any) + Send> },
    ExecuteRenderPass {
        name: String,
        color_attachments: Vec<ImageView>,
        depth_attachment: Option<ImageView>,
        accesses: Vec<(ResourceAccess, ResourceKind)>,
        record: Box<dyn FnOnce(&mut dyn std::any::Any) + Send>,
    },
    BuildAccelerationStructures { scratch: BufferView },
    ExportBuffer { target: BufferView, access: ResourceAccess, dst_family: u32 },
    ExportImage { target: ImageView, access: ResourceAccess, layout: Layout, dst_family: u32 },
    DiscardImageContents { target: ImageView },
    ImportExternalBuffer { target: BufferId, access: ResourceAccess },
    ImportExternalImage { target: ImageId, access: ResourceAccess, layout: Layout },
    BeginDebugLabel { label: String },
    InsertDebugLabel { label: String },
    EndDebugLabel,
    WriteTimestamp { query_pool: vk::QueryPool, query: u32, stage: vk::PipelineStageFlags },
}

/// Distinguishes which kind of resource a logged access in
/// `ExecuteComputePass`/`ExecuteRenderPass` refers to, since the callback
/// itself is opaque to the compiler.
pub enum ResourceKind {
    Buffer(BufferView),
    Image(ImageView, ImageAccessRange),
}

/// A node appended to the arena together with the job-relative command
/// index it occupies — its position in the IR, used for barrier ordering
/// and lifetime tracking.
pub struct Record {
    pub node: CommandNode,
}

/// All per-job command nodes, allocated in a reused arena and addressed by
/// index rather than pointer (the "arena + index" pattern).
#[derive(Default)]
pub struct RecordStorage {
    records: Vec<Record>,
    /// Commands appended at finalization (e.g. end-of-job export flushes),
    /// kept in a separate list so they always run after the job's regular commands.
    delayed: Vec<Record>,
}

impl RecordStorage {
    pub fn push(&mut self, node: CommandNode) -> usize {
        self.records.push(Record { node });
        self.records.len() - 1
    }

    pub fn push_delayed(&mut self, node: CommandNode) {
        self.delayed.push(Record { node });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &CommandNode)> {
        self.records.iter().enumerate().map(|(i, r)| (i, &r.node))
    }

    pub fn delayed_iter(&self) -> impl Iterator<Item = &CommandNode> {
        self.delayed.iter().map(|r| &r.node)
    }

    /// Clears the arena for reuse by the next job drawn from the pool,
    /// retaining its allocated capacity.
    pub fn clear(&mut self) {
        self.records.clear();
        self.delayed.clear();
    }
}

/// A job-local transient table entry: its allocation requirements and
/// lifetime plus (once resolved by the compiler) the concrete resource it
/// was bound to.
pub struct LocalResourceSlot<Id> {
    pub requirements: AllocationRequirements,
    pub lifetime: Lifetime,
    pub resolved: Option<Id>,
}

/// Debug-name and creation-time context carried alongside a job-local
/// resource purely for attributing access-map errors and statistics events
/// to a named resource instead of a bare handle.
pub struct DebugName {
    pub name: String,
}

impl DebugName {
    pub fn context(&self, method: &'static str) -> ErrorContext {
        ErrorContext { object_name: Some(self.name.clone()), method: Some(method), parameter: None }
    }
}

/// The unit of GPU work handed to the engine for compilation and submission.
pub struct Job {
    pub pool_id: u64,
    pub flags: JobFlags,
    pub storage: RecordStorage,
    pub local_buffers: Vec<LocalResourceSlot<BufferId>>,
    pub local_images: Vec<LocalResourceSlot<ImageId>>,
    /// Assigned on enqueue.
    pub signal: Option<JobSemaphore>,
    pub wait_job_semaphores: Vec<JobSemaphore>,
    pub wait_external: Vec<ExternalSemaphore>,
    pub signal_external: Vec<ExternalSemaphore>,
}

impl Job {
    pub fn new(pool_id: u64) -> Job {
        Job {
            pool_id,
            flags: JobFlags::empty(),
            storage: RecordStorage::default(),
            local_buffers: Vec::new(),
            local_images: Vec::new(),
            signal: None,
            wait_job_semaphores: Vec::new(),
            wait_external: Vec::new(),
            signal_external: Vec::new(),
        }
    }

    pub fn is_small(&self) -> bool {
        self.flags.contains(JobFlags::SMALL)
    }

    pub fn has_explicit_waits(&self) -> bool {
        !self.wait_job_semaphores.is_empty() || !self.wait_external.is_empty()
    }

    /// Returns the job's transient resources to the pool's free lists and
    /// clears the arena, preparing the `Job` record for reuse. Called from
    /// the reached-timestamp cleanup callback registered at submit.
    pub fn reset_for_reuse(&mut self) {
        self.storage.clear();
        self.local_buffers.clear();
        self.local_images.clear();
        self.signal = None;
        self.wait_job_semaphores.clear();
        self.wait_external.clear();
        self.signal_external.clear();
        self.flags = JobFlags::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_job_has_no_commands() {
        let job = Job::new(1);
        assert_eq!(job.storage.len(), 0);
        assert!(job.storage.is_empty());
    }

    #[test]
    fn reset_clears_arena_and_tables() {
        let mut job = Job::new(1);
        job.storage.push(CommandNode::EndDebugLabel);
        job.local_buffers.push(LocalResourceSlot {
            requirements: AllocationRequirements {
                memory_type_bits: 1,
                size: 0,
                alignment: 1,
                memory_info: Default::default(),
                compatibility_class: 0,
            },
            lifetime: Lifetime { first_cmd: 0, last_cmd: 0 },
            resolved: None,
        });
        job.reset_for_reuse();
        assert_eq!(job.storage.len(), 0);
        assert!(job.local_buffers.is_empty());
    }
}
