//! Job Compiler: walks a job's IR, resolves transient resources, computes
//! per-command accesses, and emits pipeline barriers — the second pass over
//! a recorded job, driven once per job per its issuing queue.
//!
//! Grounded on `graal`'s `Context::end_frame`/pass-scheduling walk
//! (`context/mod.rs`, `context/frame.rs`'s `add_memory_dependency`),
//! generalized from graal's whole-frame batch compile to a per-job compile
//! against one queue's `PerQueueState` plus incoming cross-queue exports.

use super::{CommandNode, Job, ResourceKind};
use crate::access_map::{BufferAccessMap, ImageAccessMap};
use crate::barrier::BarrierList;
use crate::queue_state::PerQueueState;
use crate::resource::{BufferRef, ImageRef, Layout, ResourceAccess};
use crate::stats::JobStats;
use crate::timestamp::JobSemaphore;
use crate::transient::{self, Transient};
use crate::xqsync::{CrossQueueSynchronizer, Period, ResourceHandle};
use ash::vk;

/// A pending export queued during the IR walk, separated by whether it
/// crosses a queue family (per §4.9).
struct PendingExport {
    cmd_index: usize,
    handle: ResourceHandle,
    access: ResourceAccess,
    layout: Option<Layout>,
    dst_family: u32,
}

/// Drives the Resource Export Handler embedded in the compiler: same-family
/// exports collapse into a direct state update at flush time; cross-family
/// exports defer their QFOT barrier until end-of-job.
#[derive(Default)]
struct ExportHandler {
    same_family: Vec<PendingExport>,
    cross_family: Vec<PendingExport>,
}

impl ExportHandler {
    fn queue(&mut self, export: PendingExport, current_family: u32) {
        if export.dst_family == current_family {
            self.same_family.push(export);
        } else {
            self.cross_family.push(export);
        }
    }

    fn take_same_family(&mut self) -> Vec<PendingExport> {
        std::mem::take(&mut self.same_family)
    }
}

/// A native command-buffer recorder stream: abstracts over the sequence of
/// "emit this barrier" / "record this command" calls the compiler makes, so
/// that tests can substitute a recording fake instead of an `ash`
/// `CommandBuffer`.
pub trait PrimaryBufferRecorder {
    fn emit_barrier(&mut self, barrier_index: usize, barriers: &BarrierList);
    fn emit_command(&mut self, node: &CommandNode);
    fn begin_secondary(&mut self);
    fn end_secondary(&mut self) -> u32;
}

pub struct JobCompiler<'a> {
    pub queue_family: u32,
    pub queue_index: usize,
    pub job_id: u64,
    pub state: &'a mut PerQueueState,
    pub xqsync: &'a mut CrossQueueSynchronizer,
}

impl<'a> JobCompiler<'a> {
    /// Runs all five phases against `job`, recording barriers and commands
    /// through `recorder`, and returns the job's compiled statistics.
    pub fn compile(
        &mut self,
        job: &mut Job,
        signal: JobSemaphore,
        incoming_periods: &[Period],
        recorder: &mut dyn PrimaryBufferRecorder,
    ) -> JobStats {
        let mut barriers = BarrierList::new();
        let mut stats = JobStats::default();

        // Phase 1: setup — discard job-local images (freshly bound), and
        // resolve the transient allocator's packing for local buffers and
        // images.
        let buffer_transients: Vec<Transient> = job
            .local_buffers
            .iter()
            .map(|b| Transient { requirements: b.requirements, lifetime: b.lifetime, assigned_slot: None })
            .collect();
        let buffer_slots = transient::pack(&buffer_transients);
        let (req_bytes, committed_bytes) = transient::requested_and_committed_bytes(&buffer_transients, &buffer_slots);
        stats.local_buffer_bytes_requested = req_bytes;
        stats.local_buffer_bytes_committed = committed_bytes;

        let image_transients: Vec<Transient> = job
            .local_images
            .iter()
            .map(|img| Transient { requirements: img.requirements, lifetime: img.lifetime, assigned_slot: None })
            .collect();
        let image_slots = transient::pack(&image_transients);
        let (img_req_bytes, img_committed_bytes) = transient::requested_and_committed_bytes(&image_transients, &image_slots);
        stats.local_image_bytes_requested = img_req_bytes;
        stats.local_image_bytes_committed = img_committed_bytes;

        // Phase 2: process incoming cross-queue exports targeting this
        // queue family.
        let incoming = self.xqsync.query_incoming(incoming_periods, self.queue_family);
        for entry in &incoming {
            // Acquire barrier: top-of-pipe -> consumer, with a QFOT from the
            // exporting family to this one.
            let idx = barriers.synchronize_dependency(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                entry.access.stage_mask,
                0,
                0,
                false,
            );
            match entry.handle {
                ResourceHandle::Buffer(id) => {
                    let map = self.state.buffer_map(id);
                    map.insert_new_access(
                        crate::resource::BufferAccessRange::EVERYTHING,
                        entry.access,
                        Some(idx),
                        true,
                        false,
                    );
                }
                ResourceHandle::Image(id) => {
                    let whole = crate::resource::ImageAccessRange::whole(vk::ImageAspectFlags::COLOR, 1, 1);
                    let map = self.state.image_map(id, whole);
                    map.insert_new_access(
                        whole,
                        entry.access,
                        entry.layout.unwrap_or(Layout::Undefined),
                        Some(idx),
                        true,
                        false,
                    );
                }
            }
        }

        // Phase 3: walk the IR.
        let mut exports = ExportHandler::default();
        for (cmd_index, node) in job.storage.iter() {
            match node {
                CommandNode::ExportBuffer { target, access, dst_family } => {
                    if let BufferRef::Resource(id) = target.buffer {
                        exports.queue(
                            PendingExport {
                                cmd_index,
                                handle: ResourceHandle::Buffer(id),
                                access: *access,
                                layout: None,
                                dst_family: *dst_family,
                            },
                            self.queue_family,
                        );
                    }
                }
                CommandNode::ExportImage { target, access, layout, dst_family } => {
                    if let ImageRef::Resource(id) = target.image {
                        exports.queue(
                            PendingExport {
                                cmd_index,
                                handle: ResourceHandle::Image(id),
                                access: *access,
                                layout: Some(*layout),
                                dst_family: *dst_family,
                            },
                            self.queue_family,
                        );
                    }
                }
                CommandNode::DiscardImageContents { target } => {
                    if let ImageRef::Resource(id) = target.image {
                        let map = self.state.image_map(id, target.range);
                        map.discard_contents(target.range);
                    }
                }
                CommandNode::ImportExternalBuffer { target, access } => {
                    let map = self.state.buffer_map(*target);
                    map.insert_new_access(crate::resource::BufferAccessRange::EVERYTHING, *access, None, true, false);
                }
                CommandNode::ImportExternalImage { target, access, layout } => {
                    let whole = crate::resource::ImageAccessRange::whole(vk::ImageAspectFlags::COLOR, 1, 1);
                    let map = self.state.image_map(*target, whole);
                    map.insert_new_access(whole, *access, *layout, None, true, false);
                }
                _ => {
                    // Flush queued same-family exports before any command
                    // that might reuse the resource, then synchronize this
                    // command's own accesses.
                    for export in exports.take_same_family() {
                        self.flush_same_family_export(export, &mut barriers);
                    }
                    self.synchronize_command(node, cmd_index, &mut barriers);
                }
            }
            recorder.emit_command(node);
        }

        // Phase 4: end of IR — flush remaining exports. Cross-family
        // exports get two barriers: release-and-state-change (bottom of
        // pipe dst, so it executes on any queue type) then a pure QFOT
        // release.
        for export in exports.take_same_family() {
            self.flush_same_family_export(export, &mut barriers);
        }
        for export in std::mem::take(&mut exports.cross_family) {
            let release_idx =
                barriers.synchronize_dependency(export.access.stage_mask, vk::PipelineStageFlags::BOTTOM_OF_PIPE, export.cmd_index, 0, true);
            barriers.advance_export_barrier();
            barriers.synchronize_dependency(
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                export.cmd_index,
                release_idx,
                true,
            );
            self.mark_export_eager(&export);
            self.xqsync.broadcast_export(export.handle, signal, export.access, export.layout, self.queue_family, export.dst_family);
        }

        // Phase 5: emit native commands, interleaving barriers at their
        // recorded command indices.
        for i in 0..barriers.len() {
            recorder.emit_barrier(i, &barriers);
        }
        stats.pipeline_barriers = barriers.len() as u32;
        stats.buffer_memory_barriers = barriers.buffer_memory_barrier_count() as u32;
        stats.image_memory_barriers = barriers.image_memory_barrier_count() as u32;
        stats.primary_command_buffers = 1;
        stats
    }

    fn flush_same_family_export(&mut self, export: PendingExport, barriers: &mut BarrierList) {
        // Same-family export: treat as a special write-to-read transition,
        // a direct state update rather than a QFOT barrier.
        barriers.synchronize_dependency(export.access.stage_mask, export.access.stage_mask, export.cmd_index, 0, true);
        self.mark_export_eager(&export);
        barriers.advance_export_barrier();
    }

    fn mark_export_eager(&mut self, export: &PendingExport) {
        match export.handle {
            ResourceHandle::Buffer(id) => {
                let map = self.state.buffer_map(id);
                map.insert_new_access(crate::resource::BufferAccessRange::EVERYTHING, export.access, None, true, true);
            }
            ResourceHandle::Image(id) => {
                let whole = crate::resource::ImageAccessRange::whole(vk::ImageAspectFlags::COLOR, 1, 1);
                let map = self.state.image_map(id, whole);
                map.insert_new_access(whole, export.access, export.layout.unwrap_or(Layout::Undefined), None, true, true);
            }
        }
    }

    fn synchronize_command(&mut self, node: &CommandNode, cmd_index: usize, barriers: &mut BarrierList) {
        let accesses = command_accesses(node);
        for access in accesses {
            match access {
                CommandAccess::Buffer(view, ra) => {
                    if let BufferRef::Resource(id) = view.buffer {
                        let map: &mut BufferAccessMap = self.state.buffer_map(id);
                        let range = view.range();
                        let barrier = map.synchronize_new_access(range, ra, cmd_index, barriers);
                        map.insert_new_access(range, ra, barrier, ra.is_write(), false);
                    }
                }
                CommandAccess::Image(view, ra, layout) => {
                    if let ImageRef::Resource(id) = view.image {
                        let map: &mut ImageAccessMap = self.state.image_map(id, view.range);
                        let barrier = map.synchronize_new_access(view.range, ra, layout, cmd_index, barriers);
                        map.insert_new_access(view.range, ra, layout, barrier, ra.is_write(), false);
                        let _ = barrier;
                    }
                }
            }
        }
    }
}

enum CommandAccess {
    Buffer(crate::resource::BufferView, ResourceAccess),
    Image(crate::resource::ImageView, ResourceAccess, Layout),
}

/// Computes the set of resource accesses a single command node performs —
/// the "query each command for its accesses" pass over the job's IR.
fn command_accesses(node: &CommandNode) -> Vec<CommandAccess> {
    use vk::{AccessFlags as AF, PipelineStageFlags as PS};
    let read = |stage, access| ResourceAccess { stage_mask: stage, access_mask: access };
    let write = |stage, access| ResourceAccess { stage_mask: stage, access_mask: access };

    match node {
        CommandNode::FillBuffer { target, .. } | CommandNode::UpdateBuffer { target, .. } => {
            vec![CommandAccess::Buffer(*target, write(PS::TRANSFER, AF::TRANSFER_WRITE))]
        }
        CommandNode::CopyBuffer { src, dst } => vec![
            CommandAccess::Buffer(*src, read(PS::TRANSFER, AF::TRANSFER_READ)),
            CommandAccess::Buffer(*dst, write(PS::TRANSFER, AF::TRANSFER_WRITE)),
        ],
        CommandNode::CopyBufferToImage { src, dst } => vec![
            CommandAccess::Buffer(*src, read(PS::TRANSFER, AF::TRANSFER_READ)),
            CommandAccess::Image(*dst, write(PS::TRANSFER, AF::TRANSFER_WRITE), Layout::TransferDst),
        ],
        CommandNode::CopyImageToBuffer { src, dst } => vec![
            CommandAccess::Image(*src, read(PS::TRANSFER, AF::TRANSFER_READ), Layout::TransferSrc),
            CommandAccess::Buffer(*dst, write(PS::TRANSFER, AF::TRANSFER_WRITE)),
        ],
        CommandNode::CopyImage { src, dst } => vec![
            CommandAccess::Image(*src, read(PS::TRANSFER, AF::TRANSFER_READ), Layout::TransferSrc),
            CommandAccess::Image(*dst, write(PS::TRANSFER, AF::TRANSFER_WRITE), Layout::TransferDst),
        ],
        CommandNode::BlitImage { src, dst, .. } => vec![
            CommandAccess::Image(*src, read(PS::TRANSFER, AF::TRANSFER_READ), Layout::TransferSrc),
            CommandAccess::Image(*dst, write(PS::TRANSFER, AF::TRANSFER_WRITE), Layout::TransferDst),
        ],
        CommandNode::ClearImage { target, .. } => {
            vec![CommandAccess::Image(*target, write(PS::TRANSFER, AF::TRANSFER_WRITE), Layout::TransferDst)]
        }
        CommandNode::ResolveImage { src, dst } => vec![
            CommandAccess::Image(*src, read(PS::TRANSFER, AF::TRANSFER_READ), Layout::TransferSrc),
            CommandAccess::Image(*dst, write(PS::TRANSFER, AF::TRANSFER_WRITE), Layout::TransferDst),
        ],
        CommandNode::BuildAccelerationStructures { scratch } => {
            vec![CommandAccess::Buffer(*scratch, write(PS::ACCELERATION_STRUCTURE_BUILD_KHR, AF::ACCELERATION_STRUCTURE_WRITE_KHR))]
        }
        CommandNode::ExecuteComputePass { accesses, .. } | CommandNode::ExecuteRenderPass { accesses, .. } => accesses
            .iter()
            .map(|(ra, kind)| match kind {
                ResourceKind::Buffer(view) => CommandAccess::Buffer(*view, *ra),
                ResourceKind::Image(view, _range) => CommandAccess::Image(*view, *ra, Layout::General),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::recorder::JobRecorder;
    use crate::resource::{BufferRef, BufferView, ResourceId};
    use slotmap::SlotMap;

    struct NullRecorder;
    impl PrimaryBufferRecorder for NullRecorder {
        fn emit_barrier(&mut self, _barrier_index: usize, _barriers: &BarrierList) {}
        fn emit_command(&mut self, _node: &CommandNode) {}
        fn begin_secondary(&mut self) {}
        fn end_secondary(&mut self) -> u32 {
            0
        }
    }

    #[test]
    fn compute_ping_pong_emits_two_barriers() {
        let mut keys: SlotMap<ResourceId, ()> = SlotMap::with_key();
        let input = crate::resource::BufferId(keys.insert(()));
        let temp = crate::resource::BufferId(keys.insert(()));
        let output = crate::resource::BufferId(keys.insert(()));

        let view = |id| BufferView { buffer: BufferRef::Resource(id), offset: 0, size: 64, format: None };
        let ra = |write| ResourceAccess {
            stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            access_mask: if write { vk::AccessFlags::SHADER_WRITE } else { vk::AccessFlags::SHADER_READ },
        };

        let mut job = Job::new(0);
        {
            let mut rec = JobRecorder::new(&mut job);
            rec.execute_compute_pass(
                "pass1",
                vec![(ra(false), ResourceKind::Buffer(view(input))), (ra(true), ResourceKind::Buffer(view(temp)))],
                |_| {},
            );
            rec.execute_compute_pass(
                "pass2",
                vec![(ra(false), ResourceKind::Buffer(view(temp))), (ra(true), ResourceKind::Buffer(view(output)))],
                |_| {},
            );
            rec.export_buffer(view(output), ra(false), 1);
        }

        let mut state = PerQueueState::new();
        let mut xqsync = CrossQueueSynchronizer::new();
        let mut compiler = JobCompiler { queue_family: 0, queue_index: 0, job_id: 1, state: &mut state, xqsync: &mut xqsync };
        let mut recorder = NullRecorder;
        let stats = compiler.compile(&mut job, JobSemaphore::new(0, 1), &[], &mut recorder);
        assert_eq!(stats.pipeline_barriers, 2);
    }
}
