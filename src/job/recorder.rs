//! Job Recorder: the public command-collection object. Each method appends
//! a typed record node to the job's arena and marks resource usage (first
//! and last command index) for the lifetime analyser that feeds the
//! Transient Resource Allocator.
//!
//! Grounded on `graal`'s `PassBuilder` (`context/frame.rs`), generalized
//! from "build one pass at a time against a `Frame`" to "append one command
//! node at a time to a `Job`".

use super::{CommandNode, Job, ResourceKind};
use crate::resource::{BufferId, BufferRef, BufferView, ImageAccessRange, ImageId, ImageRef, ImageView, Layout, ResourceAccess};
use ash::vk;

/// Borrows a `Job` while commands are being recorded against it. Recording
/// happens on a single thread at a time (one Job per thread), matching
/// one job per thread.
pub struct JobRecorder<'a> {
    job: &'a mut Job,
}

impl<'a> JobRecorder<'a> {
    pub fn new(job: &'a mut Job) -> JobRecorder<'a> {
        JobRecorder { job }
    }

    fn mark_usage(&mut self, buffer: &BufferRef, cmd_index: usize) {
        if let BufferRef::JobLocal(i) = buffer {
            self.job.local_buffers[*i as usize].lifetime.mark_usage(cmd_index);
        }
    }

    fn mark_image_usage(&mut self, image: &ImageRef, cmd_index: usize) {
        if let ImageRef::JobLocal(i) = image {
            self.job.local_images[*i as usize].lifetime.mark_usage(cmd_index);
        }
    }

    fn push(&mut self, node: CommandNode) -> usize {
        self.job.storage.push(node)
    }

    pub fn fill_buffer(&mut self, target: BufferView, value: u32) {
        let buffer = target.buffer;
        let idx = self.push(CommandNode::FillBuffer { target, value });
        self.mark_usage(&buffer, idx);
    }

    pub fn update_buffer(&mut self, target: BufferView, data: Vec<u8>) {
        let buffer = target.buffer;
        let idx = self.push(CommandNode::UpdateBuffer { target, data });
        self.mark_usage(&buffer, idx);
    }

    pub fn copy_buffer(&mut self, src: BufferView, dst: BufferView) {
        let (sb, db) = (src.buffer, dst.buffer);
        let idx = self.push(CommandNode::CopyBuffer { src, dst });
        self.mark_usage(&sb, idx);
        self.mark_usage(&db, idx);
    }

    pub fn copy_buffer_to_image(&mut self, src: BufferView, dst: ImageView) {
        let sb = src.buffer;
        let di = dst.image;
        let idx = self.push(CommandNode::CopyBufferToImage { src, dst });
        self.mark_usage(&sb, idx);
        self.mark_image_usage(&di, idx);
    }

    pub fn copy_image_to_buffer(&mut self, src: ImageView, dst: BufferView) {
        let si = src.image;
        let db = dst.buffer;
        let idx = self.push(CommandNode::CopyImageToBuffer { src, dst });
        self.mark_image_usage(&si, idx);
        self.mark_usage(&db, idx);
    }

    pub fn copy_image(&mut self, src: ImageView, dst: ImageView) {
        let (si, di) = (src.image, dst.image);
        let idx = self.push(CommandNode::CopyImage { src, dst });
        self.mark_image_usage(&si, idx);
        self.mark_image_usage(&di, idx);
    }

    pub fn blit_image(&mut self, src: ImageView, dst: ImageView, filter: vk::Filter) {
        let (si, di) = (src.image, dst.image);
        let idx = self.push(CommandNode::BlitImage { src, dst, filter });
        self.mark_image_usage(&si, idx);
        self.mark_image_usage(&di, idx);
    }

    pub fn clear_image(&mut self, target: ImageView, color: [f32; 4]) {
        let ti = target.image;
        let idx = self.push(CommandNode::ClearImage { target, color });
        self.mark_image_usage(&ti, idx);
    }

    pub fn resolve_image(&mut self, src: ImageView, dst: ImageView) {
        let (si, di) = (src.image, dst.image);
        let idx = self.push(CommandNode::ResolveImage { src, dst });
        self.mark_image_usage(&si, idx);
        self.mark_image_usage(&di, idx);
    }

    /// Records a compute pass. `accesses` must list every resource the
    /// callback's dispatches touch, since the compiler never inspects the
    /// callback itself.
    pub fn execute_compute_pass(
        &mut self,
        name: impl Into<String>,
        accesses: Vec<(ResourceAccess, ResourceKind)>,
        record: impl FnOnce(&mut dyn std::any::Any) + Send + 'static,
    ) {
        let idx = self.job.storage.len();
        for (_, kind) in &accesses {
            match kind {
                ResourceKind::Buffer(view) => self.mark_usage(&view.buffer.clone(), idx),
                ResourceKind::Image(view, _) => self.mark_image_usage(&view.image.clone(), idx),
            }
        }
        self.push(CommandNode::ExecuteComputePass { name: name.into(), accesses, record: Box::new(record) });
    }

    pub fn execute_render_pass(
        &mut self,
        name: impl Into<String>,
        color_attachments: Vec<ImageView>,
        depth_attachment: Option<ImageView>,
        accesses: Vec<(ResourceAccess, ResourceKind)>,
        record: impl FnOnce(&mut dyn std::any::Any) + Send + 'static,
    ) {
        let idx = self.job.storage.len();
        for view in color_attachments.iter().chain(depth_attachment.iter()) {
            self.mark_image_usage(&view.image.clone(), idx);
        }
        for (_, kind) in &accesses {
            match kind {
                ResourceKind::Buffer(view) => self.mark_usage(&view.buffer.clone(), idx),
                ResourceKind::Image(view, _) => self.mark_image_usage(&view.image.clone(), idx),
            }
        }
        self.push(CommandNode::ExecuteRenderPass {
            name: name.into(),
            color_attachments,
            depth_attachment,
            accesses,
            record: Box::new(record),
        });
    }

    pub fn build_acceleration_structures(&mut self, scratch: BufferView) {
        let sb = scratch.buffer;
        let idx = self.push(CommandNode::BuildAccelerationStructures { scratch });
        self.mark_usage(&sb, idx);
    }

    /// Declares that, after this job's signal timestamp, `target` will be
    /// read from `dst_family` in `access`. Marks the job-local resource (if
    /// any) as exported, extending its lifetime to the end of the job.
    pub fn export_buffer(&mut self, target: BufferView, access: ResourceAccess, dst_family: u32) {
        let buffer = target.buffer;
        if let BufferRef::JobLocal(i) = buffer {
            self.job.local_buffers[i as usize].lifetime.mark_exported();
        }
        self.push(CommandNode::ExportBuffer { target, access, dst_family });
    }

    pub fn export_image(&mut self, target: ImageView, access: ResourceAccess, layout: Layout, dst_family: u32) {
        let image = target.image;
        if let ImageRef::JobLocal(i) = image {
            self.job.local_images[i as usize].lifetime.mark_exported();
        }
        self.push(CommandNode::ExportImage { target, access, layout, dst_family });
    }

    pub fn discard_image_contents(&mut self, target: ImageView) {
        let ti = target.image;
        let idx = self.push(CommandNode::DiscardImageContents { target });
        self.mark_image_usage(&ti, idx);
    }

    pub fn import_external_buffer(&mut self, target: BufferId, access: ResourceAccess) {
        self.push(CommandNode::ImportExternalBuffer { target, access });
    }

    pub fn import_external_image(&mut self, target: ImageId, access: ResourceAccess, layout: Layout) {
        self.push(CommandNode::ImportExternalImage { target, access, layout });
    }

    pub fn begin_debug_label(&mut self, label: impl Into<String>) {
        self.push(CommandNode::BeginDebugLabel { label: label.into() });
    }

    pub fn insert_debug_label(&mut self, label: impl Into<String>) {
        self.push(CommandNode::InsertDebugLabel { label: label.into() });
    }

    pub fn end_debug_label(&mut self) {
        self.push(CommandNode::EndDebugLabel);
    }

    pub fn write_timestamp(&mut self, query_pool: vk::QueryPool, query: u32, stage: vk::PipelineStageFlags) {
        self.push(CommandNode::WriteTimestamp { query_pool, query, stage });
    }

    /// Declares a fresh job-local buffer and returns a view over it; its
    /// backing buffer is bound only at job-compile time.
    pub fn create_local_buffer(&mut self, requirements: crate::resource::AllocationRequirements) -> BufferView {
        let index = self.job.local_buffers.len() as u32;
        let size = requirements.size;
        self.job.local_buffers.push(super::LocalResourceSlot {
            requirements,
            lifetime: crate::transient::Lifetime { first_cmd: usize::MAX, last_cmd: 0 },
            resolved: None,
        });
        BufferView { buffer: BufferRef::JobLocal(index), offset: 0, size, format: None }
    }

    pub fn create_local_image(&mut self, range: ImageAccessRange, requirements: crate::resource::AllocationRequirements) -> ImageView {
        let index = self.job.local_images.len() as u32;
        self.job.local_images.push(super::LocalResourceSlot {
            requirements,
            lifetime: crate::transient::Lifetime { first_cmd: usize::MAX, last_cmd: 0 },
            resolved: None,
        });
        ImageView { image: ImageRef::JobLocal(index), range, view_type: vk::ImageViewType::TYPE_2D, format: vk::Format::UNDEFINED }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_marks_both_sides_usage() {
        let mut job = Job::new(0);
        let mut rec = JobRecorder::new(&mut job);
        let a = rec.create_local_buffer(crate::resource::AllocationRequirements {
            memory_type_bits: 1,
            size: 16,
            alignment: 4,
            memory_info: Default::default(),
            compatibility_class: 0,
        });
        let b = rec.create_local_buffer(crate::resource::AllocationRequirements {
            memory_type_bits: 1,
            size: 16,
            alignment: 4,
            memory_info: Default::default(),
            compatibility_class: 0,
        });
        rec.copy_buffer(a, b);
        assert_eq!(job.local_buffers[0].lifetime.last_cmd, 0);
        assert_eq!(job.local_buffers[1].lifetime.last_cmd, 0);
        assert_eq!(job.storage.len(), 1);
    }
}
