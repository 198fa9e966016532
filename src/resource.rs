//! Resources and views: buffers, images, and the non-owning view types used
//! to address subranges of them.
//!
//! Grounded on `graal`'s `context/resource.rs` (`ResourceId`, `BufferId`,
//! `ImageId`, `ResourceMemoryInfo`, `ImageResourceCreateInfo`,
//! `BufferResourceCreateInfo`) generalized to the job-local/job-imported
//! distinction that the transient allocator and job IR need.

use ash::vk;
use slotmap::new_key_type;

new_key_type! {
    /// Slotmap key identifying a resource tracked by a `PerQueueState`.
    pub struct ResourceId;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BufferId(pub ResourceId);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageId(pub ResourceId);

/// Memory placement requirements for a resource.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ResourceMemoryInfo {
    pub required_flags: vk::MemoryPropertyFlags,
    pub preferred_flags: vk::MemoryPropertyFlags,
}

impl ResourceMemoryInfo {
    pub const DEVICE_LOCAL: ResourceMemoryInfo = ResourceMemoryInfo {
        required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        preferred_flags: vk::MemoryPropertyFlags::empty(),
    };

    pub const HOST_VISIBLE: ResourceMemoryInfo = ResourceMemoryInfo {
        required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        preferred_flags: vk::MemoryPropertyFlags::HOST_COHERENT,
    };

    pub const STAGING: ResourceMemoryInfo = ResourceMemoryInfo {
        required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        preferred_flags: vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_COHERENT.as_raw() | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
        ),
    };

    pub const fn device_local(&self) -> bool {
        self.required_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    pub const fn host_visible(&self) -> bool {
        self.required_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub const fn host_coherent(&self) -> bool {
        self.preferred_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

impl Default for ResourceMemoryInfo {
    fn default() -> Self {
        ResourceMemoryInfo::DEVICE_LOCAL
    }
}

/// Allocation requirements derived from a resource's create info, used by the
/// transient allocator to decide whether two resources may share backing
/// memory.
#[derive(Copy, Clone, Debug)]
pub struct AllocationRequirements {
    pub memory_type_bits: u32,
    pub size: u64,
    pub alignment: u64,
    pub memory_info: ResourceMemoryInfo,
    /// Image format class / dedicated-allocation compatibility tag; two
    /// requirements are aliasable only if this matches.
    pub compatibility_class: u64,
}

impl AllocationRequirements {
    /// Adjusts `self` to be able to satisfy both `self` and `other`
    /// (widened alignment, max size), or returns `None` if the two are not
    /// compatible (different memory-type bits or compatibility class).
    pub fn try_adjust(&self, other: &AllocationRequirements) -> Option<AllocationRequirements> {
        let memory_type_bits = self.memory_type_bits & other.memory_type_bits;
        if memory_type_bits == 0 {
            return None;
        }
        if self.compatibility_class != other.compatibility_class {
            return None;
        }
        Some(AllocationRequirements {
            memory_type_bits,
            size: self.size.max(other.size),
            alignment: self.alignment.max(other.alignment),
            memory_info: self.memory_info,
            compatibility_class: self.compatibility_class,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BufferResourceCreateInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_info: ResourceMemoryInfo,
}

#[derive(Copy, Clone, Debug)]
pub struct ImageResourceCreateInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_info: ResourceMemoryInfo,
}

/// Image layouts, generalized from Vulkan's `VkImageLayout`. `Undefined`
/// means "contents may be discarded on the next transition".
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Layout {
    Undefined,
    General,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    PresentSrc,
}

impl Layout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Layout::Undefined => vk::ImageLayout::UNDEFINED,
            Layout::General => vk::ImageLayout::GENERAL,
            Layout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Layout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Layout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Layout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Layout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Layout::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Layout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// (stage mask, access mask) pair describing how a command touches a
/// resource. Read-only iff `access_mask` contains no write bit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ResourceAccess {
    pub stage_mask: vk::PipelineStageFlags,
    pub access_mask: vk::AccessFlags,
}

/// Write bits, statically enumerated, used to decide read-only-ness.
const WRITE_ACCESS_BITS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw()
        | vk::AccessFlags::TRANSFORM_FEEDBACK_WRITE_EXT.as_raw()
        | vk::AccessFlags::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT.as_raw()
        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

impl ResourceAccess {
    pub fn is_write(&self) -> bool {
        self.access_mask.intersects(WRITE_ACCESS_BITS)
    }

    pub fn is_read_only(&self) -> bool {
        !self.is_write()
    }

    /// Whether `self`'s stage and access bits are both contained in `other`.
    pub fn is_subsumed_by(&self, other: &ResourceAccess) -> bool {
        other.stage_mask.contains(self.stage_mask) && other.access_mask.contains(self.access_mask)
    }

    pub fn union(&self, other: &ResourceAccess) -> ResourceAccess {
        ResourceAccess {
            stage_mask: self.stage_mask | other.stage_mask,
            access_mask: self.access_mask | other.access_mask,
        }
    }
}

/// A buffer access range: `[offset, offset+size)`. Ranges are ordered for
/// map insertion such that neither `<` nor `>` holds if they overlap — see
/// the `Ord` impl used by `BufferAccessMap`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BufferAccessRange {
    pub offset: u64,
    pub size: u64,
}

impl BufferAccessRange {
    pub const EVERYTHING: BufferAccessRange = BufferAccessRange { offset: 0, size: u64::MAX };

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn overlaps(&self, other: &BufferAccessRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// `self` restricted to the region strictly before `other`.
    pub fn left_diff(&self, other: &BufferAccessRange) -> Option<BufferAccessRange> {
        if self.offset < other.offset {
            Some(BufferAccessRange { offset: self.offset, size: other.offset - self.offset })
        } else {
            None
        }
    }

    /// `self` restricted to the region strictly after `other`.
    pub fn right_diff(&self, other: &BufferAccessRange) -> Option<BufferAccessRange> {
        if self.end() > other.end() {
            Some(BufferAccessRange { offset: other.end(), size: self.end() - other.end() })
        } else {
            None
        }
    }
}

/// Non-overlap partial order: ranges that overlap are incomparable, matching
/// the invariant that a `BTreeMap<BufferAccessRange, _>` keyed this way never
/// holds two overlapping keys.
impl PartialOrd for BufferAccessRange {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.overlaps(other) {
            None
        } else {
            Some(self.offset.cmp(&other.offset))
        }
    }
}

impl Ord for BufferAccessRange {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Total order required by BTreeMap; overlap is checked explicitly by
        // callers before relying on ordering semantics for correctness.
        self.offset.cmp(&other.offset).then(self.size.cmp(&other.size))
    }
}

/// An image subresource range: (aspect mask, base array layer, layer count,
/// mip mask). Two ranges overlap iff their layer intervals overlap, their
/// aspect masks share a bit, and their mip masks share a bit. At most 32 mip
/// levels are representable.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ImageAccessRange {
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub mip_mask: u32,
}

impl ImageAccessRange {
    pub fn whole(aspect_mask: vk::ImageAspectFlags, layer_count: u32, mip_levels: u32) -> ImageAccessRange {
        assert!(mip_levels <= 32);
        let mip_mask = if mip_levels == 32 { u32::MAX } else { (1u32 << mip_levels) - 1 };
        ImageAccessRange { aspect_mask, base_array_layer: 0, layer_count, mip_mask }
    }

    pub fn end_layer(&self) -> u32 {
        self.base_array_layer + self.layer_count
    }

    pub fn overlaps(&self, other: &ImageAccessRange) -> bool {
        let layers_overlap = self.base_array_layer < other.end_layer() && other.base_array_layer < self.end_layer();
        let aspects_overlap = self.aspect_mask.intersects(other.aspect_mask);
        let mips_overlap = self.mip_mask & other.mip_mask != 0;
        layers_overlap && aspects_overlap && mips_overlap
    }

    /// Splits a non-contiguous mip mask into the contiguous runs it is made
    /// of, each yielded as its own range sharing this range's aspect/layers.
    pub fn split_contiguous_mips(&self) -> Vec<ImageAccessRange> {
        let mut out = Vec::new();
        let mut mask = self.mip_mask;
        while mask != 0 {
            let start = mask.trailing_zeros();
            let mut run = mask >> start;
            let mut len = 0u32;
            while run & 1 != 0 {
                len += 1;
                run >>= 1;
            }
            let run_mask = ((1u64 << len) - 1) as u32;
            out.push(ImageAccessRange {
                aspect_mask: self.aspect_mask,
                base_array_layer: self.base_array_layer,
                layer_count: self.layer_count,
                mip_mask: run_mask << start,
            });
            mask &= !(run_mask << start);
        }
        out
    }
}

/// (buffer reference, offset, size, optional texel format). A value type:
/// two overlapping views may address the same bytes.
#[derive(Copy, Clone, Debug)]
pub struct BufferView {
    pub buffer: BufferRef,
    pub offset: u64,
    pub size: u64,
    pub format: Option<vk::Format>,
}

impl BufferView {
    pub fn range(&self) -> BufferAccessRange {
        BufferAccessRange { offset: self.offset, size: self.size }
    }
}

/// A reference to a buffer, distinguishing resources whose native handle is
/// already known from job-local buffers whose backing is bound only at job
/// compile time.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BufferRef {
    Resource(BufferId),
    /// Index into the owning job's local-buffer table; resolved to a
    /// concrete `BufferId` by the transient allocator at compile time.
    JobLocal(u32),
}

#[derive(Copy, Clone, Debug)]
pub struct ImageView {
    pub image: ImageRef,
    pub range: ImageAccessRange,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImageRef {
    Resource(ImageId),
    JobLocal(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_ranges_overlap_detection() {
        let a = BufferAccessRange { offset: 0, size: 16 };
        let b = BufferAccessRange { offset: 8, size: 16 };
        let c = BufferAccessRange { offset: 16, size: 16 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.partial_cmp(&b), None);
        assert!(a.partial_cmp(&c).is_some());
    }

    #[test]
    fn buffer_range_diff() {
        let whole = BufferAccessRange { offset: 0, size: 100 };
        let middle = BufferAccessRange { offset: 40, size: 20 };
        assert_eq!(whole.left_diff(&middle), Some(BufferAccessRange { offset: 0, size: 40 }));
        assert_eq!(whole.right_diff(&middle), Some(BufferAccessRange { offset: 60, size: 40 }));
    }

    #[test]
    fn image_ranges_overlap_on_aspect_layer_and_mip() {
        let a = ImageAccessRange { aspect_mask: vk::ImageAspectFlags::COLOR, base_array_layer: 0, layer_count: 2, mip_mask: 0b0001 };
        let b = ImageAccessRange { aspect_mask: vk::ImageAspectFlags::COLOR, base_array_layer: 1, layer_count: 2, mip_mask: 0b0011 };
        let c = ImageAccessRange { aspect_mask: vk::ImageAspectFlags::DEPTH, base_array_layer: 0, layer_count: 2, mip_mask: 0b0001 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn noncontiguous_mip_mask_splits() {
        let r = ImageAccessRange { aspect_mask: vk::ImageAspectFlags::COLOR, base_array_layer: 0, layer_count: 1, mip_mask: 0b10110 };
        let parts = r.split_contiguous_mips();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].mip_mask, 0b00110);
        assert_eq!(parts[1].mip_mask, 0b10000);
    }
}
