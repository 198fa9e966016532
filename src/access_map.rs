//! Access maps: per-resource state tracking the last write, accumulated
//! reads since that write, and the barrier each side attaches to, so that
//! `synchronize_new_access` can emit the minimal barrier needed between two
//! incompatible accesses.
//!
//! Grounded on `graal`'s `ResourceTrackingInfo` (`context/resource.rs`),
//! generalized from a single current-access field per resource to a
//! range-keyed map of entries.

use crate::barrier::{BarrierList, BufferMemoryDependency, ImageMemoryDependency};
use crate::resource::{BufferAccessRange, BufferId, ImageAccessRange, ImageId, Layout, ResourceAccess};
use ash::vk;
use std::collections::BTreeMap;

/// Per-range bookkeeping shared by the buffer and image access maps.
#[derive(Clone, Debug, Default)]
struct Entry {
    last_write_access: Option<ResourceAccess>,
    barrier_index_after_write: Option<usize>,
    last_read_accesses: Option<ResourceAccess>,
    barrier_index_after_reads: Option<usize>,
    /// At least one of the last accesses recorded against this entry was an
    /// export; protects the entry from being folded into a pre-export
    /// barrier once the export has been observed by a later command.
    was_exported: bool,
    /// Current image layout; unused for buffers.
    layout: Layout,
}

impl Entry {
    fn fresh() -> Entry {
        Entry { layout: Layout::Undefined, ..Default::default() }
    }
}

/// Ordered mapping from non-overlapping byte ranges to their access state.
pub struct BufferAccessMap {
    id: BufferId,
    entries: BTreeMap<BufferAccessRangeKey, Entry>,
}

/// `BufferAccessRange` doesn't implement a total `Ord` usable for `BTreeMap`
/// iteration order directly (overlap makes it a partial order); the map
/// instead keys by offset and keeps entries non-overlapping by construction,
/// so ties never occur once inserted.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
struct BufferAccessRangeKey(u64, u64);

impl From<BufferAccessRange> for BufferAccessRangeKey {
    fn from(r: BufferAccessRange) -> Self {
        BufferAccessRangeKey(r.offset, r.size)
    }
}

impl BufferAccessRangeKey {
    fn range(&self) -> BufferAccessRange {
        BufferAccessRange { offset: self.0, size: self.1 }
    }
}

impl BufferAccessMap {
    pub fn new(id: BufferId) -> BufferAccessMap {
        let mut entries = BTreeMap::new();
        entries.insert(BufferAccessRangeKey::from(BufferAccessRange::EVERYTHING), Entry::fresh());
        BufferAccessMap { id, entries }
    }

    fn overlapping_keys(&self, range: BufferAccessRange) -> Vec<BufferAccessRangeKey> {
        self.entries
            .keys()
            .copied()
            .filter(|k| k.range().overlaps(&range))
            .collect()
    }

    /// Computes and emits the barriers needed to synchronize `new_access`
    /// against whatever is currently recorded for `range`, per §4.5's
    /// read-after-write / write-after-read / write-after-write rules.
    /// Returns the barrier index the new access should be recorded against,
    /// if any barrier was needed.
    pub fn synchronize_new_access(
        &mut self,
        range: BufferAccessRange,
        new_access: ResourceAccess,
        cmd_index: usize,
        barriers: &mut BarrierList,
    ) -> Option<usize> {
        let mut last_barrier = None;
        for key in self.overlapping_keys(range) {
            let entry = self.entries.get(&key).unwrap().clone();

            if new_access.is_read_only() {
                if let Some(prev_reads) = entry.last_read_accesses {
                    if new_access.is_subsumed_by(&prev_reads) {
                        continue;
                    }
                }
            }

            if let Some(write) = entry.last_write_access {
                // Read-after-write or write-after-write: dependency over the
                // entry's whole range.
                let floor = entry.barrier_index_after_write.unwrap_or(0);
                let idx = barriers.synchronize_dependency(
                    write.stage_mask,
                    new_access.stage_mask,
                    cmd_index,
                    floor,
                    entry.was_exported,
                );
                barriers.add_buffer_dependency(
                    idx,
                    BufferMemoryDependency {
                        buffer: self.id,
                        range: key.range(),
                        src_access_mask: write.access_mask,
                        dst_access_mask: new_access.access_mask,
                        src_queue_family: None,
                        dst_queue_family: None,
                    },
                );
                last_barrier = Some(idx);
            } else if new_access.is_write() {
                if let Some(reads) = entry.last_read_accesses {
                    // Write-after-read: single barrier covering prior reads.
                    let floor = entry.barrier_index_after_reads.unwrap_or(0);
                    let idx = barriers.synchronize_dependency(
                        reads.stage_mask,
                        new_access.stage_mask,
                        cmd_index,
                        floor,
                        entry.was_exported,
                    );
                    barriers.add_buffer_dependency(
                        idx,
                        BufferMemoryDependency {
                            buffer: self.id,
                            range: key.range(),
                            src_access_mask: reads.access_mask,
                            dst_access_mask: new_access.access_mask,
                            src_queue_family: None,
                            dst_queue_family: None,
                        },
                    );
                    last_barrier = Some(idx);
                }
            }
        }
        last_barrier
    }

    /// Updates the map to reflect `new_access` having been recorded at
    /// `next_barrier_index`. Read accesses (without `force_overwrite`)
    /// extend existing entries; writes split and overwrite.
    pub fn insert_new_access(
        &mut self,
        range: BufferAccessRange,
        new_access: ResourceAccess,
        next_barrier_index: Option<usize>,
        force_overwrite: bool,
        is_export: bool,
    ) {
        if new_access.is_read_only() && !force_overwrite {
            for key in self.overlapping_keys(range) {
                let entry = self.entries.get_mut(&key).unwrap();
                entry.last_read_accesses = Some(match entry.last_read_accesses {
                    Some(existing) => existing.union(&new_access),
                    None => new_access,
                });
                entry.barrier_index_after_reads = next_barrier_index.or(entry.barrier_index_after_reads);
                entry.was_exported |= is_export;
            }
            return;
        }

        // Write (or forced overwrite): split overlapping entries at range's
        // boundaries, keeping the parts outside [range] untouched, and
        // install a fresh entry for [range].
        let mut to_insert = Vec::new();
        for key in self.overlapping_keys(range) {
            let old_range = key.range();
            let entry = self.entries.remove(&key).unwrap();
            if let Some(left) = old_range.left_diff(&range) {
                to_insert.push((left, entry.clone()));
            }
            if let Some(right) = old_range.right_diff(&range) {
                to_insert.push((right, entry));
            }
        }
        for (r, e) in to_insert {
            self.entries.insert(r.into(), e);
        }
        self.entries.insert(
            range.into(),
            Entry {
                last_write_access: Some(new_access),
                barrier_index_after_write: next_barrier_index,
                last_read_accesses: None,
                barrier_index_after_reads: None,
                was_exported: is_export,
                layout: Layout::Undefined,
            },
        );
    }
}

/// Image access map: conceptually identical to the buffer case, but range
/// algebra is three-dimensional and there is no total order, so entries are
/// kept in a flat vector with tombstones removed at `compact_and_reset`.
pub struct ImageAccessMap {
    id: ImageId,
    entries: Vec<(ImageAccessRange, Entry)>,
    /// Job id this map was last compacted against; compaction runs lazily
    /// when the job id changes (i.e. at job boundaries).
    last_compacted_job: u64,
}

impl ImageAccessMap {
    pub fn new(id: ImageId, whole_range: ImageAccessRange) -> ImageAccessMap {
        ImageAccessMap { id, entries: vec![(whole_range, Entry::fresh())], last_compacted_job: 0 }
    }

    fn overlapping_indices(&self, range: ImageAccessRange) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, (r, _))| r.layer_count > 0 && r.overlaps(&range))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn synchronize_new_access(
        &mut self,
        range: ImageAccessRange,
        new_access: ResourceAccess,
        new_layout: Layout,
        cmd_index: usize,
        barriers: &mut BarrierList,
    ) -> Option<usize> {
        let mut last_barrier = None;
        for i in self.overlapping_indices(range) {
            let (entry_range, entry) = self.entries[i].clone();
            let needs_layout_transition = entry.layout != new_layout;
            // A layout transition is treated as a write even for a
            // read-only access mask.
            let effective_write = new_access.is_write() || needs_layout_transition;

            if !effective_write {
                if let Some(prev_reads) = entry.last_read_accesses {
                    if new_access.is_subsumed_by(&prev_reads) {
                        continue;
                    }
                }
            }

            if let Some(write) = entry.last_write_access {
                let floor = entry.barrier_index_after_write.unwrap_or(0);
                let idx = barriers.synchronize_dependency(
                    write.stage_mask,
                    new_access.stage_mask,
                    cmd_index,
                    floor,
                    entry.was_exported,
                );
                barriers.add_image_dependency(
                    idx,
                    ImageMemoryDependency {
                        image: self.id,
                        range: entry_range,
                        src_access_mask: write.access_mask,
                        dst_access_mask: new_access.access_mask,
                        old_layout: entry.layout,
                        new_layout,
                        src_queue_family: None,
                        dst_queue_family: None,
                    },
                );
                last_barrier = Some(idx);
            } else if effective_write {
                if let Some(reads) = entry.last_read_accesses {
                    let floor = entry.barrier_index_after_reads.unwrap_or(0);
                    let idx = barriers.synchronize_dependency(
                        reads.stage_mask,
                        new_access.stage_mask,
                        cmd_index,
                        floor,
                        entry.was_exported,
                    );
                    barriers.add_image_dependency(
                        idx,
                        ImageMemoryDependency {
                            image: self.id,
                            range: entry_range,
                            src_access_mask: reads.access_mask,
                            dst_access_mask: new_access.access_mask,
                            old_layout: entry.layout,
                            new_layout,
                            src_queue_family: None,
                            dst_queue_family: None,
                        },
                    );
                    last_barrier = Some(idx);
                } else if needs_layout_transition {
                    // First touch with a layout change but no prior access:
                    // still need a transition barrier out of the entry's
                    // (possibly Undefined) layout.
                    let idx = barriers.synchronize_dependency(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        new_access.stage_mask,
                        cmd_index,
                        0,
                        entry.was_exported,
                    );
                    barriers.add_image_dependency(
                        idx,
                        ImageMemoryDependency {
                            image: self.id,
                            range: entry_range,
                            src_access_mask: vk::AccessFlags::empty(),
                            dst_access_mask: new_access.access_mask,
                            old_layout: entry.layout,
                            new_layout,
                            src_queue_family: None,
                            dst_queue_family: None,
                        },
                    );
                    last_barrier = Some(idx);
                }
            }
        }
        last_barrier
    }

    pub fn insert_new_access(
        &mut self,
        range: ImageAccessRange,
        new_access: ResourceAccess,
        new_layout: Layout,
        next_barrier_index: Option<usize>,
        force_overwrite: bool,
        is_export: bool,
    ) {
        let is_write_like = new_access.is_write() || force_overwrite;
        if !is_write_like {
            // Still need to check per-overlap whether a layout transition
            // forces an overwrite for that particular entry.
            let mut plain_read_indices = Vec::new();
            let mut overwrite_ranges = Vec::new();
            for i in self.overlapping_indices(range) {
                if self.entries[i].1.layout == new_layout {
                    plain_read_indices.push(i);
                } else {
                    overwrite_ranges.push(self.entries[i].0);
                }
            }
            for i in plain_read_indices {
                let entry = &mut self.entries[i].1;
                entry.last_read_accesses = Some(match entry.last_read_accesses {
                    Some(existing) => existing.union(&new_access),
                    None => new_access,
                });
                entry.barrier_index_after_reads = next_barrier_index.or(entry.barrier_index_after_reads);
                entry.was_exported |= is_export;
            }
            for r in overwrite_ranges {
                self.overwrite_range(r, new_access, new_layout, next_barrier_index, is_export, true);
            }
            return;
        }

        self.overwrite_range(range, new_access, new_layout, next_barrier_index, is_export, false);
    }

    fn overwrite_range(
        &mut self,
        range: ImageAccessRange,
        new_access: ResourceAccess,
        new_layout: Layout,
        next_barrier_index: Option<usize>,
        is_export: bool,
        read_only_transition: bool,
    ) {
        let read_access = if read_only_transition {
            Some(new_access)
        } else {
            None
        };
        for i in self.overlapping_indices(range) {
            let old_range = self.entries[i].0;
            // Tombstone the old entry; split remainders are appended fresh.
            for split in split_remainder(old_range, range) {
                self.entries.push((split, self.entries[i].1.clone()));
            }
            self.entries[i].0.layer_count = 0;
        }
        self.entries.push((
            range,
            Entry {
                last_write_access: if read_only_transition { None } else { Some(new_access) },
                barrier_index_after_write: if read_only_transition { None } else { next_barrier_index },
                last_read_accesses: read_access,
                barrier_index_after_reads: if read_only_transition { next_barrier_index } else { None },
                was_exported: is_export,
                layout: new_layout,
            },
        ));
    }

    /// Splits overlapping image access ranges by layer-only subtraction
    /// (aspect/mip subtraction would require richer splitting; layer
    /// subtraction handles the common discard/overwrite pattern that splits
    /// on array layers, matching `discard_contents`'s use case).
    pub fn discard_contents(&mut self, range: ImageAccessRange) {
        for i in self.overlapping_indices(range) {
            let old_range = self.entries[i].0;
            for split in split_remainder(old_range, range) {
                self.entries.push((split, self.entries[i].1.clone()));
            }
            // Tombstone the old entry and replace it with the intersected
            // range, reset to Undefined with no barrier to synchronize
            // against — a subsequent transition may use Undefined as the
            // source layout and skip preserving the contents.
            self.entries[i].0.layer_count = 0;
            let remaining = intersect_layers(old_range, range);
            self.entries.push((remaining, Entry { layout: Layout::Undefined, ..Default::default() }));
        }
    }

    /// Drops tombstoned entries (`layer_count == 0`) accumulated since the
    /// last compaction; runs lazily when the owning job id changes.
    pub fn compact_and_reset(&mut self, job_id: u64) {
        if job_id == self.last_compacted_job {
            return;
        }
        self.entries.retain(|(r, _)| r.layer_count != 0);
        for (_, e) in self.entries.iter_mut() {
            e.barrier_index_after_write = None;
            e.barrier_index_after_reads = None;
        }
        self.last_compacted_job = job_id;
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(r, _)| r.layer_count != 0).count()
    }
}

fn intersect_layers(a: ImageAccessRange, b: ImageAccessRange) -> ImageAccessRange {
    let base = a.base_array_layer.max(b.base_array_layer);
    let end = a.end_layer().min(b.end_layer());
    ImageAccessRange {
        aspect_mask: a.aspect_mask & b.aspect_mask,
        base_array_layer: base,
        layer_count: end.saturating_sub(base),
        mip_mask: a.mip_mask & b.mip_mask,
    }
}

/// Layer-interval remainder of `old_range` outside `cut`, preserving aspect
/// and mip mask (a simplification: full aspect/mip subtraction is not
/// needed by any command this crate emits, since discards and overwrites
/// always operate on a whole aspect/mip selection already).
fn split_remainder(old_range: ImageAccessRange, cut: ImageAccessRange) -> Vec<ImageAccessRange> {
    let mut out = Vec::new();
    if old_range.base_array_layer < cut.base_array_layer {
        out.push(ImageAccessRange {
            aspect_mask: old_range.aspect_mask,
            base_array_layer: old_range.base_array_layer,
            layer_count: cut.base_array_layer - old_range.base_array_layer,
            mip_mask: old_range.mip_mask,
        });
    }
    if old_range.end_layer() > cut.end_layer() {
        out.push(ImageAccessRange {
            aspect_mask: old_range.aspect_mask,
            base_array_layer: cut.end_layer(),
            layer_count: old_range.end_layer() - cut.end_layer(),
            mip_mask: old_range.mip_mask,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{AccessFlags, PipelineStageFlags};
    use slotmap::SlotMap;

    fn read(stage: PipelineStageFlags, access: AccessFlags) -> ResourceAccess {
        ResourceAccess { stage_mask: stage, access_mask: access }
    }

    fn buffer_id() -> BufferId {
        let mut keys: SlotMap<crate::resource::ResourceId, ()> = SlotMap::with_key();
        BufferId(keys.insert(()))
    }

    fn image_id() -> ImageId {
        let mut keys: SlotMap<crate::resource::ResourceId, ()> = SlotMap::with_key();
        ImageId(keys.insert(()))
    }

    #[test]
    fn fresh_buffer_map_covers_whole_range_with_no_access() {
        let map = BufferAccessMap::new(buffer_id());
        assert_eq!(map.entries.len(), 1);
    }

    #[test]
    fn write_then_read_emits_one_barrier() {
        let mut map = BufferAccessMap::new(buffer_id());
        let mut barriers = BarrierList::new();
        let range = BufferAccessRange { offset: 0, size: 64 };
        let write = read(PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_WRITE);
        map.insert_new_access(range, write, None, false, false);

        let read_access = read(PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_READ);
        let b = map.synchronize_new_access(range, read_access, 1, &mut barriers);
        assert!(b.is_some());
        assert_eq!(barriers.len(), 1);
        map.insert_new_access(range, read_access, b, false, false);

        // a second identical read is subsumed, no new barrier
        let b2 = map.synchronize_new_access(range, read_access, 2, &mut barriers);
        assert!(b2.is_none());
        assert_eq!(barriers.len(), 1);
    }

    #[test]
    fn two_read_only_accesses_need_no_barrier() {
        let mut map = BufferAccessMap::new(buffer_id());
        let mut barriers = BarrierList::new();
        let range = BufferAccessRange { offset: 0, size: 64 };
        let r1 = read(PipelineStageFlags::FRAGMENT_SHADER, AccessFlags::SHADER_READ);
        let b1 = map.synchronize_new_access(range, r1, 0, &mut barriers);
        assert!(b1.is_none());
        map.insert_new_access(range, r1, b1, false, false);
        assert_eq!(barriers.len(), 0);
    }

    #[test]
    fn image_discard_then_transition_still_emits_barrier() {
        let whole = ImageAccessRange::whole(vk::ImageAspectFlags::COLOR, 1, 1);
        let mut map = ImageAccessMap::new(image_id(), whole);
        map.discard_contents(whole);
        let mut barriers = BarrierList::new();
        let access = read(PipelineStageFlags::TRANSFER, AccessFlags::TRANSFER_READ);
        let b = map.synchronize_new_access(whole, access, Layout::TransferSrc, 0, &mut barriers);
        assert!(b.is_some());
    }
}
