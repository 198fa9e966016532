//! Transient Resource Allocator: aliases job-local buffers and images by
//! lifetime analysis, and serves preinitialized (host-mapped, never
//! aliased) buffers from a growable ring buffer.
//!
//! Grounded on `graal`'s `context/transient.rs` (`allocate_memory_for_transients`,
//! `Reachability`/`compute_reachability`, `ResourceOwnership`). Works purely
//! in terms of size/alignment/lifetime; the concrete memory allocator lives
//! behind the native API boundary.

use crate::pool::OverallocationBehavior;
use crate::resource::AllocationRequirements;
use fixedbitset::FixedBitSet;

/// `[first_cmd, last_cmd]` inclusive lifetime of a job-local resource within
/// its job's command stream. Exports set `last_cmd = usize::MAX`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Lifetime {
    pub first_cmd: usize,
    pub last_cmd: usize,
}

impl Lifetime {
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.first_cmd <= other.last_cmd && other.first_cmd <= self.last_cmd
    }

    pub fn mark_usage(&mut self, cmd_index: usize) {
        self.first_cmd = self.first_cmd.min(cmd_index);
        self.last_cmd = self.last_cmd.max(cmd_index);
    }

    /// Marks the resource as exported: its lifetime now extends to the end
    /// of the job, since an external consumer may touch it at any later
    /// point.
    pub fn mark_exported(&mut self) {
        self.last_cmd = usize::MAX;
    }
}

/// A job-local transient awaiting backing assignment.
pub struct Transient {
    pub requirements: AllocationRequirements,
    pub lifetime: Lifetime,
    /// Backing slot index assigned by `pack`, filled in after allocation.
    pub assigned_slot: Option<usize>,
}

/// Directed-acyclic-graph reachability between transients' lifetimes, used
/// to determine whether two transients can share a slot: graal computes this
/// over the pass dependency DAG; here, since job-local resources are only
/// ordered by command index within one job, "reaches" degenerates to
/// "lifetime does not overlap", but the bitset representation is kept so the
/// aliasing algorithm reads the same as the one it's grounded on.
pub struct Reachability {
    aliasable: FixedBitSet,
    n: usize,
}

impl Reachability {
    pub fn compute(transients: &[Transient]) -> Reachability {
        let n = transients.len();
        let mut aliasable = FixedBitSet::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                if i != j && !transients[i].lifetime.overlaps(&transients[j].lifetime) {
                    aliasable.insert(i * n + j);
                }
            }
        }
        Reachability { aliasable, n }
    }

    pub fn may_alias(&self, a: usize, b: usize) -> bool {
        a != b && self.aliasable.contains(a * self.n + b) && self.aliasable.contains(b * self.n + a)
    }
}

/// A backing slot produced by packing: a merged allocation requirement and
/// the list of transient indices assigned to it.
pub struct Slot {
    pub requirements: AllocationRequirements,
    pub members: Vec<usize>,
}

/// Packs `transients` into the minimum number of backing slots such that
/// slot members have pairwise non-overlapping lifetimes and compatible
/// requirements, processing in largest-first order to avoid suboptimal early
/// commitments (per §4.8).
pub fn pack(transients: &[Transient]) -> Vec<Slot> {
    let reach = Reachability::compute(transients);
    let mut order: Vec<usize> = (0..transients.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(transients[i].requirements.size));

    let mut slots: Vec<Slot> = Vec::new();
    for &i in &order {
        let mut placed = false;
        for slot in slots.iter_mut() {
            let compatible = slot.members.iter().all(|&m| reach.may_alias(i, m));
            if !compatible {
                continue;
            }
            if let Some(adjusted) = slot.requirements.try_adjust(&transients[i].requirements) {
                slot.requirements = adjusted;
                slot.members.push(i);
                placed = true;
                break;
            }
        }
        if !placed {
            slots.push(Slot { requirements: transients[i].requirements, members: vec![i] });
        }
    }
    slots
}

/// Total bytes requested (sum of every transient's size) versus committed
/// (sum of each slot's merged size) — the statistic exercised by the
/// end-to-end aliasing scenarios.
pub fn requested_and_committed_bytes(transients: &[Transient], slots: &[Slot]) -> (u64, u64) {
    let requested = transients.iter().map(|t| t.requirements.size).sum();
    let committed = slots.iter().map(|s| s.requirements.size).sum();
    (requested, committed)
}

/// A single backing region of the preinitialized-buffer ring: a native
/// buffer with a head/tail offset pair.
struct Region {
    capacity: u64,
    head: u64,
    tail: u64,
    /// FIFO of (end-offset-exclusive, timestamp) for live pushes, used by
    /// `pop` to free from the head in push order.
    live: std::collections::VecDeque<(u64, u64)>,
}

impl Region {
    fn new(capacity: u64) -> Region {
        Region { capacity, head: 0, tail: 0, live: Default::default() }
    }

    fn free_bytes(&self) -> u64 {
        if self.live.is_empty() {
            self.capacity
        } else {
            // Conservative: only the tail..capacity and 0..head spans are
            // free once the region has wrapped; while unwrapped, everything
            // after `tail` is free.
            self.capacity - (self.tail - self.head)
        }
    }
}

/// Growable ring buffer of host-mapped, never-aliased storage for
/// job-local "preinitialized" buffers (per §4.8's third sub-allocator).
pub struct PreinitializedBuffers {
    regions: std::collections::VecDeque<Region>,
    overallocation: OverallocationBehavior,
    alignment: u64,
    total_bytes: u64,
}

/// Opaque handle returned by `push`, identifying the region and byte range
/// a caller was granted.
#[derive(Copy, Clone, Debug)]
pub struct PreinitAllocation {
    pub region_index: usize,
    pub offset: u64,
    pub size: u64,
}

impl PreinitializedBuffers {
    pub fn new(alignment: u64, overallocation: OverallocationBehavior) -> PreinitializedBuffers {
        PreinitializedBuffers { regions: Default::default(), overallocation, alignment, total_bytes: 0 }
    }

    fn align_up(&self, x: u64) -> u64 {
        let a = self.alignment;
        (x + a - 1) / a * a
    }

    /// Walks regions from the current head, accommodating wrap-around; on
    /// failure, grows by allocating a new region sized by the configured
    /// overallocation behavior.
    pub fn push(&mut self, size: u64, timestamp: u64) -> PreinitAllocation {
        for (i, r) in self.regions.iter_mut().enumerate() {
            let aligned_tail = {
                let a = r.tail;
                (a + self.alignment - 1) / self.alignment * self.alignment
            };
            if aligned_tail + size <= r.capacity {
                r.tail = aligned_tail + size;
                r.live.push_back((r.tail, timestamp));
                return PreinitAllocation { region_index: i, offset: aligned_tail, size };
            }
        }

        let new_capacity = self.overallocation.apply(size, self.total_bytes).max(self.align_up(size));
        self.total_bytes += new_capacity;
        let mut region = Region::new(new_capacity);
        region.tail = size;
        region.live.push_back((size, timestamp));
        let index = self.regions.len();
        self.regions.push_back(region);
        PreinitAllocation { region_index: index, offset: 0, size }
    }

    /// Frees every live allocation (in every region) whose timestamp is
    /// <= `ts`, from the head — a simple FIFO since allocation identifiers
    /// preserve push order.
    pub fn pop(&mut self, ts: u64) {
        for r in self.regions.iter_mut() {
            while let Some(&(end, alloc_ts)) = r.live.front() {
                if alloc_ts <= ts {
                    r.live.pop_front();
                    r.head = end;
                } else {
                    break;
                }
            }
            if r.live.is_empty() {
                r.head = 0;
                r.tail = 0;
            }
        }
    }

    /// Reclaims regions that are entirely unused.
    pub fn trim(&mut self) {
        self.regions.retain(|r| !(r.live.is_empty() && r.capacity > 0 && r.tail == 0) || r.head != 0);
    }

    pub fn total_committed_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.capacity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceMemoryInfo;

    fn req(size: u64) -> AllocationRequirements {
        AllocationRequirements {
            memory_type_bits: 0xffff_ffff,
            size,
            alignment: 16,
            memory_info: ResourceMemoryInfo::DEVICE_LOCAL,
            compatibility_class: 0,
        }
    }

    fn transient(size: u64, first: usize, last: usize) -> Transient {
        Transient { requirements: req(size), lifetime: Lifetime { first_cmd: first, last_cmd: last }, assigned_slot: None }
    }

    #[test]
    fn no_overlap_chain_aliases_into_half_the_bytes() {
        // Copy A->B; Copy B->C; Copy C->D over four 1 MiB buffers.
        let mib = 1024 * 1024;
        let transients = vec![
            transient(mib, 0, 0), // A: read at cmd 0
            transient(mib, 0, 1), // B: written at 0, read at 1
            transient(mib, 1, 2), // C: written at 1, read at 2
            transient(mib, 2, 2), // D: written at 2
        ];
        let slots = pack(&transients);
        let (requested, committed) = requested_and_committed_bytes(&transients, &slots);
        assert_eq!(requested, 4 * mib);
        assert_eq!(committed, 2 * mib);
    }

    #[test]
    fn cyclic_dependency_chain_cannot_alias() {
        let mib = 1024 * 1024;
        // Copy A->B; Copy B->C; Copy C->A: every buffer's lifetime spans the
        // whole job because each is touched at both the start and the end.
        let transients = vec![
            transient(mib, 0, 2), // A: read at 0, written at 2
            transient(mib, 0, 1), // B: written at 0, read at 1
            transient(mib, 1, 2), // C: written at 1, read at 2
        ];
        let slots = pack(&transients);
        let (requested, committed) = requested_and_committed_bytes(&transients, &slots);
        assert_eq!(requested, 3 * mib);
        assert_eq!(committed, 3 * mib);
    }

    #[test]
    fn mixed_sizes_pack_optimally() {
        let mib = 1024 * 1024;
        // Sizes {1,4,2,2} MiB, chain of copies using each sequentially.
        let transients = vec![
            transient(1 * mib, 0, 0),
            transient(4 * mib, 0, 1),
            transient(2 * mib, 1, 2),
            transient(2 * mib, 2, 2),
        ];
        let slots = pack(&transients);
        let (requested, committed) = requested_and_committed_bytes(&transients, &slots);
        assert_eq!(requested, 9 * mib);
        assert_eq!(committed, 6 * mib);
    }

    #[test]
    fn preinit_ring_pop_is_fifo() {
        let mut ring = PreinitializedBuffers::new(16, OverallocationBehavior::default());
        let a = ring.push(1024, 10);
        let _b = ring.push(1024, 20);
        assert_eq!(a.region_index, 0);
        ring.pop(10);
        ring.pop(20);
    }
}
