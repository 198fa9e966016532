//! Resource pool configuration — the crate's only configuration surface.
//! There is no external config-file format: every parameter is supplied as
//! a constructor argument, matching `graal`'s `ResourceMemoryInfo` and
//! friends, which also take all parameters in code rather than through a
//! `config`/`serde` layer.

use bitflags::bitflags;

bitflags! {
    /// Per-pool behavior switches.
    #[derive(Default)]
    pub struct PoolFlags: u32 {
        /// Disables aliasing between job-local buffers in this pool.
        const DISABLE_LOCAL_BUFFER_ALIASING = 0b0000_0001;
        /// Disables aliasing between job-local images in this pool.
        const DISABLE_LOCAL_IMAGE_ALIASING = 0b0000_0010;
    }
}

/// Growth policy for a growable allocation: `request_factor` scales the
/// immediately-requested size, `grow_factor` scales the running total when a
/// region must grow, and `min_allocation_bytes` floors every grant.
#[derive(Copy, Clone, Debug)]
pub struct OverallocationBehavior {
    pub request_factor: f32,
    pub grow_factor: f32,
    pub min_allocation_bytes: u64,
}

impl OverallocationBehavior {
    pub const fn new(request_factor: f32, grow_factor: f32, min_allocation_bytes: u64) -> OverallocationBehavior {
        OverallocationBehavior { request_factor, grow_factor, min_allocation_bytes }
    }

    pub const TIGHT: OverallocationBehavior = OverallocationBehavior::new(1.0, 1.0, 0);

    pub const GENEROUS: OverallocationBehavior = OverallocationBehavior::new(1.5, 2.0, 64 * 1024);

    /// Applies this policy when a region of size `requested` must be grown
    /// against a running `current_total`.
    pub fn apply(&self, requested: u64, current_total: u64) -> u64 {
        let scaled_request = (requested as f64 * self.request_factor as f64).ceil() as u64;
        let grown_total = (current_total as f64 * self.grow_factor as f64).ceil() as u64;
        scaled_request.max(grown_total.saturating_sub(current_total)).max(self.min_allocation_bytes).max(requested)
    }
}

impl Default for OverallocationBehavior {
    fn default() -> Self {
        OverallocationBehavior::GENEROUS
    }
}

/// Configuration for one resource pool: the queue it services, its
/// aliasing/behavior flags, and the overallocation policy for each of its
/// three growable allocators.
#[derive(Copy, Clone, Debug)]
pub struct ResourcePoolConfig {
    pub queue: usize,
    pub flags: PoolFlags,
    pub buffer_overallocation_behavior: OverallocationBehavior,
    pub preinit_buffer_overallocation_behavior: OverallocationBehavior,
    pub descriptor_overallocation_behavior: OverallocationBehavior,
}

impl ResourcePoolConfig {
    pub fn for_queue(queue: usize) -> ResourcePoolConfig {
        ResourcePoolConfig {
            queue,
            flags: PoolFlags::empty(),
            buffer_overallocation_behavior: OverallocationBehavior::default(),
            preinit_buffer_overallocation_behavior: OverallocationBehavior::default(),
            descriptor_overallocation_behavior: OverallocationBehavior::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overallocation_respects_minimum() {
        let b = OverallocationBehavior::new(1.0, 1.0, 4096);
        assert_eq!(b.apply(10, 0), 4096);
    }

    #[test]
    fn overallocation_scales_request() {
        let b = OverallocationBehavior::new(2.0, 1.0, 0);
        assert_eq!(b.apply(100, 0), 200);
    }
}
