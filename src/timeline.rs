//! Timeline Manager: issues strictly monotonic per-queue timestamps and
//! dispatches cleanup callbacks once the device reports them reached.
//!
//! Grounded on `graal`'s `SubmissionNumber`/serial-counter bookkeeping
//! (`context/mod.rs`'s `last_serial`/`completed_serials` handling), but
//! generalized to the explicit three-frontier model: *tracked*, *pending*,
//! *reached*, per queue.

use crate::timestamp::Timestamps;
use crate::MAX_QUEUES;
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::trace_span;

/// A callback fired once a registered timestamp is observed reached.
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

struct PendingCallback {
    /// Minimum global tracked timestamp that must be reached (None for
    /// queue-scoped callbacks).
    queue: Option<usize>,
    timestamp: u64,
    callback: CleanupCallback,
}

struct QueueCounters {
    /// Highest timestamp assigned so far on this queue (tracked).
    tracked: AtomicU64,
    /// Highest timestamp guaranteed to be submitted (pending).
    pending: AtomicU64,
    /// Highest timestamp observed reached on the device (reached).
    reached: AtomicU64,
    /// Native timeline semaphore for this queue.
    semaphore: vk::Semaphore,
}

/// Device-wide issuer of per-queue timestamps and dispatcher of cleanup
/// callbacks once those timestamps are observed signalled.
pub struct TimelineManager {
    global_counter: AtomicU64,
    queues: Vec<QueueCounters>,
    callbacks: Mutex<Vec<PendingCallback>>,
}

impl TimelineManager {
    pub fn new(semaphores: Vec<vk::Semaphore>) -> TimelineManager {
        assert!(!semaphores.is_empty() && semaphores.len() <= MAX_QUEUES);
        let queues = semaphores
            .into_iter()
            .map(|semaphore| QueueCounters {
                tracked: AtomicU64::new(0),
                pending: AtomicU64::new(0),
                reached: AtomicU64::new(0),
                semaphore,
            })
            .collect();
        TimelineManager {
            global_counter: AtomicU64::new(0),
            queues,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn semaphore(&self, queue: usize) -> vk::Semaphore {
        self.queues[queue].semaphore
    }

    /// Issues the next timestamp on `queue`. Must be called under the
    /// queue's own serialization discipline (at most one issuer per queue at
    /// a time) since the caller, not this manager, decides whether the
    /// result additionally becomes the queue's last-pending value.
    pub fn issue_next_timestamp(&self, queue: usize, guaranteed_submit: bool) -> u64 {
        let ts = self.global_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.queues[queue].tracked.store(ts, Ordering::Release);
        if guaranteed_submit {
            self.queues[queue].pending.store(ts, Ordering::Release);
        }
        ts
    }

    /// Marks `timestamp` as guaranteed to be signalled on `queue` (the
    /// submit actually happened). Never moves `pending` backwards.
    pub fn mark_pending(&self, queue: usize, timestamp: u64) {
        let q = &self.queues[queue];
        let mut cur = q.pending.load(Ordering::Acquire);
        while timestamp > cur {
            match q.pending.compare_exchange_weak(cur, timestamp, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn last_tracked(&self, queue: usize) -> u64 {
        self.queues[queue].tracked.load(Ordering::Acquire)
    }

    pub fn last_tracked_global(&self) -> Timestamps {
        let mut t = Timestamps::new();
        for (i, q) in self.queues.iter().enumerate() {
            t[i] = q.tracked.load(Ordering::Acquire);
        }
        t
    }

    pub fn last_pending(&self, queue: usize) -> u64 {
        self.queues[queue].pending.load(Ordering::Acquire)
    }

    pub fn last_reached(&self, queue: usize) -> u64 {
        self.queues[queue].reached.load(Ordering::Acquire)
    }

    pub fn last_reached_global_min(&self) -> u64 {
        self.queues.iter().map(|q| q.reached.load(Ordering::Acquire)).min().unwrap_or(0)
    }

    /// Registers `callback` to fire once `timestamp` is reached on `queue`.
    pub fn add_cleanup_callback_on_queue(&self, queue: usize, timestamp: u64, callback: CleanupCallback) {
        if timestamp <= self.last_reached(queue) {
            callback();
            return;
        }
        self.callbacks.lock().unwrap().push(PendingCallback {
            queue: Some(queue),
            timestamp,
            callback,
        });
    }

    /// Registers `callback` to fire once `timestamp` is reached on every
    /// queue (global reached-min).
    pub fn add_cleanup_callback(&self, timestamp: u64, callback: CleanupCallback) {
        if timestamp <= self.last_reached_global_min() {
            callback();
            return;
        }
        self.callbacks.lock().unwrap().push(PendingCallback {
            queue: None,
            timestamp,
            callback,
        });
    }

    /// Polls each queue's timeline semaphore, advances `reached` (monotonic
    /// max), and fires every callback whose registered timestamp has now
    /// been observed. Callbacks fire in timestamp order within each queue.
    pub fn update<F>(&self, mut get_counter_value: F)
    where
        F: FnMut(vk::Semaphore) -> u64,
    {
        let _span = trace_span!("timeline_update").entered();
        for q in &self.queues {
            let value = get_counter_value(q.semaphore);
            let mut cur = q.reached.load(Ordering::Acquire);
            while value > cur {
                match q.reached.compare_exchange_weak(cur, value, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        }

        let reached_min = self.last_reached_global_min();
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.sort_by_key(|c| c.timestamp);
        let mut i = 0;
        let mut ready = Vec::new();
        while i < callbacks.len() {
            let done = match callbacks[i].queue {
                Some(q) => callbacks[i].timestamp <= self.last_reached(q),
                None => callbacks[i].timestamp <= reached_min,
            };
            if done {
                ready.push(callbacks.swap_remove(i));
            } else {
                i += 1;
            }
        }
        drop(callbacks);
        for c in ready {
            (c.callback)();
        }
    }

    /// Blocks the host until every `(queue, timestamp)` pair is reached (or
    /// any one of them, if `wait_all` is false), up to `timeout`. Returns
    /// `false` on timeout without altering device state.
    pub fn wait_for_timestamps<F>(
        &self,
        pairs: &[(usize, u64)],
        wait_all: bool,
        timeout: Duration,
        mut native_wait: F,
    ) -> bool
    where
        F: FnMut(&[vk::Semaphore], &[u64], bool, Duration) -> bool,
    {
        let remaining: Vec<(usize, u64)> = pairs
            .iter()
            .copied()
            .filter(|&(q, ts)| ts > self.last_reached(q))
            .collect();
        if remaining.is_empty() {
            return true;
        }
        let semaphores: Vec<vk::Semaphore> = remaining.iter().map(|&(q, _)| self.semaphore(q)).collect();
        let values: Vec<u64> = remaining.iter().map(|&(_, ts)| ts).collect();
        native_wait(&semaphores, &values, wait_all, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> TimelineManager {
        TimelineManager::new((0..n).map(|_| vk::Semaphore::null()).collect())
    }

    #[test]
    fn timestamps_strictly_increase_per_queue() {
        let tm = manager(2);
        let a = tm.issue_next_timestamp(0, true);
        let b = tm.issue_next_timestamp(0, true);
        assert!(b > a);
    }

    #[test]
    fn global_counter_orders_across_queues() {
        let tm = manager(2);
        let a = tm.issue_next_timestamp(0, true);
        let b = tm.issue_next_timestamp(1, true);
        assert!(b > a);
    }

    #[test]
    fn update_fires_callbacks_once_reached() {
        let tm = manager(1);
        let ts = tm.issue_next_timestamp(0, true);
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        tm.add_cleanup_callback_on_queue(0, ts, Box::new(move || fired2.store(true, Ordering::SeqCst)));
        assert!(!fired.load(Ordering::SeqCst));
        tm.update(|_| ts);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn reached_global_min_is_bottleneck_queue() {
        let tm = manager(2);
        tm.update(|sem| if sem == tm.semaphore(0) { 5 } else { 2 });
        assert_eq!(tm.last_reached_global_min(), 2);
    }
}
