//! Workload pacing.
//!
//! Three mutually exclusive disciplines govern when a client may issue a
//! request: a fixed request count, a fixed connection-creation rate, or a
//! fixed queries-per-second budget.

use core::{
    cell::{Cell, RefCell},
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Duration,
};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// How request submission is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// Submit until a fixed total request count is exhausted.
    Count { nreqs: u64 },
    /// Create a fixed number of new connections per period, up to the
    /// configured client count.
    Rate { rate: u64, period: Duration },
    /// Refill a per-worker token budget every [`QPS_UPDATE_PERIOD`],
    /// bounded by the main duration.
    Qps { qps: u64, duration: Duration },
}

pub const QPS_UPDATE_PERIOD: Duration = Duration::from_millis(5);
pub const QPS_UPDATES_PER_SECOND: usize = 200;

/// The two process-wide counters, shared by all workers.
///
/// `left` is the number of submissions still allowed; it decrements on each
/// submission in count mode and holds [`i64::MAX`] as a sentinel in
/// timing-based modes until the duration timer zeroes it. `sent` counts
/// every submission ever made.
#[derive(Debug)]
pub struct RequestCounter {
    left: AtomicI64,
    sent: AtomicU64,
}

impl RequestCounter {
    pub fn new(left: u64) -> Self {
        Self {
            left: AtomicI64::new(left.min(i64::MAX as u64) as i64),
            sent: AtomicU64::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            left: AtomicI64::new(i64::MAX),
            sent: AtomicU64::new(0),
        }
    }

    /// Claims one submission. Returns false once the budget is exhausted.
    #[inline]
    pub fn try_take(&self) -> bool {
        self.left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Zeroes the remaining budget; used by the duration timer to cancel
    /// the whole workload.
    #[inline]
    pub fn exhaust(&self) {
        self.left.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.left.load(Ordering::Acquire) <= 0
    }

    #[inline]
    pub fn on_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Per-worker QPS token gate.
///
/// Tokens are refilled every 5ms from a precomputed 200-slot array whose
/// sum equals the worker's per-second share. Clients that find the budget
/// empty park themselves on the LIFO stack and are granted tokens on the
/// next refill, most recently blocked first.
#[derive(Debug, Default)]
pub struct QpsGate {
    left: Cell<u64>,
    counts: Vec<u64>,
    index: Cell<usize>,
    blocked: RefCell<Vec<Arc<Semaphore>>>,
}

impl QpsGate {
    pub fn new(counts: Vec<u64>) -> Self {
        Self {
            left: Cell::new(0),
            counts,
            index: Cell::new(0),
            blocked: RefCell::new(Vec::new()),
        }
    }

    /// Claims one token. Returns false when the budget is empty.
    #[inline]
    pub fn try_take(&self) -> bool {
        let left = self.left.get();
        if left == 0 {
            return false;
        }
        self.left.set(left - 1);
        true
    }

    /// Parks a blocked client; it is woken with one permit per parked
    /// entry once tokens become available.
    pub fn park(&self, waiter: Arc<Semaphore>) {
        self.blocked.borrow_mut().push(waiter);
    }

    /// One 5ms tick: adds the next slot's tokens and drains the blocked
    /// stack, most recently parked first, while the budget lasts.
    pub fn tick(&self) {
        if self.counts.is_empty() {
            self.left.set(u64::MAX);
        } else {
            let idx = self.index.get();
            self.left.set(self.left.get() + self.counts[idx]);
            self.index.set((idx + 1) % self.counts.len());
        }

        let mut blocked = self.blocked.borrow_mut();
        let mut grants = self.left.get();
        while grants > 0 {
            let Some(waiter) = blocked.pop() else {
                break;
            };
            waiter.add_permits(1);
            grants -= 1;
        }
    }
}

/// Distributes `total` across `n` buckets, remainder to the first buckets.
pub fn split_even(total: u64, n: u64) -> Vec<u64> {
    let base = total / n;
    let rem = total % n;

    (0..n).map(|i| base + u64::from(i < rem)).collect()
}

/// Builds one worker's QPS slot array: `share` tokens per second thrown
/// into uniformly random 5ms slots.
pub fn qps_slots(share: u64) -> Vec<u64> {
    use rand::Rng;

    let mut slots = vec![0u64; QPS_UPDATES_PER_SECOND];
    let mut rng = rand::thread_rng();
    for _ in 0..share {
        slots[rng.gen_range(0..QPS_UPDATES_PER_SECOND)] += 1;
    }

    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_counts_down_to_zero() {
        let c = RequestCounter::new(3);
        assert!(c.try_take());
        assert!(c.try_take());
        assert!(c.try_take());
        assert!(!c.try_take());
        assert!(c.is_exhausted());
    }

    #[test]
    fn counter_sentinel_survives_heavy_use() {
        let c = RequestCounter::unbounded();
        for _ in 0..10_000 {
            assert!(c.try_take());
            c.on_sent();
        }
        assert!(!c.is_exhausted());
        assert_eq!(c.sent(), 10_000);

        c.exhaust();
        assert!(c.is_exhausted());
        assert!(!c.try_take());
    }

    #[test]
    fn split_remainder_goes_to_first_buckets() {
        assert_eq!(split_even(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_even(8, 4), vec![2, 2, 2, 2]);
        assert_eq!(split_even(2, 4), vec![1, 1, 0, 0]);
    }

    #[test]
    fn qps_slots_sum_to_share() {
        let slots = qps_slots(137);
        assert_eq!(slots.len(), QPS_UPDATES_PER_SECOND);
        assert_eq!(slots.iter().sum::<u64>(), 137);
    }

    #[test]
    fn gate_refills_from_slots_in_order() {
        let gate = QpsGate::new(vec![2, 0, 1]);
        assert!(!gate.try_take());

        gate.tick();
        assert!(gate.try_take());
        assert!(gate.try_take());
        assert!(!gate.try_take());

        gate.tick();
        assert!(!gate.try_take());

        gate.tick();
        assert!(gate.try_take());
    }

    #[test]
    fn gate_drains_blocked_lifo() {
        let gate = QpsGate::new(vec![1]);
        let first = Arc::new(Semaphore::new(0));
        let second = Arc::new(Semaphore::new(0));
        gate.park(first.clone());
        gate.park(second.clone());

        gate.tick();
        // One token: the most recently parked waiter gets it.
        assert_eq!(second.available_permits(), 1);
        assert_eq!(first.available_permits(), 0);

        gate.tick();
        assert_eq!(first.available_permits(), 1);
    }

    #[test]
    fn empty_slot_array_means_unbounded() {
        let gate = QpsGate::new(Vec::new());
        gate.tick();
        for _ in 0..1000 {
            assert!(gate.try_take());
        }
    }
}
