//! The bounded, growable MPSC queue backing `PushSource` (spec §4.6).
//!
//! Multiple producer threads race to `push`; exactly one consumer (the
//! owning region) calls `pop`. The hot path is `crossbeam_queue::ArrayQueue`
//! (lock-free SPSC/MPMC ring buffer); growing is the cold path, guarded by
//! a `parking_lot::RwLock` so concurrent producers only ever contend with
//! each other on the rare occasion the queue is full and has room left to
//! grow, never on the common case. `len` is the one counter every producer
//! touches on every successful push, so it gets its own cache line
//! (`crossbeam_utils::CachePadded`) to keep producer threads from false-
//! sharing it with `max_capacity` or the `RwLock`'s own state.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// Round `n` up to the smallest power of two strictly greater than `n`
/// (spec §4.6: "max_capacity ... rounded up to a power of two strictly
/// greater than initial_capacity").
pub fn next_pow2_strictly_greater(n: usize) -> usize {
    let mut p = 1usize;
    while p <= n {
        p = p.saturating_mul(2);
    }
    p
}

/// Round `n` up to the nearest power of two (`n` itself if already one).
fn round_up_to_pow2(n: usize) -> usize {
    if n.is_power_of_two() {
        n
    } else {
        next_pow2_strictly_greater(n)
    }
}

pub struct GrowableQueue<T> {
    inner: RwLock<ArrayQueue<T>>,
    max_capacity: usize,
    len: CachePadded<AtomicUsize>,
}

impl<T> GrowableQueue<T> {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        assert!(initial_capacity >= 2, "initial_capacity must be >= 2");
        assert!(max_capacity >= 4, "max_capacity must be >= 4");
        let max_capacity = next_pow2_strictly_greater(initial_capacity).max(round_up_to_pow2(max_capacity));
        GrowableQueue {
            inner: RwLock::new(ArrayQueue::new(initial_capacity)),
            max_capacity,
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Attempt to enqueue. On rejection the value is handed back — a full
    /// offer is rejected, never silently dropped (spec §9).
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let guard = self.inner.read();
            match guard.push(item) {
                Ok(()) => {
                    self.len.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
                Err(item) => {
                    drop(guard);
                    return self.grow_and_push(item);
                }
            }
        }
    }

    fn grow_and_push(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.write();
        // Someone may have grown (or drained) while we waited for the
        // write lock; retry the plain push first.
        if let Err(item) = guard.push(item) {
            let current_cap = guard.capacity();
            if current_cap >= self.max_capacity {
                return Err(item);
            }
            let new_cap = (current_cap * 2).min(self.max_capacity);
            let grown = ArrayQueue::new(new_cap);
            while let Some(existing) = guard.pop() {
                // Capacity only grows, so this can never fail.
                let _ = grown.push(existing);
            }
            let result = grown.push(item);
            *guard = grown;
            return result.map_err(|_| unreachable!("freshly grown queue rejected its own push"));
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let item = self.inner.read().pop();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Approximate, non-synchronized (spec §4.6 "queue_size ... approximate").
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate: true unless the queue is observed full at max capacity.
    pub fn accepts_next(&self) -> bool {
        let guard = self.inner.read();
        guard.len() < guard.capacity() || guard.capacity() < self.max_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_rounding() {
        assert_eq!(next_pow2_strictly_greater(2), 4);
        assert_eq!(next_pow2_strictly_greater(3), 4);
        assert_eq!(next_pow2_strictly_greater(4), 8);
    }

    #[test]
    fn non_pow2_max_capacity_is_rounded_up() {
        // max_capacity=10 is not itself a power of two; it must round up
        // to 16, not be taken as-is.
        let q: GrowableQueue<i32> = GrowableQueue::new(2, 10);
        assert_eq!(q.max_capacity, 16);
        for i in 0..16 {
            assert!(q.push(i).is_ok());
        }
        assert_eq!(q.push(16), Err(16));
    }

    #[test]
    fn grows_then_rejects_at_max() {
        let q: GrowableQueue<i32> = GrowableQueue::new(2, 4);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        // Initial capacity exhausted; should grow to max (4) and accept.
        assert!(q.push(3).is_ok());
        assert!(q.push(4).is_ok());
        // Now genuinely full at max_capacity.
        assert_eq!(q.push(5), Err(5));
    }

    #[test]
    fn fifo_order_preserved_across_growth() {
        let q: GrowableQueue<i32> = GrowableQueue::new(2, 8);
        for i in 0..6 {
            assert!(q.push(i).is_ok());
        }
        for i in 0..6 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }
}
