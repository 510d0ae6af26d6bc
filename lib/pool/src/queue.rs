// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FIFO queues over a slot pool.
//!
//! A queue doesn't own any slots; it orders some of its pool's allocated
//! slots. The links live in the pool's per-slot entries, so every queue
//! operation happens under the pool lock. Head and tail are atomics only so
//! that the queue can be shared; they are written exclusively with that lock
//! held.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::{Entry, PoolState, Slot, SlotError, SlotPool};

/// Value of a live queue's magic.
pub const POOL_QUEUE_MAGIC: u32 = 0x7157_B2D1;

pub struct PoolQueue<'p, T, const N: usize> {
    magic: AtomicU32,
    /// Tag distinguishing this queue's slots from other queues' in the pool.
    id: u8,
    head: AtomicU8,
    tail: AtomicU8,
    pool: &'p SlotPool<T, N>,
}

impl<'p, T, const N: usize> PoolQueue<'p, T, N> {
    /// Creates an empty queue over `pool`.
    pub fn new(pool: &'p SlotPool<T, N>) -> Self {
        Self {
            magic: AtomicU32::new(POOL_QUEUE_MAGIC),
            id: pool.next_queue_id(),
            head: AtomicU8::new(Slot::INVALID.0),
            tail: AtomicU8::new(Slot::INVALID.0),
            pool,
        }
    }

    pub fn pool(&self) -> &'p SlotPool<T, N> {
        self.pool
    }

    /// Checks the queue's magic.
    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == POOL_QUEUE_MAGIC
    }

    /// Marks the queue as corrupt. Every later operation on it fails.
    pub fn poison(&self) {
        self.magic.store(!POOL_QUEUE_MAGIC, Ordering::Relaxed);
    }

    /// Appends `slot`, which must be allocated and not in any queue.
    pub fn enqueue(&self, slot: Slot) -> Result<(), SlotError> {
        self.locked(true, |st| self.link_tail(st, slot))
    }

    pub fn try_enqueue(&self, slot: Slot) -> Result<(), SlotError> {
        self.locked(false, |st| self.link_tail(st, slot))
    }

    /// Removes `slot` from wherever it is in the queue.
    pub fn dequeue(&self, slot: Slot) -> Result<Slot, SlotError> {
        self.locked(true, |st| self.unlink(st, slot))
    }

    pub fn try_dequeue(&self, slot: Slot) -> Result<Slot, SlotError> {
        self.locked(false, |st| self.unlink(st, slot))
    }

    /// Removes and returns the head of the queue.
    pub fn dequeue_first(&self) -> Result<Slot, SlotError> {
        self.locked(true, |st| self.unlink(st, self.head()))
    }

    pub fn try_dequeue_first(&self) -> Result<Slot, SlotError> {
        self.locked(false, |st| self.unlink(st, self.head()))
    }

    /// Returns the first slot, in queue order, for which `pred` holds.
    ///
    /// `pred` runs with the pool locked. It may lock the record it's given
    /// but must not touch the pool.
    pub fn find_first(
        &self,
        pred: impl FnMut(Slot, &T) -> bool,
    ) -> Result<Slot, SlotError> {
        self.locked(true, |st| self.scan(st, pred))
    }

    pub fn try_find_first(
        &self,
        pred: impl FnMut(Slot, &T) -> bool,
    ) -> Result<Slot, SlotError> {
        self.locked(false, |st| self.scan(st, pred))
    }

    /// The queued slots, head first. Empty if the queue is poisoned.
    pub fn slots(&self) -> heapless::Vec<Slot, N> {
        self.collect(true).unwrap_or_default()
    }

    pub fn try_slots(&self) -> Result<heapless::Vec<Slot, N>, SlotError> {
        self.collect(false)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.head().is_valid()
    }

    fn head(&self) -> Slot {
        Slot(self.head.load(Ordering::Relaxed))
    }

    fn tail(&self) -> Slot {
        Slot(self.tail.load(Ordering::Relaxed))
    }

    fn locked<R>(
        &self,
        spin: bool,
        body: impl FnOnce(&mut PoolState<N>) -> Result<R, SlotError>,
    ) -> Result<R, SlotError> {
        if !self.is_valid() {
            return Err(SlotError::Invalid);
        }
        self.pool.locked(spin, body)
    }

    fn collect(
        &self,
        spin: bool,
    ) -> Result<heapless::Vec<Slot, N>, SlotError> {
        self.locked(spin, |st| {
            let mut out = heapless::Vec::new();
            self.walk(st, |s| {
                // Can't overflow: there are at most N slots to walk.
                let _ = out.push(s);
                false
            });
            Ok(out)
        })
    }

    fn link_tail(
        &self,
        st: &mut PoolState<N>,
        slot: Slot,
    ) -> Result<(), SlotError> {
        match st.entry(slot)? {
            Entry::Free { .. } => return Err(SlotError::IsFree),
            Entry::Queued { .. } => return Err(SlotError::Invalid),
            Entry::Dequeued => (),
        }
        let tail = self.tail();
        st.entries[slot.index()] = Entry::Queued {
            queue: self.id,
            next: Slot::INVALID,
            prev: tail,
        };
        if tail.is_valid() {
            set_next(st, tail, slot);
        } else {
            self.head.store(slot.0, Ordering::Relaxed);
        }
        self.tail.store(slot.0, Ordering::Relaxed);
        Ok(())
    }

    fn unlink(
        &self,
        st: &mut PoolState<N>,
        slot: Slot,
    ) -> Result<Slot, SlotError> {
        if slot == Slot::INVALID && !self.head().is_valid() {
            return Err(SlotError::Empty);
        }
        let (next, prev) = match st.entry(slot)? {
            Entry::Free { .. } => return Err(SlotError::IsFree),
            Entry::Dequeued => return Err(SlotError::IsDequeued),
            Entry::Queued { queue, .. } if queue != self.id => {
                return Err(SlotError::WrongQueue)
            }
            Entry::Queued { next, prev, .. } => (next, prev),
        };
        if prev.is_valid() {
            set_next(st, prev, next);
        } else {
            self.head.store(next.0, Ordering::Relaxed);
        }
        if next.is_valid() {
            set_prev(st, next, prev);
        } else {
            self.tail.store(prev.0, Ordering::Relaxed);
        }
        st.entries[slot.index()] = Entry::Dequeued;
        Ok(slot)
    }

    fn scan(
        &self,
        st: &mut PoolState<N>,
        mut pred: impl FnMut(Slot, &T) -> bool,
    ) -> Result<Slot, SlotError> {
        let records = self.pool.records();
        self.walk(st, |s| pred(s, &records[s.index()]))
            .ok_or(SlotError::Invalid)
    }

    /// Visits queued slots head first until `visit` returns true, and returns
    /// that slot. Gives up after `N` steps, so corrupt links can't hang us.
    fn walk(
        &self,
        st: &PoolState<N>,
        mut visit: impl FnMut(Slot) -> bool,
    ) -> Option<Slot> {
        let mut cur = self.head();
        for _ in 0..N {
            let Some(&Entry::Queued { queue, next, .. }) =
                st.entries.get(cur.index())
            else {
                return None;
            };
            if queue != self.id {
                return None;
            }
            if visit(cur) {
                return Some(cur);
            }
            cur = next;
        }
        None
    }
}

fn set_next<const N: usize>(st: &mut PoolState<N>, slot: Slot, to: Slot) {
    if let Some(Entry::Queued { next, .. }) = st.entries.get_mut(slot.index()) {
        *next = to;
    }
}

fn set_prev<const N: usize>(st: &mut PoolState<N>, slot: Slot, to: Slot) {
    if let Some(Entry::Queued { prev, .. }) = st.entries.get_mut(slot.index()) {
        *prev = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill<const N: usize>(
        q: &PoolQueue<'_, u32, N>,
        count: usize,
    ) -> Vec<Slot> {
        (0..count)
            .map(|_| {
                let s = q.pool().allocate(0).unwrap();
                q.enqueue(s).unwrap();
                s
            })
            .collect()
    }

    #[test]
    fn fifo_order() {
        let pool = SlotPool::new([0u32; 8], false);
        let q = PoolQueue::new(&pool);
        let order = fill(&q, 6);
        let out: Vec<Slot> =
            (0..6).map(|_| q.dequeue_first().unwrap()).collect();
        assert_eq!(out, order);
        assert_eq!(q.dequeue_first(), Err(SlotError::Empty));
        assert!(q.is_empty());
    }

    #[test]
    fn middle_dequeue_keeps_order() {
        let pool = SlotPool::new([0u32; 8], false);
        let q = PoolQueue::new(&pool);
        let s = fill(&q, 5);
        assert_eq!(q.dequeue(s[2]), Ok(s[2]));
        assert_eq!(&q.slots()[..], &[s[0], s[1], s[3], s[4]]);

        // Ends too.
        q.dequeue(s[4]).unwrap();
        q.dequeue(s[0]).unwrap();
        assert_eq!(&q.slots()[..], &[s[1], s[3]]);
        assert_eq!(q.len(), 2);

        // Appending after removing the tail links up properly.
        q.enqueue(s[4]).unwrap();
        assert_eq!(&q.slots()[..], &[s[1], s[3], s[4]]);
    }

    #[test]
    fn transition_sentinels() {
        let pool = SlotPool::new([0u32; 4], false);
        let q = PoolQueue::new(&pool);
        let s = pool.allocate(0).unwrap();

        assert_eq!(q.dequeue(s), Err(SlotError::IsDequeued));
        assert_eq!(SlotError::IsDequeued.sentinel(), Slot::IS_DEQUEUED);

        q.enqueue(s).unwrap();
        assert_eq!(q.enqueue(s), Err(SlotError::Invalid));
        assert_eq!(pool.free(s), Err(SlotError::StillQueued));

        q.dequeue(s).unwrap();
        assert_eq!(q.dequeue(s), Err(SlotError::IsDequeued));
        pool.free(s).unwrap();
        assert_eq!(q.enqueue(s), Err(SlotError::IsFree));
        assert_eq!(q.dequeue(s), Err(SlotError::IsFree));
        assert_eq!(q.dequeue(Slot(9)), Err(SlotError::Invalid));
    }

    #[test]
    fn queues_sharing_a_pool_keep_to_themselves() {
        let pool = SlotPool::new([0u32; 4], false);
        let todo = PoolQueue::new(&pool);
        let done = PoolQueue::new(&pool);
        let a = pool.allocate(0).unwrap();
        let b = pool.allocate(0).unwrap();
        todo.enqueue(a).unwrap();
        done.enqueue(b).unwrap();

        assert_eq!(done.dequeue(a), Err(SlotError::WrongQueue));
        assert_eq!(&todo.slots()[..], &[a]);
        assert_eq!(&done.slots()[..], &[b]);
    }

    #[test]
    fn find_first_in_queue_order() {
        let pool = SlotPool::new([10u32, 20, 30, 40], false);
        let q = PoolQueue::new(&pool);
        for want in 0..3 {
            assert_eq!(pool.allocate(0), Ok(Slot(want)));
        }
        // Enqueue in an order different from slot order.
        for s in [Slot(2), Slot(0), Slot(1)] {
            q.enqueue(s).unwrap();
        }
        assert_eq!(q.find_first(|_, &v| v >= 10), Ok(Slot(2)));
        assert_eq!(q.find_first(|_, &v| v < 30), Ok(Slot(0)));
        assert_eq!(q.find_first(|s, _| s == Slot(1)), Ok(Slot(1)));
        assert_eq!(q.find_first(|_, &v| v == 40), Err(SlotError::Invalid));
    }

    #[test]
    fn poisoned_queue_refuses_everything() {
        let pool = SlotPool::new([0u32; 2], false);
        let q = PoolQueue::new(&pool);
        let s = pool.allocate(0).unwrap();
        q.poison();
        assert!(!q.is_valid());
        assert_eq!(q.enqueue(s), Err(SlotError::Invalid));
        assert_eq!(q.dequeue_first(), Err(SlotError::Invalid));
        assert!(q.slots().is_empty());
    }

    #[test]
    fn try_variants_fail_on_busy_pool() {
        let pool = SlotPool::new([0u32; 2], false);
        let q = PoolQueue::new(&pool);
        let s = pool.allocate(0).unwrap();
        pool.locked(true, |_| {
            assert_eq!(q.try_enqueue(s), Err(SlotError::WouldBlock));
            assert_eq!(q.try_dequeue_first(), Err(SlotError::WouldBlock));
            assert_eq!(q.try_find_first(|_, _| true), Err(SlotError::WouldBlock));
            assert_eq!(q.try_slots(), Err(SlotError::WouldBlock));
            Ok(())
        })
        .unwrap();
    }
}
