// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity slot pools and the queues built on them.
//!
//! A [`SlotPool`] owns `N` records and hands out their indices ([`Slot`]s).
//! The pool tracks, for every slot, whether it's free, allocated but not in
//! any queue ("dequeued"), or linked into one of the [`PoolQueue`]s ordering
//! the pool. All of that bookkeeping lives behind one spinlock per pool.
//!
//! Record *contents* are not the pool's business. Records are handed out by
//! shared reference and are expected to bring their own interior mutability.
//!
//! # Lock ordering
//!
//! The pool lock is taken before any lock inside a record. Predicates given
//! to [`PoolQueue::find_first`] run with the pool lock held and may lock the
//! record they're handed, but code holding a record lock must never call back
//! into the pool.
//!
//! # Interrupts
//!
//! The `try_*` operations never spin on the lock and are the only ones that
//! may be used in handler mode. Blocking allocation additionally refuses to
//! wait in handler mode (see [`sem::Semaphore::pend`]).

#![cfg_attr(target_os = "none", no_std)]

pub mod context;
mod queue;
pub mod sem;

use core::sync::atomic::{AtomicU8, Ordering};

pub use abi::Slot;
pub use queue::{PoolQueue, POOL_QUEUE_MAGIC};

use context::Deadline;
use sem::{SemError, Semaphore};

/// Reasons a pool or queue operation didn't happen.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotError {
    /// Slot out of range, or the structure is corrupt.
    Invalid,
    /// The slot was already taken out of its queue.
    IsDequeued,
    /// The slot was already returned to the pool.
    IsFree,
    /// No free slots.
    Exhausted,
    /// No slot came free before the timeout.
    TimedOut,
    /// The lock was busy and the operation was not allowed to spin, or a
    /// blocking operation was attempted in handler mode.
    WouldBlock,
    /// The slot is still linked into a queue and can't be freed.
    StillQueued,
    /// The slot is linked into a different queue over the same pool.
    WrongQueue,
    /// The queue has nothing in it.
    Empty,
}

impl SlotError {
    /// The slot sentinel reporting this error.
    pub fn sentinel(self) -> Slot {
        match self {
            SlotError::IsDequeued => Slot::IS_DEQUEUED,
            SlotError::IsFree => Slot::IS_FREE,
            _ => Slot::INVALID,
        }
    }
}

/// Flattens a pool result into the exported slot encoding.
pub fn to_sentinel(r: Result<Slot, SlotError>) -> Slot {
    r.unwrap_or_else(SlotError::sentinel)
}

/// What a slot is doing, from the pool's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Entry {
    Free {
        next: Slot,
    },
    /// Allocated, and not in any queue.
    Dequeued,
    Queued {
        queue: u8,
        next: Slot,
        prev: Slot,
    },
}

pub(crate) struct PoolState<const N: usize> {
    pub(crate) entries: [Entry; N],
    first_free: Slot,
    allocated: u8,
}

impl<const N: usize> PoolState<N> {
    pub(crate) fn entry(&self, slot: Slot) -> Result<Entry, SlotError> {
        self.entries
            .get(slot.index())
            .copied()
            .ok_or(SlotError::Invalid)
    }

    fn pop_free(&mut self) -> Option<Slot> {
        let slot = self.first_free;
        match self.entries.get(slot.index()) {
            Some(&Entry::Free { next }) => {
                self.entries[slot.index()] = Entry::Dequeued;
                self.first_free = next;
                self.allocated += 1;
                Some(slot)
            }
            _ => None,
        }
    }

    fn push_free(&mut self, slot: Slot) -> Result<(), SlotError> {
        match self.entry(slot)? {
            Entry::Free { .. } => Err(SlotError::IsFree),
            Entry::Queued { .. } => Err(SlotError::StillQueued),
            Entry::Dequeued => {
                self.entries[slot.index()] = Entry::Free {
                    next: self.first_free,
                };
                self.first_free = slot;
                self.allocated -= 1;
                Ok(())
            }
        }
    }
}

/// A bounded pool of `N` records of type `T`.
pub struct SlotPool<T, const N: usize> {
    records: [T; N],
    state: spin::Mutex<PoolState<N>>,
    /// Copy of `state.allocated` that can be read without the lock.
    allocated: AtomicU8,
    semaphore: Semaphore,
    blocking: bool,
    next_queue_id: AtomicU8,
}

impl<T, const N: usize> SlotPool<T, N> {
    const CAPACITY_FITS: () = assert!(
        N <= Slot::MAX_VALID as usize,
        "slot pool capacity exceeds the valid slot range"
    );

    /// Builds a pool with every slot free. If `blocking` is set, allocations
    /// may wait for a slot to be freed.
    pub const fn new(records: [T; N], blocking: bool) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_FITS;

        let mut entries = [Entry::Dequeued; N];
        let mut i = 0;
        while i < N {
            let next = if i + 1 < N {
                Slot::new(i as u8 + 1)
            } else {
                Slot::INVALID
            };
            entries[i] = Entry::Free { next };
            i += 1;
        }
        Self {
            records,
            state: spin::Mutex::new(PoolState {
                entries,
                first_free: if N == 0 { Slot::INVALID } else { Slot::new(0) },
                allocated: 0,
            }),
            allocated: AtomicU8::new(0),
            semaphore: Semaphore::new(0, N as u32),
            blocking,
            next_queue_id: AtomicU8::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Size of one record in bytes.
    pub const fn stride(&self) -> usize {
        core::mem::size_of::<T>()
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Number of slots currently allocated. Diagnostic only: by the time you
    /// look at it, it may have changed.
    pub fn num_allocated(&self) -> usize {
        usize::from(self.allocated.load(Ordering::Relaxed))
    }

    /// The record behind `slot`, whatever state it's in.
    pub fn record(&self, slot: Slot) -> Option<&T> {
        self.records.get(slot.index())
    }

    /// Takes a free slot, spinning for the lock.
    ///
    /// If the pool is empty and blocking, waits up to `timeout_ms` for a slot
    /// to be freed (forever for `WAIT_FOREVER`). A non-blocking pool or a zero
    /// timeout gives up at once with `Exhausted`.
    pub fn allocate(&self, timeout_ms: u32) -> Result<Slot, SlotError> {
        let deadline = Deadline::after(timeout_ms);
        loop {
            if let Some(slot) = self.pop_free(self.state.lock()) {
                return Ok(slot);
            }
            if !self.blocking || timeout_ms == 0 {
                return Err(SlotError::Exhausted);
            }
            match self.semaphore.pend(deadline.remaining()) {
                Ok(()) => continue,
                Err(SemError::Timeout) => return Err(SlotError::TimedOut),
                Err(SemError::FromInterrupt) => {
                    return Err(SlotError::WouldBlock)
                }
            }
        }
    }

    /// Takes a free slot if the lock is available right now. Safe to call in
    /// handler mode.
    pub fn try_allocate(&self) -> Result<Slot, SlotError> {
        let st = self.state.try_lock().ok_or(SlotError::WouldBlock)?;
        self.pop_free(st).ok_or(SlotError::Exhausted)
    }

    /// Returns `slot` to the pool. The slot must be allocated and not queued.
    pub fn free(&self, slot: Slot) -> Result<(), SlotError> {
        self.push_free(self.state.lock(), slot)
    }

    /// Like [`SlotPool::free`], but fails with `WouldBlock` rather than
    /// spinning for the lock.
    pub fn try_free(&self, slot: Slot) -> Result<(), SlotError> {
        let st = self.state.try_lock().ok_or(SlotError::WouldBlock)?;
        self.push_free(st, slot)
    }

    fn pop_free(
        &self,
        mut st: spin::MutexGuard<'_, PoolState<N>>,
    ) -> Option<Slot> {
        let slot = st.pop_free()?;
        self.allocated.store(st.allocated, Ordering::Relaxed);
        Some(slot)
    }

    fn push_free(
        &self,
        mut st: spin::MutexGuard<'_, PoolState<N>>,
        slot: Slot,
    ) -> Result<(), SlotError> {
        st.push_free(slot)?;
        self.allocated.store(st.allocated, Ordering::Relaxed);
        drop(st);
        if self.blocking {
            self.semaphore.post();
        }
        Ok(())
    }

    /// Runs `body` with the pool state locked. If `spin` is false, gives up
    /// with `WouldBlock` instead of waiting for the lock.
    pub(crate) fn locked<R>(
        &self,
        spin: bool,
        body: impl FnOnce(&mut PoolState<N>) -> Result<R, SlotError>,
    ) -> Result<R, SlotError> {
        let mut st = if spin {
            self.state.lock()
        } else {
            self.state.try_lock().ok_or(SlotError::WouldBlock)?
        };
        body(&mut st)
    }

    pub(crate) fn records(&self) -> &[T; N] {
        &self.records
    }

    pub(crate) fn next_queue_id(&self) -> u8 {
        self.next_queue_id.fetch_add(1, Ordering::Relaxed)
    }
}
