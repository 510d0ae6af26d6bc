// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphore.
//!
//! `post` may be called from anywhere, including interrupt handlers. `pend`
//! may not, even with a zero timeout, and checks.
//!
//! `pend` busy-polls the count, calling [`context::relax`] between checks.
//! There is no scheduler to park a box thread on here. A host kernel that has
//! one plugs its blocking primitive in at `pend`, and until then every
//! blocking allocation and RPC wait spins.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::context::{self, Deadline};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemError {
    /// Nothing was posted before the timeout.
    Timeout,
    /// `pend` was called in handler mode.
    FromInterrupt,
}

#[derive(Debug)]
pub struct Semaphore {
    count: AtomicU32,
    max: u32,
}

impl Semaphore {
    pub const fn new(initial: u32, max: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
            max,
        }
    }

    /// Adds one to the count, unless it's already at its maximum. Returns
    /// `false` in that case.
    pub fn post(&self) -> bool {
        self.count
            .fetch_update(Ordering::Release, Ordering::Relaxed, |c| {
                (c < self.max).then_some(c + 1)
            })
            .is_ok()
    }

    /// Takes one from the count if it's nonzero.
    pub fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |c| {
                c.checked_sub(1)
            })
            .is_ok()
    }

    /// Waits for the count to be nonzero and takes one. A zero timeout polls
    /// once; `WAIT_FOREVER` never times out.
    pub fn pend(&self, timeout_ms: u32) -> Result<(), SemError> {
        if context::in_interrupt() {
            return Err(SemError::FromInterrupt);
        }
        let deadline = Deadline::after(timeout_ms);
        loop {
            if self.try_take() {
                return Ok(());
            }
            if deadline.expired() {
                return Err(SemError::Timeout);
            }
            context::relax();
        }
    }

    /// Drops any outstanding posts.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::with_interrupt_context;

    #[test]
    fn post_saturates() {
        let s = Semaphore::new(0, 2);
        assert!(s.post());
        assert!(s.post());
        assert!(!s.post());
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn zero_timeout_polls_once() {
        let s = Semaphore::new(0, 1);
        assert_eq!(s.pend(0), Err(SemError::Timeout));
        s.post();
        assert_eq!(s.pend(0), Ok(()));
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn pend_refuses_interrupt_context() {
        let s = Semaphore::new(1, 1);
        with_interrupt_context(|| {
            assert_eq!(s.pend(0), Err(SemError::FromInterrupt));
            // Posting is fine in an ISR.
            assert!(!s.post());
        });
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn pend_wakes_on_post_from_another_thread() {
        let s = Semaphore::new(0, 1);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(10));
                s.post();
            });
            assert_eq!(s.pend(abi::WAIT_FOREVER), Ok(()));
        });
    }

    #[test]
    fn pend_times_out() {
        let s = Semaphore::new(0, 1);
        assert_eq!(s.pend(5), Err(SemError::Timeout));
    }
}
