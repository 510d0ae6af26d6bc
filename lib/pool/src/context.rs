// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution context probe and millisecond clock.
//!
//! On the target, "interrupt context" means any exception is active, which we
//! read out of the SCB. The clock is whatever the host kernel's tick says it
//! is; if nothing calls [`tick`], finite timeouts never expire.
//!
//! On the host, the clock is real time and interrupt context is simulated per
//! thread with [`with_interrupt_context`].

use abi::WAIT_FOREVER;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use core::sync::atomic::{AtomicU32, Ordering};
        use cortex_m::peripheral::{scb::VectActive, SCB};

        static MILLIS: AtomicU32 = AtomicU32::new(0);

        /// Checks whether we're running in handler mode.
        pub fn in_interrupt() -> bool {
            SCB::vect_active() != VectActive::ThreadMode
        }

        /// Advances the clock. Call this from the host kernel's tick.
        pub fn tick(ms: u32) {
            MILLIS.fetch_add(ms, Ordering::Relaxed);
        }

        /// Current time in milliseconds. Wraps.
        pub fn now_ms() -> u32 {
            MILLIS.load(Ordering::Relaxed)
        }

        /// Backs off inside a spin loop.
        pub fn relax() {
            core::hint::spin_loop();
        }
    } else {
        use std::cell::Cell;
        use std::sync::OnceLock;
        use std::time::Instant;

        thread_local! {
            static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
        }

        static EPOCH: OnceLock<Instant> = OnceLock::new();

        pub fn in_interrupt() -> bool {
            IN_INTERRUPT.with(|c| c.get())
        }

        /// Runs `body` as though it were an interrupt handler on this thread.
        pub fn with_interrupt_context<R>(body: impl FnOnce() -> R) -> R {
            let was = IN_INTERRUPT.with(|c| c.replace(true));
            let r = body();
            IN_INTERRUPT.with(|c| c.set(was));
            r
        }

        /// Real time moves on by itself here; this is a no-op.
        pub fn tick(_ms: u32) {}

        pub fn now_ms() -> u32 {
            EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u32
        }

        pub fn relax() {
            std::thread::yield_now();
        }
    }
}

/// A point in time after which a wait gives up, or never, for `WAIT_FOREVER`.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    start: u32,
    timeout: u32,
}

impl Deadline {
    pub fn after(timeout_ms: u32) -> Self {
        Self {
            start: now_ms(),
            timeout: timeout_ms,
        }
    }

    pub fn is_forever(&self) -> bool {
        self.timeout == WAIT_FOREVER
    }

    pub fn expired(&self) -> bool {
        !self.is_forever() && self.elapsed() >= self.timeout
    }

    /// Time left, in the same units as the original timeout. A deadline that
    /// never expires always has `WAIT_FOREVER` left.
    pub fn remaining(&self) -> u32 {
        if self.is_forever() {
            WAIT_FOREVER
        } else {
            self.timeout.saturating_sub(self.elapsed())
        }
    }

    fn elapsed(&self) -> u32 {
        now_ms().wrapping_sub(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_context_nests() {
        assert!(!in_interrupt());
        with_interrupt_context(|| {
            assert!(in_interrupt());
            with_interrupt_context(|| assert!(in_interrupt()));
            assert!(in_interrupt());
        });
        assert!(!in_interrupt());
    }

    #[test]
    fn zero_deadline_is_already_expired() {
        let d = Deadline::after(0);
        assert!(d.expired());
        assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn forever_never_expires() {
        let d = Deadline::after(WAIT_FOREVER);
        assert!(!d.expired());
        assert_eq!(d.remaining(), WAIT_FOREVER);
    }
}
