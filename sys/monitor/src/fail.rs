// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording monitor failures such that they can be found by
//! tooling.
//!
//! On the target this defines the following binary interface to debuggers:
//!
//! - `monitor::fail::MONITOR_HAS_FAILED` is a `bool`, set to true if the
//!   monitor reaches `die`.
//!
//! - `monitor::fail::MONITOR_EPITAPH` is an array of `u8`. `die` writes as
//!   much of the failure reason into it (as UTF-8) as fits, padded with NULs.
//!
//! On the host, `die` panics with the same message.

use core::fmt::Display;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        use core::fmt::Write;
        use core::sync::atomic::{AtomicBool, Ordering};

        #[used]
        static MONITOR_HAS_FAILED: AtomicBool = AtomicBool::new(false);

        const EPITAPH_LEN: usize = 128;

        #[used]
        static mut MONITOR_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

        fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
            if MONITOR_HAS_FAILED.swap(true, Ordering::SeqCst) {
                // Failing while failing. Don't make it worse.
                loop {
                    core::sync::atomic::fence(Ordering::SeqCst);
                }
            }
            // Safety: only the one caller that set the flag gets here.
            unsafe { &mut *core::ptr::addr_of_mut!(MONITOR_EPITAPH) }
        }

        #[inline(never)]
        fn die_impl(msg: &dyn Display) -> ! {
            let buf = begin_epitaph();
            let mut writer = Eulogist { dest: buf };
            write!(writer, "{msg}").ok();

            loop {
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        struct Eulogist {
            dest: &'static mut [u8],
        }

        impl Write for Eulogist {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                let s = s.as_bytes();
                let n = s.len().min(self.dest.len());
                let (dest, leftovers) = {
                    let taken = core::mem::take(&mut self.dest);
                    taken.split_at_mut(n)
                };
                dest.copy_from_slice(&s[..n]);
                self.dest = leftovers;
                Ok(())
            }
        }
    } else {
        fn die_impl(msg: &dyn Display) -> ! {
            panic!("monitor died: {msg}");
        }
    }
}

/// Stops the monitor for good. Only for broken monitor invariants; box
/// misbehavior is a fault against the box, never a reason to die.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}
