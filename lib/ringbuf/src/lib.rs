// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing the monitor and box libraries
//!
//! This contains an implementation for a static ring buffer designed to be used
//! to instrument arbitrary contexts, including interrupt handlers and code
//! running concurrently in several boxes. The ring buffers are meant to be
//! read with a debugger, or from tests on the host.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! Recording never blocks. If the buffer is already being written (by a
//! preempted thread, or by the code an interrupt landed in) the new entry is
//! thrown away and counted in `dropped` instead.
//!
//! ## Creating a ring buffer
//!
//! ```
//! ringbuf!(Trace, 16, Trace::None);
//!
//! ringbuf_entry!(Trace::Delivered(slot));
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between them
//! if you have more than one:
//!
//! ```
//! ringbuf!(IPC_RINGBUF, Trace, 16, Trace::None);
//!
//! ringbuf_entry!(IPC_RINGBUF, Trace::Matched(token));
//! ```
//!
//! ## Inspecting a ring buffer via GDB
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print monitor::rpc::__RINGBUF
//! ```

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, Ordering};

/// Re-export so that code generated by the macros can always find it.
pub use spin;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Ringbuf<$t, $n> = $crate::Ringbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::Ringbuf::entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// The part of a [`Ringbuf`] that sits behind its lock.
#[derive(Debug)]
pub struct Entries<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

///
/// A ring buffer of parametrized type and size.  In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    entries: spin::Mutex<Entries<T, N>>,
    dropped: AtomicU32,
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            entries: spin::Mutex::new(Entries {
                last: None,
                buffer: [RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: init,
                }; N],
            }),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn entry(&self, line: u16, payload: T) {
        let Some(mut entries) = self.entries.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        entries.record(line, payload);
    }

    /// Number of entries thrown away because the buffer was busy.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the most recently recorded entry, if any. Returns `None` if the
    /// buffer is busy, too.
    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        let entries = self.entries.try_lock()?;
        let last = entries.last?;
        entries.buffer.get(last).copied()
    }

    /// Runs `body` with every entry from oldest to newest, holding the lock.
    pub fn for_each(&self, mut body: impl FnMut(&RingbufEntry<T>)) {
        let entries = self.entries.lock();
        let Some(last) = entries.last else {
            return;
        };
        let (newer, older) = entries.buffer.split_at(last + 1);
        for ent in older.iter().chain(newer).filter(|e| e.count != 0) {
            body(ent);
        }
    }
}

impl<T: Copy + PartialEq, const N: usize> Entries<T, { N }> {
    fn record(&mut self, line: u16, payload: T) {
        // If this is the first time this ringbuf has been poked, last will be
        // None. In this specific case we want to make sure we don't add to the
        // count of an existing entry, and also that we deposit the first entry
        // in slot 0. From a code generation perspective, the cheapest thing to
        // do is to treat None as an out-of-range value:
        let last = self.last.unwrap_or(usize::MAX);

        // Check to see if we can reuse the most recent entry. This uses get_mut
        // both to avoid checking an entry on the first insertion (see above),
        // and also to handle the case where last is somehow corrupted to point
        // out-of-range.
        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the
                // count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Advance last and wrap if required. Not a remainder operation, since
        // v6-M and v7-M parts range from slow divide to no divide at all, and
        // this form also turns usize::MAX into 0 for the starting condition.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        Hit(u8),
    }

    #[test]
    fn repeats_are_counted() {
        let rb = Ringbuf::<Trace, 4>::new(Trace::None);
        rb.entry(10, Trace::Hit(1));
        rb.entry(10, Trace::Hit(1));
        rb.entry(10, Trace::Hit(1));
        let last = rb.last_entry().unwrap();
        assert_eq!(last.count, 3);
        assert_eq!(last.payload, Trace::Hit(1));

        // Same payload from a different line is a new entry.
        rb.entry(11, Trace::Hit(1));
        assert_eq!(rb.last_entry().unwrap().count, 1);
    }

    #[test]
    fn wraps_oldest_first() {
        let rb = Ringbuf::<Trace, 3>::new(Trace::None);
        for i in 0..5 {
            rb.entry(1, Trace::Hit(i));
        }
        let mut seen = vec![];
        rb.for_each(|e| seen.push(e.payload));
        assert_eq!(seen, [Trace::Hit(2), Trace::Hit(3), Trace::Hit(4)]);
    }

    #[test]
    fn busy_buffer_drops() {
        let rb = Ringbuf::<Trace, 3>::new(Trace::None);
        let held = rb.entries.lock();
        rb.entry(1, Trace::Hit(0));
        drop(held);
        assert_eq!(rb.dropped(), 1);
        assert_eq!(rb.last_entry(), None);
    }

    ringbuf!(TEST_RINGBUF, Trace, 8, Trace::None);

    #[test]
    fn macros() {
        ringbuf_entry!(TEST_RINGBUF, Trace::Hit(9));
        assert_eq!(TEST_RINGBUF.last_entry().unwrap().payload, Trace::Hit(9));
    }
}
