// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The privileged half of inter-box communication.
//!
//! The monitor is handed the validated box table and every box's
//! [`BoxContext`], and from then on moves RPCs and IPC messages between boxes
//! each time the host kernel switches boxes ([`Monitor::drain`]). It also
//! services register gateways and the supervisor calls owned by this core.
//!
//! Box memory is untrusted. Anything the monitor reads from a box is checked
//! before being acted on, and anything wrong is a fault against the box that
//! got it wrong. Faulted boxes are never serviced again.
//!
//! # Locking
//!
//! Boxes may be running on other threads (or in interrupt handlers) while
//! the monitor drains, and on a single core the monitor may have preempted
//! the very thread that holds a box's lock. So the monitor never spins on a
//! lock a box can hold: pool locks, message and transfer records, function
//! group target lists and the received-descriptor table. It uses `try_*`
//! operations with a short bounded retry ([`busy_retry`], [`try_lock_box`]),
//! and work that still can't get its lock is left for the next drain.

#![cfg_attr(target_os = "none", no_std)]

pub mod config;
pub mod err;
pub mod fail;
mod ipc;
pub mod regs;
mod rpc;
mod svc;
pub mod umem;

use core::sync::atomic::{AtomicU32, Ordering};

use abi::{BoxConfig, BoxId, FaultInfo, Violation, MAX_BOXES};
use boxlib::BoxContext;
use pool::{context, SlotError};
use ringbuf::{ringbuf, ringbuf_entry};

pub use config::ConfigError;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Fault { id: BoxId, fault: FaultInfo },
    DrainBusy,
}

ringbuf!(Trace, 16, Trace::None);

/// Attempts at a busy pool lock before the monitor gives up for this drain.
const BUSY_RETRIES: usize = 8;

/// Runs `op` until it stops reporting a busy lock, up to `BUSY_RETRIES`
/// times.
pub(crate) fn busy_retry<R>(
    mut op: impl FnMut() -> Result<R, SlotError>,
) -> Result<R, SlotError> {
    for _ in 1..BUSY_RETRIES {
        match op() {
            Err(SlotError::WouldBlock) => context::relax(),
            r => return r,
        }
    }
    op()
}

/// Like [`busy_retry`], for operations that report a busy lock as `None`.
pub(crate) fn retry<R>(mut op: impl FnMut() -> Option<R>) -> Option<R> {
    for _ in 1..BUSY_RETRIES {
        if let Some(r) = op() {
            return Some(r);
        }
        context::relax();
    }
    op()
}

/// Locks `lock`, which a box may be holding, if it comes free within a few
/// attempts.
pub(crate) fn try_lock_box<T>(
    lock: &spin::Mutex<T>,
) -> Option<spin::MutexGuard<'_, T>> {
    retry(|| lock.try_lock())
}

/// Monitor activity counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// RPCs copied into a callee's incoming queue.
    pub rpc_delivered: u32,
    /// RPC results handed back to callers.
    pub rpc_returned: u32,
    /// RPC deliveries and returns put off because the callee had no room, or
    /// a box was holding a lock the monitor needed.
    pub rpc_deferred: u32,
    /// IPC messages copied from sender to receiver.
    pub ipc_delivered: u32,
    /// IPC deliveries put off because a box was holding a lock the monitor
    /// needed.
    pub ipc_deferred: u32,
    /// Faults recorded against boxes.
    pub faults: u32,
}

#[derive(Default)]
struct Counters {
    rpc_delivered: AtomicU32,
    rpc_returned: AtomicU32,
    rpc_deferred: AtomicU32,
    ipc_delivered: AtomicU32,
    ipc_deferred: AtomicU32,
    faults: AtomicU32,
}

impl Counters {
    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Monitor<'a, 'p> {
    configs: &'a [&'static BoxConfig],
    boxes: &'a [BoxContext<'p>],
    faults: [spin::Mutex<Option<FaultInfo>>; MAX_BOXES],
    counters: Counters,
    /// Held for the duration of a drain.
    draining: spin::Mutex<()>,
}

impl<'a, 'p> Monitor<'a, 'p> {
    /// Takes charge of the boxes described by `configs`, whose runtime state
    /// is `boxes`, in box id order.
    pub fn new(
        configs: &'a [&'static BoxConfig],
        boxes: &'a [BoxContext<'p>],
    ) -> Result<Self, ConfigError> {
        config::check_table(configs)?;
        if boxes.len() != configs.len() {
            return Err(ConfigError::ContextCount);
        }
        for (i, cx) in boxes.iter().enumerate() {
            if cx.id().index() != i {
                return Err(ConfigError::ContextOrder(i));
            }
        }
        Ok(Self {
            configs,
            boxes,
            faults: core::array::from_fn(|_| spin::Mutex::new(None)),
            counters: Counters::default(),
            draining: spin::Mutex::new(()),
        })
    }

    pub fn box_count(&self) -> usize {
        self.boxes.len()
    }

    /// The namespace of box `id`, if it exists and has one.
    pub fn box_namespace(&self, id: BoxId) -> Option<&'static str> {
        self.configs.get(id.index()).and_then(|c| c.namespace)
    }

    /// Records `fault` against box `id`. The box is not serviced again.
    pub fn force_fault(&self, id: BoxId, fault: FaultInfo) {
        self.force_fault_index(self.checked_index(id), fault);
    }

    pub(crate) fn force_fault_index(&self, index: usize, fault: FaultInfo) {
        let Some(slot) = self.faults.get(index) else {
            fail::die("fault against nonexistent box");
        };
        *slot.lock() = Some(fault);
        Counters::bump(&self.counters.faults);
        ringbuf_entry!(Trace::Fault {
            id: BoxId(index as u16),
            fault
        });
    }

    /// The fault recorded against box `id`, if any.
    pub fn fault_of(&self, id: BoxId) -> Option<FaultInfo> {
        self.faults.get(id.index()).and_then(|f| *f.lock())
    }

    pub fn is_faulted(&self, id: BoxId) -> bool {
        self.fault_of(id).is_some()
    }

    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            rpc_delivered: c.rpc_delivered.load(Ordering::Relaxed),
            rpc_returned: c.rpc_returned.load(Ordering::Relaxed),
            rpc_deferred: c.rpc_deferred.load(Ordering::Relaxed),
            ipc_delivered: c.ipc_delivered.load(Ordering::Relaxed),
            ipc_deferred: c.ipc_deferred.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
        }
    }

    /// Moves all the RPC and IPC traffic that can move. Called by the host
    /// kernel at every box switch.
    ///
    /// A drain that finds another drain already in progress returns at once.
    pub fn drain(&self) {
        let Some(_guard) = self.draining.try_lock() else {
            ringbuf_entry!(Trace::DrainBusy);
            return;
        };
        self.check_queues();
        self.deliver_calls();
        self.wake_groups();
        self.return_results();
        self.deliver_messages();
    }

    /// Live boxes, with their indices.
    fn live_boxes(
        &self,
    ) -> impl Iterator<Item = (usize, &BoxContext<'p>)> + '_ {
        self.boxes
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_live(*i))
    }

    fn is_live(&self, index: usize) -> bool {
        self.faults.get(index).is_some_and(|f| f.lock().is_none())
    }

    fn check_queues(&self) {
        for (i, cx) in self.live_boxes() {
            let valid = cx.rpc.outgoing.is_valid()
                && cx.rpc.todo.is_valid()
                && cx.rpc.done.is_valid()
                && cx.rpc.fn_groups.is_valid()
                && cx.ipc.send_queue.is_valid()
                && cx.ipc.recv_queue.is_valid();
            if !valid {
                self.force_fault_index(i, Violation::BadQueue.into());
            }
        }
    }

    /// Index of box `id`, which the host kernel promised was real.
    fn checked_index(&self, id: BoxId) -> usize {
        if !id.is_in_range(self.boxes.len()) {
            fail::die("host kernel named nonexistent box");
        }
        id.index()
    }

    fn config_index(&self, cfg: &BoxConfig) -> Option<usize> {
        self.configs.iter().position(|c| core::ptr::eq(*c, cfg))
    }
}
