// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box runtime support library.
//!
//! This is the unprivileged half of inter-box communication: the per-box RPC
//! and IPC state, and the API boxes use to make and serve calls and to pass
//! messages. It re-exports the `abi` crate that is shared with the monitor.
//!
//! Every box owns one [`BoxPools`], normally a `static`, and wraps it in a
//! [`BoxContext`] at startup. The monitor is handed the same contexts so that
//! it can move messages between them.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

pub mod ipc;
pub mod rpc;
pub mod sys;

use ipc::{BoxIpc, IpcPools};
use pool::{context, SlotError, SlotPool};
use rpc::{BoxRpc, RpcPools};

/// Locks `lock`. An interrupt handler can't wait out the thread it
/// preempted, so in handler mode this gives up at once if the lock is held.
pub(crate) fn lock_here<T>(
    lock: &spin::Mutex<T>,
) -> Option<spin::MutexGuard<'_, T>> {
    if context::in_interrupt() {
        lock.try_lock()
    } else {
        Some(lock.lock())
    }
}

/// Takes a free slot from `pool` without waiting for one, and without
/// spinning on the pool lock in handler mode.
pub(crate) fn allocate_here<T, const N: usize>(
    pool: &SlotPool<T, N>,
) -> Result<Slot, SlotError> {
    if context::in_interrupt() {
        pool.try_allocate()
    } else {
        pool.allocate(0)
    }
}

/// Gives `slot` back to `pool`, without spinning in handler mode.
pub(crate) fn free_here<T, const N: usize>(
    pool: &SlotPool<T, N>,
    slot: Slot,
) -> Result<(), SlotError> {
    if context::in_interrupt() {
        pool.try_free(slot)
    } else {
        pool.free(slot)
    }
}

/// All of one box's communication storage.
pub struct BoxPools {
    pub rpc: RpcPools,
    pub ipc: IpcPools,
}

impl BoxPools {
    pub const fn new() -> Self {
        Self {
            rpc: RpcPools::new(),
            ipc: IpcPools::new(),
        }
    }
}

impl Default for BoxPools {
    fn default() -> Self {
        Self::new()
    }
}

/// One box's identity, RPC and IPC state.
pub struct BoxContext<'p> {
    id: BoxId,
    pub rpc: BoxRpc<'p>,
    pub ipc: BoxIpc<'p>,
}

impl<'p> BoxContext<'p> {
    /// Sets up box `id` of `box_count` on top of `pools`.
    pub fn new(id: BoxId, box_count: usize, pools: &'p BoxPools) -> Self {
        Self {
            id,
            rpc: BoxRpc::new(&pools.rpc),
            ipc: BoxIpc::new(&pools.ipc, box_count),
        }
    }

    pub fn id(&self) -> BoxId {
        self.id
    }
}

/// BSS section sizes for a box using this library, given its own context
/// and heap sizes.
pub const fn bss_sizes(context: u32, heap: u32) -> BoxBssSizes {
    BoxBssSizes {
        index: core::mem::size_of::<BoxContext<'static>>() as u32,
        context,
        reentrancy: 0,
        rpc: core::mem::size_of::<RpcPools>() as u32,
        ipc: core::mem::size_of::<IpcPools>() as u32,
        heap,
    }
}
