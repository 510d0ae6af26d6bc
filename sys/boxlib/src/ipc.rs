// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Point-to-point message passing between boxes.
//!
//! Sends and receives are queued with a descriptor naming the peer box and a
//! port, and are identified by a token: one bit of a 32-bit mask. The monitor
//! pairs each send with the first compatible receive of the destination box,
//! copies the bytes and marks both tokens completed. Boxes find out by
//! polling their completed mask with [`BoxIpc::waitforany`] or
//! [`BoxIpc::waitforall`].
//!
//! The token masks are atomics. Interrupt handlers allocate tokens and the
//! monitor completes them, and neither may wait on a lock the box's thread
//! could be holding.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::{
    BoxId, IpcDesc, IpcError, IpcIoState, Slot, Violation,
    IPC_INVALID_TOKEN, IPC_MAX_MESSAGE_LEN, IPC_PORT_INVALID, IPC_RECV_SLOTS,
    IPC_SEND_SLOTS,
};
use pool::context::{self, Deadline};
use pool::{PoolQueue, SlotPool};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::sys::sys_halt;
use crate::{allocate_here, free_here, lock_here};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Queued { token: u32, slot: Slot },
    OutOfStructures,
    OutOfTokens,
    Completed(u32),
    Leaked(Slot),
}

ringbuf!(Trace, 32, Trace::None);

/// Number of distinct IPC tokens: one per bit.
pub const IPC_TOKENS: usize = 32;

/// A message buffer in box memory, by address. The monitor validates it
/// before touching it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UBuf {
    pub base: usize,
    pub len: usize,
}

impl UBuf {
    pub fn of(buf: &[u8]) -> Self {
        Self {
            base: buf.as_ptr() as usize,
            len: buf.len(),
        }
    }

    /// Describes a buffer the monitor will write into.
    pub fn of_mut(buf: &mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr() as usize,
            len: buf.len(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct IoBody {
    pub desc: IpcDesc,
    pub buf: UBuf,
    pub state: IpcIoState,
}

/// One queued send or receive.
pub struct IpcIo {
    pub body: spin::Mutex<IoBody>,
}

impl IpcIo {
    pub const fn new() -> Self {
        Self {
            body: spin::Mutex::new(IoBody {
                desc: IpcDesc::new(BoxId::INVALID, IPC_PORT_INVALID, 0),
                buf: UBuf { base: 0, len: 0 },
                state: IpcIoState::Invalid,
            }),
        }
    }
}

impl Default for IpcIo {
    fn default() -> Self {
        Self::new()
    }
}

pub type SendPool = SlotPool<IpcIo, IPC_SEND_SLOTS>;
pub type RecvPool = SlotPool<IpcIo, IPC_RECV_SLOTS>;
pub type SendQueue<'p> = PoolQueue<'p, IpcIo, IPC_SEND_SLOTS>;
pub type RecvQueue<'p> = PoolQueue<'p, IpcIo, IPC_RECV_SLOTS>;

/// Backing storage for one box's IPC state.
pub struct IpcPools {
    pub send: SendPool,
    pub recv: RecvPool,
}

impl IpcPools {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const IO: IpcIo = IpcIo::new();
        Self {
            send: SlotPool::new([IO; IPC_SEND_SLOTS], false),
            recv: SlotPool::new([IO; IPC_RECV_SLOTS], false),
        }
    }
}

impl Default for IpcPools {
    fn default() -> Self {
        Self::new()
    }
}

/// One box's IPC queues, token masks and API.
pub struct BoxIpc<'p> {
    pub send_queue: SendQueue<'p>,
    pub recv_queue: RecvQueue<'p>,
    box_count: usize,
    /// Tokens handed out and not yet collected by a wait.
    allocated: AtomicU32,
    /// Tokens completed and not yet collected by a wait.
    completed: AtomicU32,
    /// Completed receives whose entry in `received` is filled in.
    delivered: AtomicU32,
    /// Delivered descriptors of receives, by token bit. An entry only means
    /// something while its bit is set in `delivered`.
    received: spin::Mutex<[Option<IpcDesc>; IPC_TOKENS]>,
}

impl<'p> BoxIpc<'p> {
    pub fn new(pools: &'p IpcPools, box_count: usize) -> Self {
        Self {
            send_queue: PoolQueue::new(&pools.send),
            recv_queue: PoolQueue::new(&pools.recv),
            box_count,
            allocated: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            received: spin::Mutex::new([None; IPC_TOKENS]),
        }
    }

    /// Queues `msg` for delivery to `desc.box_id` on `desc.port`. Returns the
    /// send's token.
    ///
    /// # Safety
    ///
    /// The monitor reads `msg` when it finds a matching receive, which can be
    /// any time until the token completes. `msg` must stay valid and unchanged
    /// until then.
    pub unsafe fn send(
        &self,
        desc: &IpcDesc,
        msg: &[u8],
    ) -> Result<u32, IpcError> {
        if desc.box_id == BoxId::ANY || !desc.box_id.is_in_range(self.box_count)
        {
            return Err(IpcError::InvalidBoxId);
        }
        check_port_and_len(desc, msg.len())?;
        self.queue(
            &self.send_queue,
            desc,
            UBuf::of(msg),
            IpcIoState::ReadyToSend,
        )
    }

    /// Queues a receive into `buf` from `desc.box_id` (or anyone, for
    /// `BoxId::ANY`) on `desc.port`. Messages up to `buf.len()` bytes match.
    /// Returns the receive's token.
    ///
    /// # Safety
    ///
    /// The monitor writes `buf` when it finds a matching send, which can be
    /// any time until the token completes. `buf` must stay valid, and must not
    /// be otherwise accessed, until then.
    pub unsafe fn recv(
        &self,
        desc: &IpcDesc,
        buf: &mut [u8],
    ) -> Result<u32, IpcError> {
        if desc.box_id != BoxId::ANY && !desc.box_id.is_in_range(self.box_count)
        {
            return Err(IpcError::InvalidBoxId);
        }
        check_port_and_len(desc, buf.len())?;
        self.queue(
            &self.recv_queue,
            desc,
            UBuf::of_mut(buf),
            IpcIoState::ReadyToRecv,
        )
    }

    /// Waits until any of `wait_tokens` completes, and returns those that did.
    /// A zero timeout checks once.
    pub fn waitforany(
        &self,
        wait_tokens: u32,
        timeout_ms: u32,
    ) -> Result<u32, IpcError> {
        self.wait(wait_tokens, timeout_ms, |done| done != 0)
    }

    /// Waits until all of `wait_tokens` complete.
    pub fn waitforall(
        &self,
        wait_tokens: u32,
        timeout_ms: u32,
    ) -> Result<u32, IpcError> {
        self.wait(wait_tokens, timeout_ms, |done| done == wait_tokens)
    }

    /// The delivered descriptor of a completed receive: the actual sender
    /// and length. `None` for sends, unknown tokens, and receives that
    /// haven't completed. In handler mode, also `None` if the box's thread is
    /// reading the table at the time.
    pub fn received(&self, token: u32) -> Option<IpcDesc> {
        let bit = token_bit(token)?;
        if self.delivered.load(Ordering::Acquire) & token == 0 {
            return None;
        }
        lock_here(&self.received)?[bit]
    }

    /// Writes down what arrived for the receive `desc.token`, ahead of
    /// completing it with [`BoxIpc::complete_received`]. Returns `false`
    /// without waiting if the table is in use. Called by the monitor.
    pub fn stage_received(&self, desc: &IpcDesc) -> bool {
        let Some(bit) = token_bit(desc.token) else {
            return false;
        };
        match self.received.try_lock() {
            Some(mut table) => {
                table[bit] = Some(*desc);
                true
            }
            None => false,
        }
    }

    /// Marks `token` completed. Called by the monitor.
    pub fn complete(&self, token: u32) {
        if token_bit(token).is_none() {
            return;
        }
        self.completed.fetch_or(token, Ordering::Release);
        ringbuf_entry!(Trace::Completed(token));
    }

    /// Marks the receive `token` completed, with the descriptor given to
    /// [`BoxIpc::stage_received`]. Called by the monitor.
    pub fn complete_received(&self, token: u32) {
        if token_bit(token).is_none() {
            return;
        }
        self.delivered.fetch_or(token, Ordering::Release);
        self.complete(token);
    }

    /// Tokens allocated and not yet collected by a wait.
    pub fn allocated_tokens(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Tokens completed and not yet collected by a wait.
    pub fn completed_tokens(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    fn queue<const N: usize>(
        &self,
        queue: &PoolQueue<'p, IpcIo, N>,
        desc: &IpcDesc,
        buf: UBuf,
        state: IpcIoState,
    ) -> Result<u32, IpcError> {
        let pool = queue.pool();
        let Ok(slot) = allocate_here(pool) else {
            ringbuf_entry!(Trace::OutOfStructures);
            return Err(IpcError::OutOfStructures);
        };
        let Some(io) = pool.record(slot) else {
            sys_halt(Violation::SlotMisuse);
        };
        let Some(mut body) = lock_here(&io.body) else {
            release_slot(pool, slot);
            return Err(IpcError::OutOfStructures);
        };

        let Some(token) = self.allocate_token() else {
            drop(body);
            release_slot(pool, slot);
            ringbuf_entry!(Trace::OutOfTokens);
            return Err(IpcError::OutOfTokens);
        };

        *body = IoBody {
            desc: IpcDesc { token, ..*desc },
            buf,
            state,
        };
        drop(body);
        let queued = if context::in_interrupt() {
            queue.try_enqueue(slot)
        } else {
            queue.enqueue(slot)
        };
        if queued.is_err() {
            if let Some(mut body) = lock_here(&io.body) {
                body.state = IpcIoState::Idle;
            }
            release_slot(pool, slot);
            self.release_token(token);
            return Err(IpcError::OutOfStructures);
        }
        ringbuf_entry!(Trace::Queued { token, slot });
        Ok(token)
    }

    fn allocate_token(&self) -> Option<u32> {
        let prev = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |a| {
                let free = !a;
                // Lowest clear bit.
                (free != 0).then(|| a | (free & free.wrapping_neg()))
            })
            .ok()?;
        let free = !prev;
        let token = free & free.wrapping_neg();
        self.completed.fetch_and(!token, Ordering::Release);
        self.delivered.fetch_and(!token, Ordering::Release);
        Some(token)
    }

    fn release_token(&self, token: u32) {
        self.completed.fetch_and(!token, Ordering::Release);
        self.delivered.fetch_and(!token, Ordering::Release);
        self.allocated.fetch_and(!token, Ordering::Release);
    }

    fn wait(
        &self,
        wait_tokens: u32,
        timeout_ms: u32,
        ready: impl Fn(u32) -> bool,
    ) -> Result<u32, IpcError> {
        if wait_tokens == IPC_INVALID_TOKEN
            || wait_tokens & !self.allocated_tokens() != 0
        {
            return Err(IpcError::InvalidTokens);
        }
        let deadline = Deadline::after(timeout_ms);
        loop {
            let collected = self.completed.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |c| {
                    let done = c & wait_tokens;
                    ready(done).then_some(c & !done)
                },
            );
            if let Ok(prev) = collected {
                let done = prev & wait_tokens;
                self.allocated.fetch_and(!done, Ordering::Release);
                return Ok(done);
            }
            if deadline.expired() {
                return Err(IpcError::Timeout);
            }
            context::relax();
        }
    }
}

/// Gives back the slot of a transfer that didn't make it into its queue.
fn release_slot<const N: usize>(pool: &SlotPool<IpcIo, N>, slot: Slot) {
    if free_here(pool, slot).is_err() {
        ringbuf_entry!(Trace::Leaked(slot));
    }
}

fn check_port_and_len(desc: &IpcDesc, buf_len: usize) -> Result<(), IpcError> {
    if desc.port == IPC_PORT_INVALID {
        return Err(IpcError::InvalidPort);
    }
    if desc.len == 0 || desc.len > IPC_MAX_MESSAGE_LEN || desc.len != buf_len {
        return Err(IpcError::InvalidLength);
    }
    Ok(())
}

/// Index of a single-bit token, or `None` if it isn't one.
fn token_bit(token: u32) -> Option<usize> {
    (token.count_ones() == 1).then_some(token.trailing_zeros() as usize)
}
