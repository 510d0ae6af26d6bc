// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote procedure calls between boxes.
//!
//! Each box owns three pools: outgoing messages (calls it has made), incoming
//! messages (calls made to it) and function groups (sets of targets it is
//! waiting to serve). The incoming pool is ordered by two queues: `todo`, for
//! calls the monitor has delivered but nobody has run yet, and `done`, for
//! calls that have been run and whose results the monitor hasn't taken back
//! to the caller.
//!
//! A call goes:
//!
//! 1. Caller fills an outgoing message (`ReadyToSend`) and queues it.
//! 2. Monitor copies it into the callee's incoming pool and `todo` queue,
//!    marking both copies `Sent`, and posts any matching function group.
//! 3. Callee, in `fncall_waitfor`, runs the target, marks its copy `Done` and
//!    moves it to `done`.
//! 4. Monitor checks the match cookie, copies the result back, marks the
//!    caller's message `Done` and posts its semaphore.
//! 5. Caller, in `fncall_wait`, takes the result and frees the message.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use abi::{
    BoxId, GatewayKind, ResultCounter, ResultToken, RpcError, RpcGateway,
    RpcMessageState, RpcTarget, Slot, Violation, RPC_FN_GROUP_MAX_TARGETS,
    RPC_FN_GROUP_SLOTS, RPC_INCOMING_MESSAGE_SLOTS, RPC_OUTGOING_MESSAGE_SLOTS,
    WAIT_FOREVER,
};
use pool::context::{self, Deadline};
use pool::sem::{SemError, Semaphore};
use pool::{PoolQueue, SlotError, SlotPool};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::sys::sys_halt;
use crate::{allocate_here, free_here, lock_here};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Sent(ResultToken),
    OutOfStructures,
    WaitTimeout(ResultToken),
    Returned(ResultToken),
    Served { caller: BoxId, slot: Slot },
    GroupTimeout,
    Leaked(Slot),
}

ringbuf!(Trace, 32, Trace::None);

/// Everything in a message apart from its cookies.
#[derive(Copy, Clone, Debug)]
pub struct MessageBody {
    pub args: [u32; 4],
    /// Gateway the call was made through. Only the monitor trusts this, and
    /// only after validating it.
    pub gateway: Option<&'static RpcGateway>,
    /// How the caller asked for the gateway to be called.
    pub kind: GatewayKind,
    /// In an outgoing message, unused. In an incoming message, the caller.
    pub other_box: BoxId,
    pub result: u32,
    pub state: RpcMessageState,
}

impl MessageBody {
    const fn empty() -> Self {
        Self {
            args: [0; 4],
            gateway: None,
            kind: GatewayKind::Sync,
            other_box: BoxId::INVALID,
            result: 0,
            state: RpcMessageState::Invalid,
        }
    }
}

/// One RPC message record.
pub struct RpcMessage {
    pub body: spin::Mutex<MessageBody>,
    /// The token a caller may currently wait on, or `INVALID` while a wait is
    /// in progress or after the call has finished.
    wait_cookie: AtomicU32,
    /// The token naming the call this message carries.
    match_cookie: AtomicU32,
    /// Posted by the monitor when the result is in.
    pub semaphore: Semaphore,
}

impl RpcMessage {
    pub const fn new() -> Self {
        Self {
            body: spin::Mutex::new(MessageBody::empty()),
            wait_cookie: AtomicU32::new(ResultToken::INVALID.0),
            match_cookie: AtomicU32::new(ResultToken::INVALID.0),
            semaphore: Semaphore::new(0, 1),
        }
    }

    pub fn match_cookie(&self) -> ResultToken {
        ResultToken(self.match_cookie.load(Ordering::Acquire))
    }

    pub fn wait_cookie(&self) -> ResultToken {
        ResultToken(self.wait_cookie.load(Ordering::Acquire))
    }

    /// Binds the message to the call named by `token`.
    pub fn arm(&self, token: ResultToken) {
        self.match_cookie.store(token.0, Ordering::Release);
        self.wait_cookie.store(token.0, Ordering::Release);
    }

    /// Unbinds the message from any call.
    pub fn disarm(&self) {
        self.wait_cookie.store(ResultToken::INVALID.0, Ordering::Release);
        self.match_cookie.store(ResultToken::INVALID.0, Ordering::Release);
    }

    /// Consumes the wait cookie. Fails if it isn't `token`.
    fn begin_wait(&self, token: ResultToken) -> bool {
        self.wait_cookie
            .compare_exchange(
                token.0,
                ResultToken::INVALID.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Puts the wait cookie back after a wait gave up.
    fn abandon_wait(&self, token: ResultToken) {
        self.wait_cookie.store(token.0, Ordering::Release);
    }
}

impl Default for RpcMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of targets a callee is waiting to serve.
pub struct FnGroup {
    pub targets: spin::Mutex<heapless::Vec<RpcTarget, RPC_FN_GROUP_MAX_TARGETS>>,
    /// Posted by the monitor when a call to one of the targets arrives.
    pub semaphore: Semaphore,
}

impl FnGroup {
    pub const fn new() -> Self {
        Self {
            targets: spin::Mutex::new(heapless::Vec::new()),
            semaphore: Semaphore::new(0, 1),
        }
    }

    /// Checks whether `gw` leads to one of the group's targets. `None` if the
    /// owning box is busy changing the targets.
    pub fn try_contains(&self, gw: &RpcGateway) -> Option<bool> {
        let targets = self.targets.try_lock()?;
        Some(targets.iter().any(|&t| gw.leads_to(t)))
    }
}

impl Default for FnGroup {
    fn default() -> Self {
        Self::new()
    }
}

pub type OutgoingPool = SlotPool<RpcMessage, RPC_OUTGOING_MESSAGE_SLOTS>;
pub type IncomingPool = SlotPool<RpcMessage, RPC_INCOMING_MESSAGE_SLOTS>;
pub type FnGroupPool = SlotPool<FnGroup, RPC_FN_GROUP_SLOTS>;
pub type OutgoingQueue<'p> =
    PoolQueue<'p, RpcMessage, RPC_OUTGOING_MESSAGE_SLOTS>;
pub type IncomingQueue<'p> =
    PoolQueue<'p, RpcMessage, RPC_INCOMING_MESSAGE_SLOTS>;
pub type FnGroupQueue<'p> = PoolQueue<'p, FnGroup, RPC_FN_GROUP_SLOTS>;

/// Backing storage for one box's RPC state.
pub struct RpcPools {
    pub outgoing: OutgoingPool,
    pub incoming: IncomingPool,
    pub fn_groups: FnGroupPool,
}

impl RpcPools {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const MESSAGE: RpcMessage = RpcMessage::new();
        const GROUP: FnGroup = FnGroup::new();
        Self {
            outgoing: SlotPool::new([MESSAGE; RPC_OUTGOING_MESSAGE_SLOTS], false),
            incoming: SlotPool::new([MESSAGE; RPC_INCOMING_MESSAGE_SLOTS], false),
            fn_groups: SlotPool::new([GROUP; RPC_FN_GROUP_SLOTS], false),
        }
    }
}

impl Default for RpcPools {
    fn default() -> Self {
        Self::new()
    }
}

/// What came of [`BoxRpc::call`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CallOutcome {
    /// A synchronous gateway returned this.
    Returned(u32),
    /// An asynchronous gateway accepted the call; wait on this for the result.
    Pending(ResultToken),
}

/// One box's RPC queues and API.
pub struct BoxRpc<'p> {
    pub outgoing: OutgoingQueue<'p>,
    pub todo: IncomingQueue<'p>,
    pub done: IncomingQueue<'p>,
    pub fn_groups: FnGroupQueue<'p>,
    /// Last `ResultCounter` handed out, as bits.
    counter: AtomicU32,
    last_caller: AtomicU16,
}

impl<'p> BoxRpc<'p> {
    pub fn new(pools: &'p RpcPools) -> Self {
        Self {
            outgoing: PoolQueue::new(&pools.outgoing),
            todo: PoolQueue::new(&pools.incoming),
            done: PoolQueue::new(&pools.incoming),
            fn_groups: PoolQueue::new(&pools.fn_groups),
            counter: AtomicU32::new(ResultCounter::ZERO.get()),
            last_caller: AtomicU16::new(BoxId::INVALID.0),
        }
    }

    /// Calls through a synchronous gateway and waits for the result, however
    /// long that takes. If the callee is faulted after the call reaches it,
    /// this never returns; callers that need a bound should go through an
    /// asynchronous gateway and [`BoxRpc::fncall_wait`] with a timeout.
    pub fn fncall_sync(
        &self,
        gw: &'static RpcGateway,
        args: [u32; 4],
    ) -> Result<u32, RpcError> {
        if context::in_interrupt() {
            return Err(RpcError::InvalidContext);
        }
        let token = self.send(gw, args, GatewayKind::Sync)?;
        self.fncall_wait(token, WAIT_FOREVER)
    }

    /// Calls through an asynchronous gateway. The result is collected later
    /// with [`BoxRpc::fncall_wait`].
    pub fn fncall_async(
        &self,
        gw: &'static RpcGateway,
        args: [u32; 4],
    ) -> Result<ResultToken, RpcError> {
        self.send(gw, args, GatewayKind::Async)
    }

    /// Calls through `gw` however the gateway says it should be called.
    pub fn call(
        &self,
        gw: &'static RpcGateway,
        args: [u32; 4],
    ) -> Result<CallOutcome, RpcError> {
        match gw.kind() {
            Some(GatewayKind::Sync) => {
                self.fncall_sync(gw, args).map(CallOutcome::Returned)
            }
            Some(GatewayKind::Async) => {
                self.fncall_async(gw, args).map(CallOutcome::Pending)
            }
            None => sys_halt(Violation::BadGateway),
        }
    }

    /// Waits up to `timeout_ms` for the result of the call named by `token`.
    ///
    /// Only one wait per call may be in progress, and a finished call can't
    /// be waited on again; trying either halts the box. A wait that times out
    /// can be retried.
    pub fn fncall_wait(
        &self,
        token: ResultToken,
        timeout_ms: u32,
    ) -> Result<u32, RpcError> {
        let slot = token.slot();
        let msg = match self.outgoing.pool().record(slot) {
            Some(msg) if token.is_valid() => msg,
            _ => sys_halt(Violation::ForeignResult),
        };

        if !msg.begin_wait(token) {
            if msg.match_cookie() == token {
                sys_halt(Violation::DoubleWait);
            }
            sys_halt(Violation::CookieMismatch);
        }

        match msg.semaphore.pend(timeout_ms) {
            Ok(()) => (),
            Err(e) => {
                msg.abandon_wait(token);
                ringbuf_entry!(Trace::WaitTimeout(token));
                return Err(match e {
                    SemError::Timeout => RpcError::Timeout,
                    SemError::FromInterrupt => RpcError::InvalidContext,
                });
            }
        }

        let result = {
            let mut body = msg.body.lock();
            if body.state != RpcMessageState::Done {
                drop(body);
                sys_halt(Violation::SlotMisuse);
            }
            body.state = RpcMessageState::Idle;
            body.result
        };
        msg.disarm();
        if self.release_outgoing(slot).is_err() {
            sys_halt(Violation::SlotMisuse);
        }
        ringbuf_entry!(Trace::Returned(token));
        Ok(result)
    }

    /// Serves one incoming call to any of `fns`, waiting up to `timeout_ms`
    /// for one to arrive. Returns the calling box.
    pub fn fncall_waitfor(
        &self,
        fns: &[RpcTarget],
        timeout_ms: u32,
    ) -> Result<BoxId, RpcError> {
        if fns.is_empty() || fns.len() > RPC_FN_GROUP_MAX_TARGETS {
            return Err(RpcError::InvalidParameter);
        }
        if context::in_interrupt() {
            return Err(RpcError::InvalidContext);
        }

        let groups = self.fn_groups.pool();
        let gslot = groups
            .allocate(0)
            .map_err(|_| RpcError::OutOfStructures)?;
        let Some(group) = groups.record(gslot) else {
            sys_halt(Violation::SlotMisuse);
        };
        {
            let mut targets = group.targets.lock();
            targets.clear();
            // Can't fail, the length was checked above.
            let _ = targets.extend_from_slice(fns);
        }
        group.semaphore.reset();
        if self.fn_groups.enqueue(gslot).is_err() {
            if groups.free(gslot).is_err() {
                ringbuf_entry!(Trace::Leaked(gslot));
            }
            return Err(RpcError::OutOfStructures);
        }

        let r = self.serve(fns, group, timeout_ms);

        if self.fn_groups.dequeue(gslot).is_err() || groups.free(gslot).is_err()
        {
            sys_halt(Violation::SlotMisuse);
        }
        r
    }

    /// The box that made the most recent call this box served.
    pub fn last_caller(&self) -> BoxId {
        BoxId(self.last_caller.load(Ordering::Relaxed))
    }

    fn send(
        &self,
        gw: &'static RpcGateway,
        args: [u32; 4],
        kind: GatewayKind,
    ) -> Result<ResultToken, RpcError> {
        let pool = self.outgoing.pool();
        let Ok(slot) = allocate_here(pool) else {
            ringbuf_entry!(Trace::OutOfStructures);
            return Err(RpcError::OutOfStructures);
        };
        let Some(msg) = pool.record(slot) else {
            sys_halt(Violation::SlotMisuse);
        };
        let Some(mut body) = lock_here(&msg.body) else {
            self.abandon_send(slot);
            return Err(RpcError::OutOfStructures);
        };

        let token = ResultToken::new(self.next_counter(), slot);
        msg.semaphore.reset();
        msg.arm(token);
        *body = MessageBody {
            args,
            gateway: Some(gw),
            kind,
            other_box: BoxId::INVALID,
            result: 0,
            state: RpcMessageState::ReadyToSend,
        };
        drop(body);

        let queued = if context::in_interrupt() {
            self.outgoing.try_enqueue(slot)
        } else {
            self.outgoing.enqueue(slot)
        };
        if queued.is_err() {
            msg.disarm();
            self.abandon_send(slot);
            return Err(RpcError::OutOfStructures);
        }
        ringbuf_entry!(Trace::Sent(token));
        Ok(token)
    }

    /// Advances the counter by one step. Lock-free, so interrupt handlers
    /// and threads can send concurrently.
    fn next_counter(&self) -> ResultCounter {
        let (Ok(prev) | Err(prev)) = self.counter.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |c| Some(ResultCounter::from_bits(c).next().get()),
        );
        ResultCounter::from_bits(prev).next()
    }

    /// Gives back the slot of a send that didn't make it into the queue.
    fn abandon_send(&self, slot: Slot) {
        if free_here(self.outgoing.pool(), slot).is_err() {
            ringbuf_entry!(Trace::Leaked(slot));
        }
    }

    fn release_outgoing(&self, slot: Slot) -> Result<(), SlotError> {
        self.outgoing.dequeue(slot)?;
        self.outgoing.pool().free(slot)
    }

    fn serve(
        &self,
        fns: &[RpcTarget],
        group: &FnGroup,
        timeout_ms: u32,
    ) -> Result<BoxId, RpcError> {
        let deadline = Deadline::after(timeout_ms);
        loop {
            if let Some(caller) = self.serve_one(fns) {
                return Ok(caller);
            }
            match group.semaphore.pend(deadline.remaining()) {
                Ok(()) => (),
                Err(SemError::Timeout) => {
                    ringbuf_entry!(Trace::GroupTimeout);
                    return Err(RpcError::Timeout);
                }
                Err(SemError::FromInterrupt) => {
                    return Err(RpcError::InvalidContext)
                }
            }
        }
    }

    /// Runs the first delivered call to any of `fns`, if there is one.
    fn serve_one(&self, fns: &[RpcTarget]) -> Option<BoxId> {
        let incoming = self.todo.pool();
        loop {
            let slot = self
                .todo
                .find_first(|_, msg| {
                    let body = msg.body.lock();
                    body.state == RpcMessageState::Sent
                        && body.gateway.is_some_and(|gw| {
                            fns.iter().any(|&f| gw.leads_to(f))
                        })
                })
                .ok()?;
            // Another thread serving an overlapping group may have taken it
            // between the search and here.
            if self.todo.dequeue(slot).is_err() {
                continue;
            }
            let msg = incoming.record(slot)?;

            let (target, args, caller) = {
                let body = msg.body.lock();
                match body.gateway {
                    Some(gw) => (gw.target, body.args, body.other_box),
                    None => {
                        drop(body);
                        sys_halt(Violation::SlotMisuse)
                    }
                }
            };
            let [a0, a1, a2, a3] = args;
            let result = target(a0, a1, a2, a3);
            {
                let mut body = msg.body.lock();
                body.result = result;
                body.state = RpcMessageState::Done;
            }
            if self.done.enqueue(slot).is_err() {
                sys_halt(Violation::SlotMisuse);
            }

            self.last_caller.store(caller.0, Ordering::Relaxed);
            ringbuf_entry!(Trace::Served { caller, slot });
            return Some(caller);
        }
    }
}
