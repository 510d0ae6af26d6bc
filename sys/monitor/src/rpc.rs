// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor side of RPC: delivering calls, waking callees and returning
//! results.

use abi::{
    BoxId, FaultInfo, GatewayKind, ResultToken, RpcGateway, RpcMessageState,
    Slot, Violation, RPC_GATEWAY_LDR_PC,
};
use boxlib::rpc::{IncomingPool, MessageBody};
use boxlib::BoxContext;
use pool::SlotError;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::err::InteractFault;
use crate::{busy_retry, retry, try_lock_box, Counters, Monitor};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Delivered {
        caller: BoxId,
        callee: BoxId,
        token: ResultToken,
    },
    CalleeFull(BoxId),
    CalleeFaulted(BoxId),
    Woke { callee: BoxId, group: Slot },
    Returned { caller: BoxId, token: ResultToken },
    CookieMismatch { callee: BoxId, token: ResultToken },
    CallerGone(BoxId),
    Busy(BoxId),
    Leaked { owner: BoxId, slot: Slot },
}

ringbuf!(Trace, 64, Trace::None);

fn id(index: usize) -> BoxId {
    BoxId(index as u16)
}

impl Monitor<'_, '_> {
    /// Figures out which box a message's gateway leads into, checking that
    /// the gateway is real and was used the way it asks to be used.
    fn gateway_callee(&self, body: &MessageBody) -> Result<usize, FaultInfo> {
        let gw: &RpcGateway = body.gateway.ok_or(Violation::BadGateway)?;
        if gw.ldr_pc != RPC_GATEWAY_LDR_PC {
            return Err(Violation::BadGateway.into());
        }
        let kind: GatewayKind = gw.kind().ok_or(Violation::BadGateway)?;
        if kind != body.kind {
            return Err(Violation::GatewayKind.into());
        }
        self.config_index(gw.box_cfg)
            .ok_or_else(|| Violation::BadGateway.into())
    }

    /// Copies every outgoing call that's ready into its callee's to-do
    /// queue.
    pub(crate) fn deliver_calls(&self) {
        for (caller, cx) in self.live_boxes() {
            let Ok(slots) = busy_retry(|| cx.rpc.outgoing.try_slots()) else {
                ringbuf_entry!(Trace::Busy(id(caller)));
                continue;
            };
            for slot in slots {
                if let Err(f) = self.deliver_call(caller, cx, slot) {
                    self.force_fault_index(caller, f);
                    break;
                }
            }
        }
    }

    fn deliver_call(
        &self,
        caller: usize,
        cx: &BoxContext<'_>,
        slot: Slot,
    ) -> Result<(), FaultInfo> {
        let Some(omsg) = cx.rpc.outgoing.pool().record(slot) else {
            return Err(Violation::BadQueue.into());
        };
        let Some(mut obody) = try_lock_box(&omsg.body) else {
            self.defer_call(id(caller));
            return Ok(());
        };
        if obody.state != RpcMessageState::ReadyToSend {
            return Ok(());
        }
        let callee = self.gateway_callee(&obody)?;
        if !self.is_live(callee) {
            // The call stays pending, and the caller can give up on it with
            // a timed wait.
            ringbuf_entry!(Trace::CalleeFaulted(id(callee)));
            return Ok(());
        }

        let target = &self.boxes[callee].rpc;
        let incoming = target.todo.pool();
        let Ok(islot) = busy_retry(|| incoming.try_allocate()) else {
            Counters::bump(&self.counters.rpc_deferred);
            ringbuf_entry!(Trace::CalleeFull(id(callee)));
            return Ok(());
        };
        let token = omsg.match_cookie();
        let Some(imsg) = incoming.record(islot) else {
            crate::fail::die("pool handed out a slot it doesn't have");
        };
        let Some(mut ibody) = try_lock_box(&imsg.body) else {
            drop(obody);
            self.give_back(callee, incoming, islot);
            self.defer_call(id(callee));
            return Ok(());
        };
        imsg.semaphore.reset();
        imsg.arm(token);
        *ibody = MessageBody {
            other_box: id(caller),
            result: 0,
            state: RpcMessageState::Sent,
            ..*obody
        };
        if busy_retry(|| target.todo.try_enqueue(islot)).is_err() {
            ibody.state = RpcMessageState::Idle;
            drop(ibody);
            imsg.disarm();
            self.give_back(callee, incoming, islot);
            self.defer_call(id(callee));
            return Ok(());
        }
        drop(ibody);

        obody.state = RpcMessageState::Sent;
        drop(obody);
        Counters::bump(&self.counters.rpc_delivered);
        ringbuf_entry!(Trace::Delivered {
            caller: id(caller),
            callee: id(callee),
            token
        });
        Ok(())
    }

    /// Notes that RPC work involving box `busy` has to wait for a later
    /// drain.
    fn defer_call(&self, busy: BoxId) {
        Counters::bump(&self.counters.rpc_deferred);
        ringbuf_entry!(Trace::Busy(busy));
    }

    /// Frees an incoming slot that never made it into a queue, or notes that
    /// it's lost.
    fn give_back(&self, owner: usize, incoming: &IncomingPool, slot: Slot) {
        if busy_retry(|| incoming.try_free(slot)).is_err() {
            ringbuf_entry!(Trace::Leaked {
                owner: id(owner),
                slot
            });
        }
    }

    /// Posts every function group that has a delivered call waiting for one
    /// of its targets.
    pub(crate) fn wake_groups(&self) {
        for (callee, cx) in self.live_boxes() {
            let rpc = &cx.rpc;
            let (Ok(todo), Ok(groups)) = (
                busy_retry(|| rpc.todo.try_slots()),
                busy_retry(|| rpc.fn_groups.try_slots()),
            ) else {
                ringbuf_entry!(Trace::Busy(id(callee)));
                continue;
            };
            for islot in todo {
                let Some(imsg) = rpc.todo.pool().record(islot) else {
                    continue;
                };
                // A call whose record is busy is looked at again next drain.
                let Some(body) = try_lock_box(&imsg.body).map(|b| *b) else {
                    ringbuf_entry!(Trace::Busy(id(callee)));
                    continue;
                };
                let Some(gw) = body.gateway else {
                    continue;
                };
                if body.state != RpcMessageState::Sent {
                    continue;
                }
                for &gslot in &groups {
                    let Some(group) = rpc.fn_groups.pool().record(gslot) else {
                        continue;
                    };
                    if retry(|| group.try_contains(gw)) == Some(true) {
                        group.semaphore.post();
                        ringbuf_entry!(Trace::Woke {
                            callee: id(callee),
                            group: gslot
                        });
                    }
                }
            }
        }
    }

    /// Hands every finished call's result back to its caller.
    pub(crate) fn return_results(&self) {
        for (callee, cx) in self.live_boxes() {
            let Ok(slots) = busy_retry(|| cx.rpc.done.try_slots()) else {
                ringbuf_entry!(Trace::Busy(id(callee)));
                continue;
            };
            for slot in slots {
                match self.return_result(callee, cx, slot) {
                    Ok(()) => (),
                    Err(f) => {
                        f.apply(self, callee, callee);
                        break;
                    }
                }
                if !self.is_live(callee) {
                    break;
                }
            }
        }
    }

    /// Returns one result. Errors are the callee's fault; blame that also
    /// lands on the caller is applied here.
    ///
    /// Every lock involved is taken before the message leaves the done
    /// queue, so a busy box leaves the result where it is for the next drain.
    fn return_result(
        &self,
        callee: usize,
        cx: &BoxContext<'_>,
        slot: Slot,
    ) -> Result<(), InteractFault> {
        let incoming = cx.rpc.done.pool();
        let Some(imsg) = incoming.record(slot) else {
            return Err(InteractFault::in_src(Violation::BadQueue));
        };
        let Some(mut ibody) = try_lock_box(&imsg.body) else {
            self.defer_call(id(callee));
            return Ok(());
        };
        if ibody.state != RpcMessageState::Done {
            return Err(InteractFault::in_src(Violation::SlotMisuse));
        }
        let caller = ibody.other_box.index();
        if !ibody.other_box.is_in_range(self.boxes.len()) {
            return Err(InteractFault::in_src(Violation::BadDescriptor));
        }

        let token = imsg.match_cookie();
        let caller_live = self.is_live(caller);
        let omsg = if caller_live {
            self.boxes[caller]
                .rpc
                .outgoing
                .pool()
                .record(token.slot())
                .filter(|_| token.is_valid())
                .filter(|omsg| omsg.match_cookie() == token)
        } else {
            None
        };
        let obody = match omsg {
            Some(omsg) => match try_lock_box(&omsg.body) {
                Some(obody) => Some((omsg, obody)),
                None => {
                    self.defer_call(id(caller));
                    return Ok(());
                }
            },
            None => None,
        };

        match busy_retry(|| cx.rpc.done.try_dequeue(slot)) {
            Ok(_) => (),
            Err(SlotError::WouldBlock) => {
                self.defer_call(id(callee));
                return Ok(());
            }
            Err(_) => return Err(InteractFault::in_src(Violation::BadQueue)),
        }

        if caller_live {
            let returned = obody.and_then(|(omsg, mut obody)| {
                let to_callee = obody.gateway.is_some_and(|gw| {
                    self.config_index(gw.box_cfg) == Some(callee)
                });
                if obody.state != RpcMessageState::Sent || !to_callee {
                    return None;
                }
                obody.result = ibody.result;
                obody.state = RpcMessageState::Done;
                Some(omsg)
            });
            match returned {
                Some(omsg) => {
                    omsg.semaphore.post();
                    Counters::bump(&self.counters.rpc_returned);
                    ringbuf_entry!(Trace::Returned {
                        caller: id(caller),
                        token
                    });
                }
                None => {
                    ringbuf_entry!(Trace::CookieMismatch {
                        callee: id(callee),
                        token
                    });
                    InteractFault::in_src(Violation::CookieMismatch)
                        .apply(self, callee, caller);
                }
            }
        } else {
            ringbuf_entry!(Trace::CallerGone(id(caller)));
        }

        ibody.state = RpcMessageState::Idle;
        drop(ibody);
        imsg.disarm();
        self.give_back(callee, incoming, slot);
        Ok(())
    }
}
