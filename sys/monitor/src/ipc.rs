// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor side of IPC: pairing sends with receives and copying messages.

use core::cell::Cell;

use abi::{BoxId, FaultInfo, IpcDesc, IpcIoState, Slot, Violation};
use boxlib::ipc::{IoBody, IpcIo};
use boxlib::BoxContext;
use pool::{PoolQueue, SlotError};
use ringbuf::{ringbuf, ringbuf_entry};
use spin::MutexGuard;

use crate::err::InteractFault;
use crate::umem::{safe_copy, USlice};
use crate::{busy_retry, retry, try_lock_box, Counters, Monitor};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Matched {
        sender: BoxId,
        receiver: BoxId,
        port: u32,
        len: usize,
    },
    CopyFault {
        sender: BoxId,
        receiver: BoxId,
    },
    Busy(BoxId),
    Leaked {
        owner: BoxId,
        slot: Slot,
    },
}

ringbuf!(Trace, 64, Trace::None);

fn id(index: usize) -> BoxId {
    BoxId(index as u16)
}

/// Puts `slot` back where it came from, or makes a note that it's lost.
fn requeue<const N: usize>(
    owner: usize,
    queue: &PoolQueue<'_, IpcIo, N>,
    slot: Slot,
) {
    if busy_retry(|| queue.try_enqueue(slot)).is_err() {
        ringbuf_entry!(Trace::Leaked {
            owner: id(owner),
            slot
        });
    }
}

/// Marks a dequeued transfer finished and gives its slot back.
fn retire<const N: usize>(
    owner: usize,
    queue: &PoolQueue<'_, IpcIo, N>,
    mut body: MutexGuard<'_, IoBody>,
    slot: Slot,
) {
    body.state = IpcIoState::Valid;
    drop(body);
    if busy_retry(|| queue.pool().try_free(slot)).is_err() {
        ringbuf_entry!(Trace::Leaked {
            owner: id(owner),
            slot
        });
    }
}

impl Monitor<'_, '_> {
    /// Delivers every queued send that has a matching receive.
    pub(crate) fn deliver_messages(&self) {
        for (sender, cx) in self.live_boxes() {
            let Ok(slots) = busy_retry(|| cx.ipc.send_queue.try_slots()) else {
                ringbuf_entry!(Trace::Busy(id(sender)));
                continue;
            };
            for slot in slots {
                if let Err(f) = self.deliver_message(sender, cx, slot) {
                    self.force_fault_index(sender, f);
                }
                if !self.is_live(sender) {
                    break;
                }
            }
        }
    }

    /// Notes that a send involving box `busy` has to wait for a later drain.
    fn defer_message(&self, busy: usize) {
        Counters::bump(&self.counters.ipc_deferred);
        ringbuf_entry!(Trace::Busy(id(busy)));
    }

    fn deliver_message(
        &self,
        sender: usize,
        cx: &BoxContext<'_>,
        sslot: Slot,
    ) -> Result<(), FaultInfo> {
        let sends = &cx.ipc.send_queue;
        let Some(sio) = sends.pool().record(sslot) else {
            return Err(Violation::BadQueue.into());
        };
        let Some(sbody) = try_lock_box(&sio.body) else {
            self.defer_message(sender);
            return Ok(());
        };
        let send: IoBody = *sbody;
        if send.state != IpcIoState::ReadyToSend {
            return Ok(());
        }
        let dest = send.desc.box_id;
        if !dest.is_in_range(self.boxes.len()) {
            return Err(Violation::BadDescriptor.into());
        }
        let dest = dest.index();
        if !self.is_live(dest) {
            return Ok(());
        }

        let dest_ipc = &self.boxes[dest].ipc;
        let recvs = &dest_ipc.recv_queue;
        let from = id(sender);
        // Set when a receive couldn't be looked at; the search stops there so
        // that a later receive can't jump ahead of it.
        let blocked = Cell::new(false);
        let found = busy_retry(|| {
            blocked.set(false);
            recvs.try_find_first(|_, io| {
                let Some(r) = io.body.try_lock() else {
                    blocked.set(true);
                    return true;
                };
                r.state == IpcIoState::ReadyToRecv
                    && (r.desc.box_id == from || r.desc.box_id == BoxId::ANY)
                    && r.desc.port == send.desc.port
                    && r.buf.len >= send.desc.len
            })
        });
        let rslot = match found {
            Ok(_) if blocked.get() => {
                self.defer_message(dest);
                return Ok(());
            }
            Ok(rslot) => rslot,
            Err(SlotError::WouldBlock) => {
                self.defer_message(dest);
                return Ok(());
            }
            // No taker yet.
            Err(_) => return Ok(()),
        };
        let Some(rio) = recvs.pool().record(rslot) else {
            return Ok(());
        };
        let Some(rbody) = try_lock_box(&rio.body) else {
            self.defer_message(dest);
            return Ok(());
        };
        let recv: IoBody = *rbody;
        let delivered = IpcDesc {
            box_id: from,
            port: send.desc.port,
            len: send.desc.len,
            token: recv.desc.token,
        };
        if retry(|| dest_ipc.stage_received(&delivered).then_some(())).is_none()
        {
            self.defer_message(dest);
            return Ok(());
        }

        if busy_retry(|| recvs.try_dequeue(rslot)).is_err() {
            self.defer_message(dest);
            return Ok(());
        }
        if busy_retry(|| sends.try_dequeue(sslot)).is_err() {
            requeue(dest, recvs, rslot);
            self.defer_message(sender);
            return Ok(());
        }

        let copied = USlice::from_ubuf(&send.buf)
            .map_err(InteractFault::in_src)
            .and_then(|src| {
                let dst =
                    USlice::from_ubuf(&recv.buf).map_err(InteractFault::in_dst)?;
                // Safety: both boxes handed us these buffers through the
                // IPC API, which obliges them to leave them alone until the
                // tokens complete.
                unsafe { safe_copy(&src, &dst, send.desc.len) }
            });

        match copied {
            Ok(len) => {
                retire(sender, sends, sbody, sslot);
                retire(dest, recvs, rbody, rslot);
                cx.ipc.complete(send.desc.token);
                dest_ipc.complete_received(recv.desc.token);
                Counters::bump(&self.counters.ipc_delivered);
                ringbuf_entry!(Trace::Matched {
                    sender: from,
                    receiver: id(dest),
                    port: send.desc.port,
                    len
                });
            }
            Err(fault) => {
                drop((sbody, rbody));
                ringbuf_entry!(Trace::CopyFault {
                    sender: from,
                    receiver: id(dest)
                });
                fault.apply(self, sender, dest);
                // Whichever side wasn't to blame keeps its transfer queued.
                if self.is_live(dest) {
                    requeue(dest, recvs, rslot);
                }
                if self.is_live(sender) {
                    requeue(sender, sends, sslot);
                }
            }
        }
        Ok(())
    }
}
