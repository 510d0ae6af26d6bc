// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC between a client and a server box, through the monitor.

mod common;

use std::thread;

use boxlib::ipc::UBuf;
use boxlib::{
    BoxId, FaultInfo, IpcDesc, IpcError, IpcIoState, Slot, Violation,
    WAIT_FOREVER,
};
use common::{contexts, pools, with_drainer, CLIENT, CONFIGS, SERVER};
use monitor::Monitor;

const PORT: u32 = 7;

#[test]
fn send_to_box_two_on_port_seven() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();
    let client = &boxes[CLIENT].ipc;
    let server = &boxes[SERVER].ipc;

    let msg = *b"hello, box";
    let mut buf = [0u8; 32];
    let rtoken = unsafe {
        server.recv(&IpcDesc::new(BoxId::ANY, PORT, buf.len()), &mut buf)
    }
    .unwrap();

    let stoken = unsafe {
        client.send(&IpcDesc::new(BoxId(SERVER as u16), PORT, msg.len()), &msg)
    }
    .unwrap();
    assert_ne!(stoken, 0);

    let (sent, received) = with_drainer(&monitor, || {
        thread::scope(|s| {
            let rx = s.spawn(|| server.waitforany(rtoken, WAIT_FOREVER));
            let sent = client.waitforany(stoken, WAIT_FOREVER);
            (sent, rx.join().unwrap())
        })
    });
    assert_eq!(sent, Ok(stoken));
    assert_eq!(received, Ok(rtoken));

    assert_eq!(&buf[..msg.len()], &msg);
    assert_eq!(
        server.received(rtoken),
        Some(IpcDesc {
            token: rtoken,
            ..IpcDesc::new(BoxId(CLIENT as u16), PORT, msg.len())
        })
    );

    // Both sides' slots and tokens are back.
    assert_eq!(pools[CLIENT].ipc.send.num_allocated(), 0);
    assert_eq!(pools[SERVER].ipc.recv.num_allocated(), 0);
    assert_eq!(client.allocated_tokens(), 0);
    assert_eq!(server.allocated_tokens(), 0);
    assert_eq!(monitor.stats().ipc_delivered, 1);
}

#[test]
fn only_compatible_receives_match() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();
    let client = &boxes[CLIENT].ipc;
    let server = &boxes[SERVER].ipc;

    let msg = [0x5Au8; 16];
    let mut wrong_port = [0u8; 16];
    let mut wrong_sender = [0u8; 16];
    let mut too_small = [0u8; 8];
    let mut right = [0u8; 64];
    let (a, b, c, d) = unsafe {
        (
            server
                .recv(&IpcDesc::new(BoxId::ANY, PORT + 1, 16), &mut wrong_port)
                .unwrap(),
            server
                .recv(&IpcDesc::new(BoxId(0), PORT, 16), &mut wrong_sender)
                .unwrap(),
            server
                .recv(&IpcDesc::new(BoxId::ANY, PORT, 8), &mut too_small)
                .unwrap(),
            server
                .recv(&IpcDesc::new(BoxId(CLIENT as u16), PORT, 64), &mut right)
                .unwrap(),
        )
    };
    let s = unsafe {
        client.send(&IpcDesc::new(BoxId(SERVER as u16), PORT, 16), &msg)
    }
    .unwrap();

    monitor.drain();
    assert_eq!(client.waitforany(s, 0), Ok(s));
    assert_eq!(server.waitforany(a | b | c | d, 0), Ok(d));
    assert_eq!(&right[..16], &msg);
    assert_eq!(server.received(d).map(|desc| desc.len), Some(16));
    assert_eq!(boxes[SERVER].ipc.recv_queue.len(), 3);
    assert_eq!(wrong_port, [0; 16]);
    assert_eq!(wrong_sender, [0; 16]);
    assert_eq!(too_small, [0; 8]);
}

#[test]
fn unmatched_send_stays_queued() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();
    let client = &boxes[CLIENT].ipc;

    let msg = [1u8; 4];
    let s = unsafe {
        client.send(&IpcDesc::new(BoxId(SERVER as u16), PORT, 4), &msg)
    }
    .unwrap();
    monitor.drain();
    monitor.drain();
    assert_eq!(client.waitforany(s, 0), Err(IpcError::Timeout));
    assert_eq!(client.waitforall(s, 5), Err(IpcError::Timeout));
    assert_eq!(boxes[CLIENT].ipc.send_queue.len(), 1);

    // A receive posted later still gets it.
    let mut buf = [0u8; 4];
    let r = unsafe {
        boxes[SERVER]
            .ipc
            .recv(&IpcDesc::new(BoxId::ANY, PORT, 4), &mut buf)
    }
    .unwrap();
    monitor.drain();
    assert_eq!(client.waitforall(s, 0), Ok(s));
    assert_eq!(boxes[SERVER].ipc.waitforall(r, 0), Ok(r));
    assert_eq!(buf, msg);
}

#[test]
fn bad_send_buffer_faults_sender_only() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();

    let msg = [1u8; 4];
    let mut buf = [0u8; 4];
    unsafe {
        boxes[CLIENT]
            .ipc
            .send(&IpcDesc::new(BoxId(SERVER as u16), PORT, 4), &msg)
            .unwrap();
        boxes[SERVER]
            .ipc
            .recv(&IpcDesc::new(BoxId::ANY, PORT, 4), &mut buf)
            .unwrap();
    }
    // The client scribbles over its queued send.
    let slot = boxes[CLIENT].ipc.send_queue.slots()[0];
    let io = pools[CLIENT].ipc.send.record(slot).unwrap();
    io.body.lock().buf = UBuf { base: 0, len: 4 };

    monitor.drain();
    assert_eq!(
        monitor.fault_of(BoxId(CLIENT as u16)),
        Some(FaultInfo::Violation(Violation::BadBuffer))
    );
    assert_eq!(monitor.fault_of(BoxId(SERVER as u16)), None);
    // The server's receive went back in line.
    assert_eq!(boxes[SERVER].ipc.recv_queue.len(), 1);
    let rslot = boxes[SERVER].ipc.recv_queue.slots()[0];
    let rio = pools[SERVER].ipc.recv.record(rslot).unwrap();
    assert_eq!(rio.body.lock().state, IpcIoState::ReadyToRecv);
}

#[test]
fn impossible_destination_faults_sender() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();

    let msg = [1u8; 4];
    unsafe {
        boxes[CLIENT]
            .ipc
            .send(&IpcDesc::new(BoxId(SERVER as u16), PORT, 4), &msg)
            .unwrap();
    }
    let slot = boxes[CLIENT].ipc.send_queue.slots()[0];
    let io = pools[CLIENT].ipc.send.record(slot).unwrap();
    io.body.lock().desc.box_id = BoxId(12);

    monitor.drain();
    assert_eq!(
        monitor.fault_of(BoxId(CLIENT as u16)),
        Some(FaultInfo::Violation(Violation::BadDescriptor))
    );
}

#[test]
fn held_transfer_records_put_delivery_off() {
    let pools = pools();
    let boxes = contexts(&pools);
    let monitor = Monitor::new(&CONFIGS, &boxes).unwrap();
    let client = &boxes[CLIENT].ipc;
    let server = &boxes[SERVER].ipc;

    let msg = *b"later";
    let mut buf = [0u8; 8];
    let rtoken = unsafe {
        server.recv(&IpcDesc::new(BoxId::ANY, PORT, buf.len()), &mut buf)
    }
    .unwrap();
    let stoken = unsafe {
        client.send(&IpcDesc::new(BoxId(SERVER as u16), PORT, msg.len()), &msg)
    }
    .unwrap();

    // The sender is in the middle of touching its send record.
    let send_io = pools[CLIENT].ipc.send.record(Slot(0)).unwrap();
    let held = send_io.body.lock();
    monitor.drain();
    drop(held);
    assert_eq!(monitor.stats().ipc_deferred, 1);
    assert_eq!(monitor.stats().ipc_delivered, 0);

    // Then the receiver is, with its receive record.
    let recv_io = pools[SERVER].ipc.recv.record(Slot(0)).unwrap();
    let held = recv_io.body.lock();
    monitor.drain();
    drop(held);
    assert_eq!(monitor.stats().ipc_deferred, 2);
    assert_eq!(monitor.stats().ipc_delivered, 0);
    assert_eq!(client.send_queue.len(), 1);
    assert_eq!(server.recv_queue.len(), 1);
    assert_eq!(client.completed_tokens(), 0);
    assert_eq!(server.completed_tokens(), 0);
    assert_eq!(server.received(rtoken), None);

    monitor.drain();
    assert_eq!(monitor.stats().ipc_delivered, 1);
    assert_eq!(client.waitforany(stoken, 0), Ok(stoken));
    assert_eq!(server.waitforany(rtoken, 0), Ok(rtoken));
    assert_eq!(&buf[..msg.len()], &msg);
}
