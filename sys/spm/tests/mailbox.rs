// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client calls arriving from a non-secure core through the shared queue.

mod common;

use abi::mailbox::{
    MailboxMsg, MailboxParams, NsMailboxQueue, MAILBOX_INVAL_PARAMS, MAILBOX_NO_PEND_EVENT,
    MAILBOX_PSA_CALL, MAILBOX_PSA_CLOSE, MAILBOX_PSA_CONNECT, MAILBOX_PSA_FRAMEWORK_VERSION,
    MAILBOX_PSA_VERSION,
};
use abi::{
    FaultInfo, PsaInvec, PsaOutvec, PSA_ERROR_PROGRAMMER_ERROR, PSA_FRAMEWORK_VERSION,
    PSA_IPC_CALL, PSA_IPC_CONNECT, PSA_IPC_DISCONNECT, PSA_SUCCESS, PSA_VERSION_NONE,
};
use common::*;

/// Where the queue lives in non-secure memory.
const QUEUE: usize = NS_SCRATCH + 0x800;
/// Client id the peer uses for its callers.
const PEER_CLIENT: i32 = -3;

/// IPC rig with the client running and the queue attached.
fn rig() -> Rig {
    let mut rig = Rig::ipc();
    service_wait(&mut rig);
    let q = rig.addr(QUEUE);
    rig.spm.attach_mailbox(q, Some(MAILBOX_IRQ)).unwrap();
    rig
}

fn queue(rig: &Rig) -> NsMailboxQueue {
    rig.get(rig.addr(QUEUE))
}

/// Writes `msg` into `slot` and marks it pending, the way the peer does.
fn post(rig: &Rig, slot: usize, msg: MailboxMsg) {
    let mut q = queue(rig);
    q.queue[slot].msg = msg;
    q.pend_slots |= 1 << slot;
    rig.put(rig.addr(QUEUE), &q);
}

/// Acknowledges every reply, as the peer does once it has read them.
fn ack_replies(rig: &Rig) {
    let mut q = queue(rig);
    q.replied_slots = 0;
    rig.put(rig.addr(QUEUE), &q);
}

/// Raises the mailbox interrupt and lets the SPM run.
fn ring(rig: &mut Rig) {
    rig.spm.irq_entry(MAILBOX_IRQ);
    rig.settle();
}

fn msg(call_type: i32, params: MailboxParams) -> MailboxMsg {
    MailboxMsg {
        call_type,
        client_id: PEER_CLIENT,
        params,
    }
}

/// Opens a connection to the echo service from the peer, through slot 0.
fn peer_connect(rig: &mut Rig) -> i32 {
    let params = MailboxParams {
        sid: ECHO_SID,
        version: 1,
        ..MailboxParams::default()
    };
    post(rig, 0, msg(MAILBOX_PSA_CONNECT, params));
    ring(rig);
    assert_eq!(rig.spm.current(), Some(SERVICE));
    assert_eq!(queue(rig).pend_slots, 0);

    let m = service_get(rig, ECHO_SIGNAL);
    assert_eq!(m.msg_type, PSA_IPC_CONNECT);
    assert_eq!(m.client_id, PEER_CLIENT);
    service_reply(rig, m.handle, PSA_SUCCESS);
    service_wait(rig);

    let q = queue(rig);
    assert_eq!(q.replied_slots, 0b1);
    ack_replies(rig);
    q.queue[0].reply.return_val
}

#[test]
fn attaching_enables_the_interrupt() {
    let rig = rig();
    assert!(rig.spm.hal().irq_enabled(MAILBOX_IRQ));
    assert!(rig.spm.mailbox().is_some());
}

#[test]
fn queue_must_be_non_secure() {
    let mut rig = Rig::ipc();
    let q = rig.addr(SERVICE_SCRATCH);
    assert_eq!(
        rig.spm.attach_mailbox(q, None),
        Err(FaultInfo::MemoryAccess {
            address: q,
            size: std::mem::size_of::<NsMailboxQueue>(),
        })
    );
    assert!(rig.spm.mailbox().is_none());
}

#[test]
fn scenario_d_call_from_slot_2() {
    let mut rig = rig();
    let handle = peer_connect(&mut rig);
    assert!(handle > 0);
    let notified = rig.spm.hal().peer_notifications();

    // Marks the peer left in slots 1 and 3.
    let mut q = queue(&rig);
    q.queue[1].owner = 0x1111;
    q.queue[3].reply.return_val = 77;
    q.queue[2].reply.return_val = 0x55;
    rig.put(rig.addr(QUEUE), &q);

    let input = rig.addr(NS_SCRATCH + 0x100);
    let output = rig.addr(NS_SCRATCH + 0x200);
    let in_tbl = rig.addr(NS_SCRATCH + 0x300);
    let out_tbl = rig.addr(NS_SCRATCH + 0x340);
    rig.poke(input, b"ping");
    rig.put(in_tbl, &[PsaInvec { base: input, len: 4 }]);
    rig.put(out_tbl, &[PsaOutvec { base: output, len: 16 }]);

    let params = MailboxParams {
        handle,
        msg_type: PSA_IPC_CALL,
        in_vec: in_tbl,
        in_len: 1,
        out_vec: out_tbl,
        out_len: 1,
        ..MailboxParams::default()
    };
    post(&rig, 2, msg(MAILBOX_PSA_CALL, params));
    ring(&mut rig);

    assert_eq!(rig.spm.current(), Some(SERVICE));
    assert_eq!(queue(&rig).pend_slots, 0);
    assert_eq!(
        rig.spm.mailbox().unwrap().in_flight(2).map(|m| m.call_type),
        Some(MAILBOX_PSA_CALL)
    );

    let m = service_get(&mut rig, ECHO_SIGNAL);
    assert_eq!(m.client_id, PEER_CLIENT);
    assert_eq!(m.in_size[0], 4);
    let scratch = rig.addr(SERVICE_SCRATCH);
    assert_eq!(rig.spm.psa_read(SERVICE, handle, 0, scratch, 8), Ok(4));
    assert_eq!(rig.peek(scratch, 4), b"ping");
    rig.poke(scratch, b"pong!");
    rig.spm.psa_write(SERVICE, handle, 0, scratch, 5).unwrap();
    service_reply(&mut rig, handle, PSA_SUCCESS);

    let q = queue(&rig);
    assert_eq!(q.replied_slots, 0b100);
    assert_eq!(q.pend_slots, 0);
    assert_eq!(q.queue[2].reply.return_val, PSA_SUCCESS);
    assert_eq!(q.queue[1].owner, 0x1111);
    assert_eq!(q.queue[3].reply.return_val, 77);
    assert_eq!(rig.spm.hal().peer_notifications(), notified + 1);
    assert!(!rig.spm.hal().in_mailbox_critical());
    assert!(rig.spm.mailbox().unwrap().in_flight(2).is_none());

    let out: [PsaOutvec; 1] = rig.get(out_tbl);
    assert_eq!(out[0].len, 5);
    assert_eq!(rig.peek(output, 5), b"pong!");
}

#[test]
fn simple_calls_are_answered_at_once() {
    let mut rig = rig();
    let version = |sid| MailboxParams {
        sid,
        ..MailboxParams::default()
    };
    post(&rig, 0, msg(MAILBOX_PSA_VERSION, version(ECHO_SID)));
    post(&rig, 1, msg(MAILBOX_PSA_FRAMEWORK_VERSION, MailboxParams::default()));
    post(&rig, 3, msg(MAILBOX_PSA_VERSION, version(SECRET_SID)));
    ring(&mut rig);

    let q = queue(&rig);
    assert_eq!(q.pend_slots, 0);
    assert_eq!(q.replied_slots, 0b1011);
    assert_eq!(q.queue[0].reply.return_val, 1);
    assert_eq!(q.queue[1].reply.return_val, PSA_FRAMEWORK_VERSION as i32);
    assert_eq!(q.queue[3].reply.return_val, PSA_VERSION_NONE as i32);
    assert_eq!(rig.spm.hal().peer_notifications(), 3);
    assert_eq!(rig.spm.current(), Some(CLIENT));
}

#[test]
fn malformed_messages_are_refused() {
    let mut rig = rig();
    post(&rig, 0, msg(9, MailboxParams::default()));
    let mut secure = msg(MAILBOX_PSA_FRAMEWORK_VERSION, MailboxParams::default());
    secure.client_id = CLIENT_ID;
    post(&rig, 1, secure);
    ring(&mut rig);

    let q = queue(&rig);
    assert_eq!(q.replied_slots, 0b11);
    assert_eq!(q.queue[0].reply.return_val, MAILBOX_INVAL_PARAMS);
    assert_eq!(q.queue[1].reply.return_val, MAILBOX_INVAL_PARAMS);
}

#[test]
fn spurious_interrupts_are_harmless() {
    let mut rig = rig();
    assert_eq!(rig.spm.mailbox_handle(), Ok(MAILBOX_NO_PEND_EVENT));
    ring(&mut rig);
    assert_eq!(queue(&rig), NsMailboxQueue::default());
    assert_eq!(rig.spm.hal().peer_notifications(), 0);
}

#[test]
fn close_from_the_peer() {
    let mut rig = rig();
    let handle = peer_connect(&mut rig);
    assert_eq!(rig.spm.conns().in_use(), 1);

    let params = MailboxParams {
        handle,
        ..MailboxParams::default()
    };
    post(&rig, 1, msg(MAILBOX_PSA_CLOSE, params));
    ring(&mut rig);
    let m = service_get(&mut rig, ECHO_SIGNAL);
    assert_eq!(m.msg_type, PSA_IPC_DISCONNECT);
    service_reply(&mut rig, handle, PSA_SUCCESS);

    let q = queue(&rig);
    assert_eq!(q.replied_slots, 0b10);
    assert_eq!(q.queue[1].reply.return_val, PSA_SUCCESS);
    assert_eq!(rig.spm.conns().in_use(), 0);
}

#[test]
fn programmer_error_sticks_to_the_connection() {
    let mut rig = rig();
    let handle = peer_connect(&mut rig);
    let call = MailboxParams {
        handle,
        msg_type: PSA_IPC_CALL,
        ..MailboxParams::default()
    };
    post(&rig, 1, msg(MAILBOX_PSA_CALL, call));
    ring(&mut rig);
    let m = service_get(&mut rig, ECHO_SIGNAL);
    assert_eq!(m.handle, handle);
    // Non-secure caller, so this isn't fatal.
    service_reply(&mut rig, handle, PSA_ERROR_PROGRAMMER_ERROR);
    service_wait(&mut rig);

    let q = queue(&rig);
    assert_eq!(q.replied_slots, 0b10);
    assert_eq!(q.queue[1].reply.return_val, PSA_ERROR_PROGRAMMER_ERROR);
    ack_replies(&rig);

    // Every later call fails the same way, without reaching the service.
    post(&rig, 2, msg(MAILBOX_PSA_CALL, call));
    ring(&mut rig);
    assert_eq!(rig.spm.current(), Some(CLIENT));
    let q = queue(&rig);
    assert_eq!(q.replied_slots, 0b100);
    assert_eq!(q.queue[2].reply.return_val, PSA_ERROR_PROGRAMMER_ERROR);
    assert_eq!(rig.spm.conns().in_use(), 1);
    ack_replies(&rig);

    // Closing frees the slot straight away.
    let close = MailboxParams {
        handle,
        ..MailboxParams::default()
    };
    post(&rig, 3, msg(MAILBOX_PSA_CLOSE, close));
    ring(&mut rig);
    assert_eq!(rig.spm.current(), Some(CLIENT));
    let q = queue(&rig);
    assert_eq!(q.replied_slots, 0b1000);
    assert_eq!(q.queue[3].reply.return_val, PSA_SUCCESS);
    assert_eq!(rig.spm.conns().in_use(), 0);
}

#[test]
#[should_panic(expected = "SYSTEM RESET")]
fn second_call_on_a_busy_handle_is_fatal() {
    let mut rig = rig();
    let handle = peer_connect(&mut rig);
    let params = MailboxParams {
        handle,
        msg_type: PSA_IPC_CALL,
        ..MailboxParams::default()
    };
    post(&rig, 1, msg(MAILBOX_PSA_CALL, params));
    post(&rig, 3, msg(MAILBOX_PSA_CALL, params));
    ring(&mut rig);
}

#[test]
#[should_panic(expected = "SYSTEM RESET")]
fn connecting_to_a_secure_only_service_is_fatal() {
    let mut rig = rig();
    let params = MailboxParams {
        sid: SECRET_SID,
        version: 2,
        ..MailboxParams::default()
    };
    post(&rig, 0, msg(MAILBOX_PSA_CONNECT, params));
    ring(&mut rig);
}
