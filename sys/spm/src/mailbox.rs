// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mailbox bridge for PSA client calls from a non-secure core.
//!
//! On multi-core parts the non-secure world runs on its own core and reaches
//! the SPE through a queue in shared memory (`abi::mailbox::NsMailboxQueue`).
//! The non-secure side fills a slot, sets its bit in `pend_slots` and raises
//! an interrupt. We copy each pending message out, clear its pending bit,
//! and run the call without blocking anything; the result is written into
//! the slot's reply, its bit set in `replied_slots`, and the peer notified.
//!
//! The other core can write the queue at any time, so it's only ever read and
//! written with volatile accesses, never referenced, and the slot bitmasks
//! are only touched inside the platform's cross-core critical section.
//!
//! SPE-side copies are kept one per non-secure slot, at the same index.

use abi::mailbox::{
    MailboxMsg, MailboxStatus, NsMailboxQueue, MAILBOX_INVAL_PARAMS, MAILBOX_NO_PEND_EVENT,
    MAILBOX_PSA_CALL, MAILBOX_PSA_CLOSE, MAILBOX_PSA_CONNECT, MAILBOX_PSA_FRAMEWORK_VERSION,
    MAILBOX_PSA_VERSION, MAILBOX_SUCCESS, NUM_MAILBOX_QUEUE_SLOT,
};
use abi::{client_id_is_ns, FaultInfo};
use core::ptr::addr_of_mut;

use crate::err::UserError;
use crate::hal::Hal;
use crate::memcheck::{Access, Accessor};
use crate::psa::Completion;
use crate::state::SpmState;
use crate::trace::Trace;
use crate::umem::USlice;

#[derive(Debug)]
pub struct SpeMailbox {
    queue: *mut NsMailboxQueue,
    /// Messages taken from the queue and not yet replied to.
    slots: [Option<MailboxMsg>; NUM_MAILBOX_QUEUE_SLOT],
}

impl SpeMailbox {
    /// # Safety
    ///
    /// `queue` must point to a suitably aligned `NsMailboxQueue` that stays
    /// mapped for as long as this exists.
    pub unsafe fn new(queue: usize) -> Self {
        Self {
            queue: queue as *mut NsMailboxQueue,
            slots: [None; NUM_MAILBOX_QUEUE_SLOT],
        }
    }

    pub fn pend_slots(&self) -> u32 {
        // Safety: valid per construction; volatile since the peer writes it.
        unsafe { addr_of_mut!((*self.queue).pend_slots).read_volatile() }
    }

    pub fn replied_slots(&self) -> u32 {
        unsafe { addr_of_mut!((*self.queue).replied_slots).read_volatile() }
    }

    /// Copies slot `idx`'s message out of shared memory and drops its
    /// pending bit. Call with the critical section held.
    fn take(&mut self, idx: usize) -> MailboxMsg {
        // Safety: `idx` is in range, checked by the caller; see `new`.
        let msg = unsafe { addr_of_mut!((*self.queue).queue[idx].msg).read_volatile() };
        let pend = self.pend_slots() & !(1 << idx);
        unsafe { addr_of_mut!((*self.queue).pend_slots).write_volatile(pend) };
        self.slots[idx] = Some(msg);
        msg
    }

    fn write_reply(&mut self, idx: usize, value: i32) {
        unsafe { addr_of_mut!((*self.queue).queue[idx].reply.return_val).write_volatile(value) };
        self.slots[idx] = None;
    }

    /// Call with the critical section held.
    fn set_replied(&mut self, idx: usize) {
        let replied = self.replied_slots() | (1 << idx);
        unsafe { addr_of_mut!((*self.queue).replied_slots).write_volatile(replied) };
    }

    /// The message taken from slot `idx` that's still awaiting a reply.
    pub fn in_flight(&self, idx: usize) -> Option<&MailboxMsg> {
        self.slots.get(idx)?.as_ref()
    }
}

impl<H: Hal> SpmState<H> {
    /// Starts serving the non-secure queue at `queue`, signalled through
    /// interrupt `irq` if it has one.
    ///
    /// The queue has to sit in memory the non-secure world can write.
    pub fn attach_mailbox(&mut self, queue: usize, irq: Option<u32>) -> Result<(), FaultInfo> {
        let slice = USlice::<NsMailboxQueue>::from_raw(queue, 1)?;
        let peer = Accessor {
            partition: None,
            ns: true,
            privileged: false,
        };
        self.memory_check(&peer, slice.base_addr(), slice.byte_len(), Access::ReadWrite)?;
        // Safety: aligned and in non-secure RAM, checked just above.
        self.mailbox = Some(unsafe { SpeMailbox::new(queue) });
        self.mailbox_irq = irq;
        if let Some(line) = irq {
            self.hal.enable_irq(line);
        }
        Ok(())
    }

    pub fn mailbox(&self) -> Option<&SpeMailbox> {
        self.mailbox.as_ref()
    }

    /// Notes that the peer has posted messages. They're picked up at the next
    /// reschedule.
    pub fn mailbox_notify(&mut self) {
        self.mailbox_pending = true;
        self.sched.activate_schedule();
    }

    /// Takes every pending message from the queue and runs it.
    pub fn mailbox_handle(&mut self) -> Result<MailboxStatus, FaultInfo> {
        let mb = self.mailbox.as_mut().ok_or(FaultInfo::Integrity)?;
        let mut taken = [None; NUM_MAILBOX_QUEUE_SLOT];

        self.hal.mailbox_enter_critical();
        let pend = mb.pend_slots();
        for (idx, slot) in taken.iter_mut().enumerate() {
            if pend & (1 << idx) != 0 {
                *slot = Some(mb.take(idx));
            }
        }
        self.hal.mailbox_exit_critical();

        if pend == 0 {
            return Ok(MAILBOX_NO_PEND_EVENT);
        }
        for (idx, msg) in taken.iter().enumerate() {
            if let Some(msg) = msg {
                self.mailbox_dispatch(idx, msg)?;
            }
        }
        Ok(MAILBOX_SUCCESS)
    }

    /// Runs the PSA client call in `msg`, taken from slot `slot`. Calls that
    /// finish now are replied to now; the rest are replied to by the
    /// service.
    fn mailbox_dispatch(&mut self, slot: usize, msg: &MailboxMsg) -> Result<(), FaultInfo> {
        ringbuf_entry!(self.trace, Trace::MailboxSlot { slot, call_type: msg.call_type });
        if !client_id_is_ns(msg.client_id) {
            return self.mailbox_reply(slot, MAILBOX_INVAL_PARAMS);
        }
        let client = self.rpc_client(msg.client_id, slot);
        let p = &msg.params;

        let result = match msg.call_type {
            MAILBOX_PSA_FRAMEWORK_VERSION => Ok(Completion::Ready(self.psa_framework_version())),
            MAILBOX_PSA_VERSION => Ok(Completion::Ready(self.psa_version(&client, p.sid))),
            MAILBOX_PSA_CONNECT => self.psa_connect(&client, p.sid, p.version),
            MAILBOX_PSA_CALL => self.psa_call(
                &client,
                p.handle,
                p.msg_type,
                p.in_vec,
                p.in_len,
                p.out_vec,
                p.out_len,
            ),
            MAILBOX_PSA_CLOSE => self.psa_close(&client, p.handle),
            _ => return self.mailbox_reply(slot, MAILBOX_INVAL_PARAMS),
        };

        match result {
            Ok(Completion::Ready(v)) => self.mailbox_reply(slot, v as i32),
            Ok(Completion::Pending) => Ok(()),
            Err(UserError::Recoverable(status)) => self.mailbox_reply(slot, status),
            Err(UserError::Unrecoverable(fault)) => Err(fault),
        }
    }

    /// Posts `value` as the result of the call in slot `slot` and tells the
    /// peer.
    pub(crate) fn mailbox_reply(&mut self, slot: usize, value: i32) -> Result<(), FaultInfo> {
        if slot >= NUM_MAILBOX_QUEUE_SLOT {
            return Err(FaultInfo::Integrity);
        }
        let mb = self.mailbox.as_mut().ok_or(FaultInfo::Integrity)?;
        mb.write_reply(slot, value);

        self.hal.mailbox_enter_critical();
        mb.set_replied(slot);
        self.hal.mailbox_exit_critical();

        self.hal.mailbox_notify_peer();
        ringbuf_entry!(self.trace, Trace::MailboxReply { slot, value });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::mailbox::NsMailboxSlot;

    #[test]
    fn take_and_reply_touch_only_their_slot() {
        let mut q = NsMailboxQueue {
            pend_slots: 0b0101,
            replied_slots: 0b1000,
            ..NsMailboxQueue::default()
        };
        q.queue[2] = NsMailboxSlot {
            msg: MailboxMsg {
                call_type: MAILBOX_PSA_CALL,
                client_id: -3,
                ..MailboxMsg::default()
            },
            ..NsMailboxSlot::default()
        };
        let mut mb = unsafe { SpeMailbox::new(&mut q as *mut _ as usize) };

        let msg = mb.take(2);
        assert_eq!(msg.client_id, -3);
        assert_eq!(mb.pend_slots(), 0b0001);
        assert_eq!(mb.in_flight(2), Some(&msg));

        mb.write_reply(2, -131);
        mb.set_replied(2);
        assert_eq!(mb.replied_slots(), 0b1100);
        assert!(mb.in_flight(2).is_none());
        drop(mb);
        assert_eq!(q.queue[2].reply.return_val, -131);
        assert_eq!(q.queue[0].reply.return_val, 0);
    }
}
