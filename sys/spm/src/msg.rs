// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages in flight between a client and a service.
//!
//! Each connection carries exactly one message body, embedded in its pool
//! slot, since a connection never has more than one message outstanding.
//! Services see the message through the connection's handle; the body keeps
//! the index of its connection so that nothing has to be worked out from
//! addresses.

use abi::{PsaInvec, PsaMsg, PsaOutvec, PSA_MAX_IOVEC};
use heapless::Deque;

use crate::pool::CONN_HANDLE_MAX_NUM;
use crate::thread::Event;

/// Marks a message body as filled in. Anything else in `magic` means the
/// slot holds no live message.
pub const MSG_MAGIC: u32 = 0x1515_4343;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MsgState {
    Uncreated,
    ConnectPending,
    ActiveCall,
    DisconnectPending,
    Replied,
}

/// Who is waiting for a message's reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Waiter {
    /// A local thread, blocked on the message's ack event.
    Thread(usize),
    /// A non-secure request that arrived through a mailbox slot. Nothing is
    /// blocked; the reply is posted back to the slot.
    Rpc(usize),
}

#[derive(Copy, Clone, Debug)]
pub struct MsgBody {
    pub magic: u32,
    pub state: MsgState,
    /// Set once `psa_get` has handed this message to the service.
    pub delivered: bool,
    /// Index of the owning connection.
    pub conn: usize,
    /// Index of the target service.
    pub service: usize,
    /// What the service sees. `in_size` counts down as the service reads.
    pub msg: PsaMsg,
    /// SPM-owned copies of the caller's vectors. `invec` bases advance as
    /// the service reads; `outvec` lengths count up as it writes.
    pub invec: [PsaInvec; PSA_MAX_IOVEC],
    pub outvec: [PsaOutvec; PSA_MAX_IOVEC],
    /// Address of the caller's own outvec table, and how many entries it
    /// has, so lengths can be written back on reply.
    pub caller_outvec: usize,
    pub caller_out_len: usize,
    pub ack: Event,
    pub waiter: Waiter,
    /// The client is in the non-secure world.
    pub ns_client: bool,
}

impl MsgBody {
    pub fn empty(conn: usize, service: usize) -> Self {
        Self {
            magic: 0,
            state: MsgState::Uncreated,
            delivered: false,
            conn,
            service,
            msg: PsaMsg::default(),
            invec: [PsaInvec::default(); PSA_MAX_IOVEC],
            outvec: [PsaOutvec::default(); PSA_MAX_IOVEC],
            caller_outvec: 0,
            caller_out_len: 0,
            ack: Event::default(),
            waiter: Waiter::Thread(0),
            ns_client: false,
        }
    }

    /// Checks whether a service may act on this message.
    pub fn is_live(&self) -> bool {
        self.magic == MSG_MAGIC
            && self.delivered
            && !matches!(self.state, MsgState::Uncreated | MsgState::Replied)
    }
}

/// FIFO of connection indices with a message waiting for `psa_get`.
///
/// Every connection holds at most one message, so a queue as long as the
/// pool can never overflow.
#[derive(Debug, Default)]
pub struct MsgQueue {
    q: Deque<usize, CONN_HANDLE_MAX_NUM>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, conn: usize) -> Result<(), usize> {
        self.q.push_back(conn)
    }

    pub fn dequeue(&mut self) -> Option<usize> {
        self.q.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let mut q = MsgQueue::new();
        q.enqueue(3).unwrap();
        q.enqueue(1).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn queue_holds_one_per_connection() {
        let mut q = MsgQueue::new();
        for i in 0..CONN_HANDLE_MAX_NUM {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.enqueue(99), Err(99));
    }

    #[test]
    fn liveness() {
        let mut m = MsgBody::empty(0, 0);
        assert!(!m.is_live());
        m.magic = MSG_MAGIC;
        m.state = MsgState::ActiveCall;
        assert!(!m.is_live());
        m.delivered = true;
        assert!(m.is_live());
        m.state = MsgState::Replied;
        assert!(!m.is_live());
    }
}
