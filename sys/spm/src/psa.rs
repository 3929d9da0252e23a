// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The PSA client and service calls.
//!
//! Client calls (`psa_connect`, `psa_call`, `psa_close` and the version
//! queries) can come from a partition's thread or, through the mailbox, from
//! a non-secure core. The caller is described by a [`ClientCtx`]; a call
//! that has to wait for the service either blocks the calling thread or, for
//! mailbox requests, leaves the slot to be completed by `psa_reply`.
//!
//! Service calls are always made by the running partition, named by its
//! index. Anything a service or client does wrong is a fault; the only
//! recoverable outcomes are the PSA statuses a client is expected to handle.

use abi::{
    FaultInfo, PsaInvec, PsaMsg, PsaOutvec, UsageError, PSA_BLOCK, PSA_DOORBELL,
    PSA_ERROR_CONNECTION_BUSY, PSA_ERROR_CONNECTION_REFUSED, PSA_ERROR_PROGRAMMER_ERROR,
    PSA_FRAMEWORK_VERSION, PSA_IPC_CALL, PSA_IPC_CONNECT, PSA_IPC_DISCONNECT, PSA_MAX_IOVEC,
    PSA_NULL_HANDLE, PSA_SUCCESS, PSA_VERSION_NONE,
};
use spmcore::{first_overlap, ByteRange};

use crate::err::{status_word, UserError};
use crate::hal::Hal;
use crate::memcheck::{Access, Accessor};
use crate::msg::{MsgBody, MsgState, Waiter, MSG_MAGIC};
use crate::pool::ConnStatus;
use crate::state::SpmState;
use crate::trace::Trace;
use crate::umem::{copy_bytes, store_outvec_len, USlice};

/// Describes whoever is making a client call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClientCtx {
    pub client_id: i32,
    pub ns: bool,
    pub privileged: bool,
    /// Partition the call is made from, if it's made from one here.
    pub partition: Option<usize>,
    pub waiter: Waiter,
}

impl ClientCtx {
    pub fn accessor(&self) -> Accessor {
        Accessor {
            partition: self.partition,
            ns: self.ns,
            privileged: self.privileged,
        }
    }
}

/// Outcome of a client call that didn't fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Finished; this is the result.
    Ready(u32),
    /// Handed to a service. The result arrives with `psa_reply`.
    Pending,
}

impl Completion {
    /// Value to put in the caller's return register now, if any.
    pub fn into_word(self) -> Option<usize> {
        match self {
            Self::Ready(v) => Some(v as usize),
            Self::Pending => None,
        }
    }
}

/// Validated, SPM-owned copies of a caller's vectors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IovecSet {
    pub invec: [PsaInvec; PSA_MAX_IOVEC],
    pub in_len: usize,
    pub outvec: [PsaOutvec; PSA_MAX_IOVEC],
    pub out_len: usize,
    /// Where the caller's own outvec table lives.
    pub caller_outvec: usize,
}

impl<H: Hal> SpmState<H> {
    /// Describes the partition at `idx` as a client.
    pub fn client_for_partition(&self, idx: usize) -> Result<ClientCtx, FaultInfo> {
        let p = self.partition(idx).ok_or(FaultInfo::Integrity)?;
        let ns = p.desc().is_ns();
        Ok(ClientCtx {
            client_id: if ns { self.image().ns_client_id } else { p.id() },
            ns,
            privileged: p.privileged(),
            partition: Some(idx),
            waiter: Waiter::Thread(idx),
        })
    }

    /// Describes a non-secure client whose request arrived in mailbox
    /// `slot`.
    pub fn rpc_client(&self, client_id: i32, slot: usize) -> ClientCtx {
        ClientCtx {
            client_id,
            ns: true,
            privileged: false,
            partition: self.ns_partition,
            waiter: Waiter::Rpc(slot),
        }
    }

    pub(crate) fn partition_accessor(&self, idx: usize) -> Result<Accessor, FaultInfo> {
        let p = self.partition(idx).ok_or(FaultInfo::Integrity)?;
        Ok(Accessor {
            partition: Some(idx),
            ns: p.desc().is_ns(),
            privileged: p.privileged(),
        })
    }

    fn authorized(&self, client: &ClientCtx, svc: usize) -> bool {
        let desc = self.services[svc].desc();
        if client.ns {
            return desc.non_secure_client;
        }
        client
            .partition
            .and_then(|p| self.partition(p))
            .is_some_and(|p| p.desc().dependencies.contains(&desc.sid))
    }

    pub fn psa_framework_version(&self) -> u32 {
        PSA_FRAMEWORK_VERSION
    }

    /// Reports the version of service `sid`, or `PSA_VERSION_NONE` if there
    /// is no such service or the client may not use it.
    pub fn psa_version(&self, client: &ClientCtx, sid: u32) -> u32 {
        match self.service_index(sid) {
            Some(svc) if self.authorized(client, svc) => self.services[svc].desc().version,
            _ => PSA_VERSION_NONE,
        }
    }

    pub fn psa_connect(
        &mut self,
        client: &ClientCtx,
        sid: u32,
        version: u32,
    ) -> Result<Completion, UserError> {
        let svc = self.service_index(sid).ok_or(UsageError::UnknownService)?;
        if !self.authorized(client, svc) {
            return Err(UsageError::NotAuthorized.into());
        }
        let desc = self.services[svc].desc();
        if !desc.version_policy.accepts(version, desc.version) {
            return Err(UsageError::VersionMismatch.into());
        }

        let Some(conn) = self.conns.alloc(client.client_id, svc) else {
            return Err(UserError::Recoverable(PSA_ERROR_CONNECTION_BUSY));
        };
        ringbuf_entry!(self.trace, Trace::Connect { sid, client_id: client.client_id });

        self.fill_msg(conn, client, PSA_IPC_CONNECT, MsgState::ConnectPending, &IovecSet::default())?;
        self.send_msg(conn, client)
    }

    pub fn psa_call(
        &mut self,
        client: &ClientCtx,
        handle: i32,
        msg_type: i32,
        in_vec: usize,
        in_len: usize,
        out_vec: usize,
        out_len: usize,
    ) -> Result<Completion, UserError> {
        if msg_type < PSA_IPC_CALL {
            return Err(UsageError::BadCallType.into());
        }
        if in_len > PSA_MAX_IOVEC || out_len > PSA_MAX_IOVEC || in_len + out_len > PSA_MAX_IOVEC {
            return Err(UsageError::TooManyIovecs.into());
        }
        let conn = self
            .conns
            .validate(handle, client.client_id)
            .ok_or(UsageError::InvalidHandle)?;
        match self.conns.get(conn).ok_or(FaultInfo::Integrity)?.status {
            ConnStatus::ConnectError => {
                return Err(UserError::Recoverable(PSA_ERROR_PROGRAMMER_ERROR));
            }
            ConnStatus::Active => return Err(UsageError::HandleBusy.into()),
            ConnStatus::Idle => (),
        }

        let vecs = self.collect_iovecs(&client.accessor(), in_vec, in_len, out_vec, out_len)?;
        ringbuf_entry!(self.trace, Trace::Call { handle, msg_type });

        self.fill_msg(conn, client, msg_type, MsgState::ActiveCall, &vecs)?;
        self.set_status(conn, ConnStatus::Active)?;
        self.send_msg(conn, client)
    }

    pub fn psa_close(&mut self, client: &ClientCtx, handle: i32) -> Result<Completion, UserError> {
        if handle == PSA_NULL_HANDLE {
            return Ok(Completion::Ready(PSA_SUCCESS as u32));
        }
        let conn = self
            .conns
            .validate(handle, client.client_id)
            .ok_or(UsageError::InvalidHandle)?;
        ringbuf_entry!(self.trace, Trace::Close { handle });
        match self.conns.get(conn).ok_or(FaultInfo::Integrity)?.status {
            ConnStatus::Active => return Err(UsageError::HandleBusy.into()),
            ConnStatus::ConnectError => {
                // The service already forgot this client; nothing to tell it.
                self.conns.free(conn);
                return Ok(Completion::Ready(PSA_SUCCESS as u32));
            }
            ConnStatus::Idle => (),
        }

        self.fill_msg(
            conn,
            client,
            PSA_IPC_DISCONNECT,
            MsgState::DisconnectPending,
            &IovecSet::default(),
        )?;
        self.set_status(conn, ConnStatus::Active)?;
        self.send_msg(conn, client)
    }

    /// Copies and checks a caller's vector tables, then checks each vector.
    ///
    /// After this returns, nothing reads the caller's tables again; only the
    /// copies in the returned set are used.
    pub(crate) fn collect_iovecs(
        &self,
        who: &Accessor,
        in_vec: usize,
        in_len: usize,
        out_vec: usize,
        out_len: usize,
    ) -> Result<IovecSet, FaultInfo> {
        if in_len > PSA_MAX_IOVEC || out_len > PSA_MAX_IOVEC || in_len + out_len > PSA_MAX_IOVEC {
            return Err(UsageError::TooManyIovecs.into());
        }
        let mut set = IovecSet {
            in_len,
            out_len,
            caller_outvec: out_vec,
            ..IovecSet::default()
        };

        let in_table = USlice::<PsaInvec>::from_raw(in_vec, in_len)?;
        self.copy_in(who, &in_table, Access::ReadOnly, &mut set.invec)?;
        // The outvec table gets lengths written back on reply.
        let out_table = USlice::<PsaOutvec>::from_raw(out_vec, out_len)?;
        self.copy_in(who, &out_table, Access::ReadWrite, &mut set.outvec)?;

        let mut ranges = heapless::Vec::<ByteRange, PSA_MAX_IOVEC>::new();
        for v in &set.invec[..in_len] {
            let r = ByteRange::new(v.base, v.len).ok_or(FaultInfo::MemoryAccess {
                address: v.base,
                size: v.len,
            })?;
            ranges.push(r).map_err(|_| FaultInfo::Integrity)?;
        }
        if first_overlap(&ranges).is_some() {
            return Err(UsageError::OverlappingInvecs.into());
        }

        for v in &set.invec[..in_len] {
            self.memory_check(who, v.base, v.len, Access::ReadOnly)?;
        }
        for v in &set.outvec[..out_len] {
            self.memory_check(who, v.base, v.len, Access::ReadWrite)?;
        }
        Ok(set)
    }

    fn set_status(&mut self, conn: usize, status: ConnStatus) -> Result<(), FaultInfo> {
        self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?.status = status;
        Ok(())
    }

    /// Fills in the message body of connection `conn` for a new request.
    fn fill_msg(
        &mut self,
        conn: usize,
        client: &ClientCtx,
        msg_type: i32,
        state: MsgState,
        vecs: &IovecSet,
    ) -> Result<(), FaultInfo> {
        let handle = self.conns.handle_of(conn);
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;

        let mut msg = PsaMsg {
            msg_type,
            handle,
            client_id: client.client_id,
            rhandle: c.rhandle,
            ..PsaMsg::default()
        };
        let mut body = MsgBody::empty(conn, c.service);
        for (i, v) in vecs.invec[..vecs.in_len].iter().enumerate() {
            msg.in_size[i] = v.len;
            body.invec[i] = *v;
        }
        for (i, v) in vecs.outvec[..vecs.out_len].iter().enumerate() {
            msg.out_size[i] = v.len;
            // Length counts what the service has written so far.
            body.outvec[i] = PsaOutvec { base: v.base, len: 0 };
        }

        body.magic = MSG_MAGIC;
        body.state = state;
        body.msg = msg;
        body.caller_outvec = vecs.caller_outvec;
        body.caller_out_len = vecs.out_len;
        body.waiter = client.waiter;
        body.ns_client = client.ns;
        c.msg = body;
        Ok(())
    }

    /// Queues connection `conn`'s message on its service, signals the
    /// service's partition, and parks the client.
    fn send_msg(&mut self, conn: usize, client: &ClientCtx) -> Result<Completion, UserError> {
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        let svc = c.service;
        if let Waiter::Thread(t) = client.waiter {
            c.msg.ack.wait(&mut self.sched, t);
        }

        let service = &mut self.services[svc];
        service.queue.enqueue(conn).map_err(|_| FaultInfo::Integrity)?;
        let (owner, signal) = (service.partition(), service.desc().signal);
        self.partitions[owner].assert_signal(&mut self.sched, signal);
        Ok(Completion::Pending)
    }

    /// Finds the delivered, unreplied message named by `handle` that
    /// belongs to a service of partition `p`.
    fn msg_for(&self, p: usize, handle: i32) -> Result<usize, FaultInfo> {
        let conn = self.conns.lookup(handle).ok_or(UsageError::InvalidMessage)?;
        let c = self.conns.get(conn).ok_or(FaultInfo::Integrity)?;
        if !c.msg.is_live() || self.services[c.service].partition() != p {
            return Err(UsageError::InvalidMessage.into());
        }
        Ok(conn)
    }

    /// Waits for any of the signals in `mask`. Returns the asserted subset,
    /// or `Pending` if the partition blocked.
    pub fn psa_wait(&mut self, p: usize, mask: u32, timeout: u32) -> Result<Completion, FaultInfo> {
        let timeout = timeout & PSA_BLOCK;
        let part = self.partitions.get_mut(p).ok_or(FaultInfo::Integrity)?;
        if part.signals_allowed() & mask == 0 {
            return Err(UsageError::InvalidSignal.into());
        }
        part.set_waiting(mask);
        let ready = part.signals_asserted() & mask;
        if timeout == PSA_BLOCK && ready == 0 {
            part.wait(&mut self.sched, p);
            return Ok(Completion::Pending);
        }
        Ok(Completion::Ready(ready))
    }

    /// Takes the oldest message for the service behind `signal` and writes
    /// its descriptor to `msg_out`.
    pub fn psa_get(&mut self, p: usize, signal: u32, msg_out: usize) -> Result<(), FaultInfo> {
        if signal.count_ones() != 1 {
            return Err(UsageError::InvalidSignal.into());
        }
        let part = self.partition(p).ok_or(FaultInfo::Integrity)?;
        if part.signals_asserted() & signal == 0 {
            return Err(UsageError::SignalNotAsserted.into());
        }
        let svc = self
            .services
            .iter()
            .position(|s| s.partition() == p && s.desc().signal == signal)
            .ok_or(UsageError::InvalidSignal)?;

        let out = USlice::<PsaMsg>::from_raw(msg_out, 1)?;
        let who = self.partition_accessor(p)?;
        self.memory_check(&who, out.base_addr(), out.byte_len(), Access::ReadWrite)?;

        let conn = self.services[svc].queue.dequeue().ok_or(FaultInfo::Integrity)?;
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        c.msg.delivered = true;
        let msg = c.msg.msg;
        self.copy_out(&who, &out, &[msg])?;

        if self.services[svc].queue.is_empty() {
            self.partitions[p].clear_signal(signal);
        }
        ringbuf_entry!(self.trace, Trace::Get { signal, handle: msg.handle });
        Ok(())
    }

    pub fn psa_set_rhandle(&mut self, p: usize, handle: i32, rhandle: usize) -> Result<(), FaultInfo> {
        let conn = self.msg_for(p, handle)?;
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        c.rhandle = rhandle;
        c.msg.msg.rhandle = rhandle;
        Ok(())
    }

    /// Checks that `handle` names a call message and `idx` a vector,
    /// returning the connection.
    fn call_vector(&self, p: usize, handle: i32, idx: usize) -> Result<usize, FaultInfo> {
        let conn = self.msg_for(p, handle)?;
        let c = self.conns.get(conn).ok_or(FaultInfo::Integrity)?;
        if c.msg.msg.msg_type < PSA_IPC_CALL {
            return Err(UsageError::WrongMessageType.into());
        }
        if idx >= PSA_MAX_IOVEC {
            return Err(UsageError::BadIovecIndex.into());
        }
        Ok(conn)
    }

    /// Copies up to `num` unread bytes of input vector `idx` into `buf`.
    /// Returns how many were copied; 0 once the vector is used up.
    pub fn psa_read(
        &mut self,
        p: usize,
        handle: i32,
        idx: usize,
        buf: usize,
        num: usize,
    ) -> Result<usize, FaultInfo> {
        let conn = self.call_vector(p, handle, idx)?;
        let remaining = self.conns.get(conn).ok_or(FaultInfo::Integrity)?.msg.msg.in_size[idx];
        let n = num.min(remaining);
        if n == 0 {
            return Ok(0);
        }

        let who = self.partition_accessor(p)?;
        self.memory_check(&who, buf, n, Access::ReadWrite)?;
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        let src = c.msg.invec[idx].base;
        // Safety: the source was checked against the client when the call
        // was made, the destination just now.
        unsafe { copy_bytes(src, buf, n) };
        Self::consume_invec(&mut c.msg, idx, n);
        Ok(n)
    }

    /// Discards up to `num` unread bytes of input vector `idx`.
    pub fn psa_skip(&mut self, p: usize, handle: i32, idx: usize, num: usize) -> Result<usize, FaultInfo> {
        let conn = self.call_vector(p, handle, idx)?;
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        let n = num.min(c.msg.msg.in_size[idx]);
        Self::consume_invec(&mut c.msg, idx, n);
        Ok(n)
    }

    fn consume_invec(body: &mut MsgBody, idx: usize, n: usize) {
        body.invec[idx].base += n;
        body.invec[idx].len -= n;
        body.msg.in_size[idx] -= n;
    }

    /// Appends `num` bytes from `buf` to output vector `idx`.
    pub fn psa_write(
        &mut self,
        p: usize,
        handle: i32,
        idx: usize,
        buf: usize,
        num: usize,
    ) -> Result<(), FaultInfo> {
        let conn = self.call_vector(p, handle, idx)?;
        let c = self.conns.get(conn).ok_or(FaultInfo::Integrity)?;
        let written = c.msg.outvec[idx].len;
        if num > c.msg.msg.out_size[idx] - written {
            return Err(UsageError::OutvecOverflow.into());
        }
        if num == 0 {
            return Ok(());
        }
        let dst = c.msg.outvec[idx].base + written;

        let who = self.partition_accessor(p)?;
        self.memory_check(&who, buf, num, Access::ReadOnly)?;
        // Safety: destination checked against the client at call time, the
        // source just now.
        unsafe { copy_bytes(buf, dst, num) };
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        c.msg.outvec[idx].len += num;
        Ok(())
    }

    /// Completes the message named by `handle` with `status`, and releases
    /// the client.
    pub fn psa_reply(&mut self, p: usize, handle: i32, status: i32) -> Result<(), FaultInfo> {
        let conn = self.msg_for(p, handle)?;
        let c = self.conns.get_mut(conn).ok_or(FaultInfo::Integrity)?;
        let msg_type = c.msg.msg.msg_type;
        let waiter = c.msg.waiter;
        let ns_client = c.msg.ns_client;
        let mut ack = c.msg.ack;

        let ret = match msg_type {
            PSA_IPC_CONNECT => match status {
                PSA_SUCCESS => {
                    c.status = ConnStatus::Idle;
                    c.msg.state = MsgState::Replied;
                    handle
                }
                PSA_ERROR_CONNECTION_REFUSED => {
                    self.conns.free(conn);
                    status
                }
                PSA_ERROR_CONNECTION_BUSY => {
                    // The slot stays allocated; the client never learns its
                    // handle, so it's only recovered by reset.
                    c.msg.state = MsgState::Replied;
                    status
                }
                _ => return Err(UsageError::BadReplyStatus.into()),
            },
            PSA_IPC_DISCONNECT => {
                self.conns.free(conn);
                PSA_SUCCESS
            }
            _ => {
                if status == PSA_ERROR_PROGRAMMER_ERROR {
                    if !ns_client {
                        return Err(UsageError::ProgrammerErrorReply.into());
                    }
                    c.status = ConnStatus::ConnectError;
                } else {
                    c.status = ConnStatus::Idle;
                }
                c.msg.state = MsgState::Replied;
                self.update_caller_outvec_len(conn)?;
                status
            }
        };
        ringbuf_entry!(self.trace, Trace::Reply { handle, status: ret });

        match waiter {
            Waiter::Thread(_) => {
                ack.wake(&mut self.sched, status_word(ret));
                if let Some(c) = self.conns.get_mut(conn) {
                    c.msg.ack = ack;
                }
            }
            Waiter::Rpc(slot) => self.mailbox_reply(slot, ret)?,
        }
        Ok(())
    }

    /// Tells the client how much the service wrote into each of its output
    /// vectors. Only the `len` fields of its table are touched.
    fn update_caller_outvec_len(&self, conn: usize) -> Result<(), FaultInfo> {
        let body = self.conns.get(conn).ok_or(FaultInfo::Integrity)?.msg;
        for i in 0..body.caller_out_len {
            if body.msg.out_size[i] != 0 {
                // Safety: the table was checked read-write against the
                // client when the call was made.
                unsafe { store_outvec_len(body.caller_outvec, i, body.outvec[i].len) };
            }
        }
        Ok(())
    }

    /// Rings partition `partition_id`'s doorbell.
    pub fn psa_notify(&mut self, partition_id: i32) -> Result<(), FaultInfo> {
        let target = self
            .partition_index(partition_id)
            .filter(|&t| !self.partitions[t].desc().is_ns())
            .ok_or(UsageError::UnknownPartition)?;
        ringbuf_entry!(self.trace, Trace::Notify { partition_id });
        self.partitions[target].assert_signal(&mut self.sched, PSA_DOORBELL);
        Ok(())
    }

    pub fn psa_clear(&mut self, p: usize) -> Result<(), FaultInfo> {
        let part = self.partitions.get_mut(p).ok_or(FaultInfo::Integrity)?;
        if part.signals_asserted() & PSA_DOORBELL == 0 {
            return Err(UsageError::DoorbellNotAsserted.into());
        }
        part.clear_signal(PSA_DOORBELL);
        Ok(())
    }
}
