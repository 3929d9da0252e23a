// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! How partitions are entered and left.
//!
//! In the IPC model each partition has a thread that's started once at its
//! entry point and runs until it exits. In the library model partitions are
//! passive: a secure function is entered on the caller's request, runs to
//! completion and returns to the caller, and only one partition runs at a
//! time. Both sit behind [`PartitionInvoker`], and the SPM picks one from the
//! image's [`InvokeModel`](abi::InvokeModel).

use abi::{FaultInfo, SfnRequest, UsageError, PSA_MAX_IOVEC, PSA_SUCCESS};
use heapless::Vec;
use spmcore::MemoryRegion;

use crate::arch;
use crate::err::status_word;
use crate::hal::Hal;
use crate::memcheck::Access;
use crate::partition::Partition;
use crate::psa::IovecSet;
use crate::state::SpmState;
use crate::thread::Scheduler;
use crate::trace::Trace;
use crate::umem::{store_outvec_len, USlice};
use crate::MAX_PARTITIONS;

/// Where and how to enter a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EntryCall {
    pub entry: usize,
    pub args: [usize; 4],
    /// Partition to go back to when this one returns, if any.
    pub caller: Option<usize>,
    /// Client id the entered partition reports as its caller.
    pub client_id: i32,
    /// The call came from the non-secure world.
    pub ns: bool,
}

impl EntryCall {
    /// A thread starting at its entry point, with nobody to return to.
    pub fn thread(entry: usize) -> Self {
        Self {
            entry,
            args: [0; 4],
            caller: None,
            client_id: 0,
            ns: false,
        }
    }
}

pub trait PartitionInvoker {
    /// Enters partition `target` as described by `call`.
    fn start(
        &mut self,
        sched: &mut Scheduler,
        partitions: &[Partition],
        target: usize,
        call: &EntryCall,
    ) -> Result<(), FaultInfo>;

    /// Leaves partition `target`, handing `retval` to whoever started it.
    fn return_from(
        &mut self,
        sched: &mut Scheduler,
        partitions: &[Partition],
        target: usize,
        retval: usize,
    ) -> Result<(), FaultInfo>;
}

/// Thread-per-partition invocation.
#[derive(Copy, Clone, Debug, Default)]
pub struct IpcInvoker;

impl PartitionInvoker for IpcInvoker {
    fn start(
        &mut self,
        sched: &mut Scheduler,
        partitions: &[Partition],
        target: usize,
        call: &EntryCall,
    ) -> Result<(), FaultInfo> {
        let p = partitions.get(target).ok_or(FaultInfo::Integrity)?;
        let t = sched.thread_mut(target);
        let stack = *t.stack();
        if !stack.is_empty() {
            arch::init_thread_context(t.save_mut(), call.entry, call.args[0], &stack, p.privileged());
        }
        // An empty stack is caught, and the thread marked invalid, here.
        sched.start(target)
    }

    fn return_from(
        &mut self,
        sched: &mut Scheduler,
        _partitions: &[Partition],
        target: usize,
        _retval: usize,
    ) -> Result<(), FaultInfo> {
        sched.exit(target);
        Ok(())
    }
}

/// State of a partition in the library model.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionState {
    Uninit,
    Idle,
    Running,
    HandlingIrq,
    Suspended,
    Blocked,
    Closed,
}

#[derive(Copy, Clone, Debug)]
struct LibraryCtx {
    state: PartitionState,
    caller: Option<usize>,
    caller_client_id: i32,
    ns_caller: bool,
    /// Copies of the caller's vectors. The secure function is handed these,
    /// never the caller's tables.
    iovec: IovecSet,
    /// Partition an interrupt handler preempted.
    preempted: Option<usize>,
    /// Line whose handler is running; masked until it returns.
    irq_line: Option<u32>,
}

impl LibraryCtx {
    const fn new() -> Self {
        Self {
            state: PartitionState::Uninit,
            caller: None,
            caller_client_id: 0,
            ns_caller: false,
            iovec: IovecSet {
                invec: [abi::PsaInvec { base: 0, len: 0 }; PSA_MAX_IOVEC],
                in_len: 0,
                outvec: [abi::PsaOutvec { base: 0, len: 0 }; PSA_MAX_IOVEC],
                out_len: 0,
                caller_outvec: 0,
            },
            preempted: None,
            irq_line: None,
        }
    }
}

/// Secure-function invocation.
#[derive(Debug)]
pub struct LibraryInvoker {
    ctx: Vec<LibraryCtx, MAX_PARTITIONS>,
    /// Nonzero while the non-secure world has a call into the secure one
    /// outstanding. Non-secure calls aren't re-entrant.
    secure_lock: u32,
}

impl LibraryInvoker {
    pub fn new(partitions: usize) -> Result<Self, FaultInfo> {
        let mut ctx = Vec::new();
        for _ in 0..partitions {
            ctx.push(LibraryCtx::new()).map_err(|_| FaultInfo::Integrity)?;
        }
        Ok(Self { ctx, secure_lock: 0 })
    }

    /// Marks every partition ready to be called, with `ns` running.
    pub fn boot(&mut self, ns: usize) -> Result<(), FaultInfo> {
        for c in self.ctx.iter_mut() {
            c.state = PartitionState::Idle;
        }
        self.ctx_mut(ns)?.state = PartitionState::Running;
        Ok(())
    }

    pub fn state(&self, idx: usize) -> Option<PartitionState> {
        self.ctx.get(idx).map(|c| c.state)
    }

    pub fn secure_lock(&self) -> u32 {
        self.secure_lock
    }

    pub fn caller_client_id(&self, idx: usize) -> Option<i32> {
        self.ctx.get(idx).map(|c| c.caller_client_id)
    }

    fn ctx_mut(&mut self, idx: usize) -> Result<&mut LibraryCtx, FaultInfo> {
        self.ctx.get_mut(idx).ok_or(FaultInfo::Integrity)
    }

    /// Stores the caller's vectors with partition `target` and returns the
    /// arguments its secure function is entered with.
    fn stage_iovecs(&mut self, target: usize, vecs: &IovecSet) -> Result<[usize; 4], FaultInfo> {
        let c = self.ctx_mut(target)?;
        c.iovec = *vecs;
        Ok([
            c.iovec.invec.as_ptr() as usize,
            vecs.in_len,
            c.iovec.outvec.as_mut_ptr() as usize,
            vecs.out_len,
        ])
    }
}

impl PartitionInvoker for LibraryInvoker {
    fn start(
        &mut self,
        sched: &mut Scheduler,
        partitions: &[Partition],
        target: usize,
        call: &EntryCall,
    ) -> Result<(), FaultInfo> {
        let p = partitions.get(target).ok_or(FaultInfo::Integrity)?;
        if let Some(caller) = call.caller {
            if self.ctx_mut(caller)?.state != PartitionState::Running {
                return Err(UsageError::CallerNotRunning.into());
            }
        }
        if self.ctx_mut(target)?.state != PartitionState::Idle {
            return Err(UsageError::PartitionNotIdle.into());
        }
        if call.ns && self.secure_lock != 0 {
            return Err(UsageError::SecureDomainLocked.into());
        }

        if let Some(caller) = call.caller {
            self.ctx_mut(caller)?.state = PartitionState::Blocked;
        }
        if call.ns {
            self.secure_lock += 1;
        }
        let c = self.ctx_mut(target)?;
        c.state = PartitionState::Running;
        c.caller = call.caller;
        c.caller_client_id = call.client_id;
        c.ns_caller = call.ns;

        let t = sched.thread_mut(target);
        let stack = *t.stack();
        if stack.is_empty() {
            return Err(FaultInfo::Integrity);
        }
        arch::enter_function(t.save_mut(), call.entry, call.args, &stack, p.privileged());
        sched.set_current(target);
        Ok(())
    }

    fn return_from(
        &mut self,
        sched: &mut Scheduler,
        _partitions: &[Partition],
        target: usize,
        retval: usize,
    ) -> Result<(), FaultInfo> {
        let c = self.ctx_mut(target)?;
        let caller = match (c.state, c.caller) {
            (PartitionState::Running, Some(caller)) => caller,
            _ => return Err(UsageError::NothingToReturnTo.into()),
        };
        let ns = c.ns_caller;
        if self.ctx_mut(caller)?.state != PartitionState::Blocked {
            return Err(UsageError::NothingToReturnTo.into());
        }

        let c = self.ctx_mut(target)?;
        c.state = PartitionState::Idle;
        c.caller = None;
        c.ns_caller = false;
        self.ctx_mut(caller)?.state = PartitionState::Running;
        if ns {
            self.secure_lock = self.secure_lock.checked_sub(1).ok_or(FaultInfo::Integrity)?;
        }
        sched.set_retval(caller, retval);
        sched.set_current(caller);
        Ok(())
    }
}

pub enum Invoker {
    Ipc(IpcInvoker),
    Library(LibraryInvoker),
}

impl Invoker {
    pub fn library(&self) -> Option<&LibraryInvoker> {
        match self {
            Self::Library(lib) => Some(lib),
            Self::Ipc(_) => None,
        }
    }

    fn library_mut(&mut self) -> Result<&mut LibraryInvoker, FaultInfo> {
        match self {
            Self::Library(lib) => Ok(lib),
            Self::Ipc(_) => Err(UsageError::BadSyscallNumber.into()),
        }
    }
}

impl<H: Hal> SpmState<H> {
    fn running_partition(&self) -> Result<usize, FaultInfo> {
        self.sched.current().ok_or(FaultInfo::Integrity)
    }

    /// Calls the secure function described by the `SfnRequest` at
    /// `req_addr` on behalf of the running partition.
    pub fn sfn_request(&mut self, req_addr: usize) -> Result<(), FaultInfo> {
        let caller = self.running_partition()?;
        let who = self.partition_accessor(caller)?;
        let table = USlice::<SfnRequest>::from_raw(req_addr, 1)?;
        let mut req = [SfnRequest::default()];
        self.copy_in(&who, &table, Access::ReadOnly, &mut req)?;
        let req = req[0];

        if (req.ns_caller != 0) != who.ns {
            return Err(UsageError::NotAuthorized.into());
        }
        let target = self
            .partition_index(req.sp_id)
            .filter(|&t| !self.partitions[t].desc().is_ns())
            .ok_or(UsageError::UnknownPartition)?;
        if !self.partitions[target].desc().code.contains(req.sfn) {
            return Err(UsageError::BadEntryPoint.into());
        }
        let [in_vec, in_len, out_vec, out_len] = req.args;
        let vecs = self.collect_iovecs(&who, in_vec, in_len, out_vec, out_len)?;
        let client_id = self.client_for_partition(caller)?.client_id;

        let lib = self.invoker.library_mut()?;
        // Check before staging, so a refused call leaves the callee alone.
        if lib.state(target) != Some(PartitionState::Idle) {
            return Err(UsageError::PartitionNotIdle.into());
        }
        let args = lib.stage_iovecs(target, &vecs)?;
        let call = EntryCall {
            entry: req.sfn,
            args,
            caller: Some(caller),
            client_id,
            ns: who.ns,
        };
        lib.start(&mut self.sched, &self.partitions, target, &call)?;
        ringbuf_entry!(self.trace, Trace::SfnRequest { from: caller, to: target });
        self.activate_current();
        Ok(())
    }

    /// Returns `retval` from the running secure function to its caller,
    /// reporting how much it wrote into each output vector.
    pub fn sfn_return(&mut self, retval: usize) -> Result<(), FaultInfo> {
        let target = self.running_partition()?;
        let lib = self.invoker.library_mut()?;
        let c = lib.ctx.get(target).ok_or(FaultInfo::Integrity)?;
        if c.state != PartitionState::Running || c.caller.is_none() {
            return Err(UsageError::NothingToReturnTo.into());
        }
        let vecs = c.iovec;
        for i in 0..vecs.out_len {
            // Safety: the caller's table was checked read-write when the
            // call was made.
            unsafe { store_outvec_len(vecs.caller_outvec, i, vecs.outvec[i].len) };
        }

        lib.return_from(&mut self.sched, &self.partitions, target, retval)?;
        if let Some(caller) = self.sched.current() {
            ringbuf_entry!(self.trace, Trace::SfnReturn { from: target, to: caller });
        }
        self.activate_current();
        Ok(())
    }

    /// Client id of whoever called the running secure function.
    pub fn get_caller_client_id(&self) -> Result<i32, FaultInfo> {
        let cur = self.running_partition()?;
        let lib = self.invoker.library().ok_or(UsageError::BadSyscallNumber)?;
        match lib.ctx.get(cur) {
            Some(c) if c.caller.is_some() => Ok(c.caller_client_id),
            _ => Err(UsageError::NothingToReturnTo.into()),
        }
    }

    /// Suspends the running partition and enters `target`'s handler for
    /// interrupt `line`, unprivileged. The line stays masked until the
    /// handler returns.
    pub(crate) fn depriv_req(
        &mut self,
        target: usize,
        line: u32,
        handler: usize,
    ) -> Result<(), FaultInfo> {
        let cur = self.running_partition()?;
        let lib = self.invoker.library_mut()?;
        if lib.state(cur) != Some(PartitionState::Running) {
            return Err(UsageError::CallerNotRunning.into());
        }
        if lib.state(target) != Some(PartitionState::Idle) {
            return Err(UsageError::PartitionNotIdle.into());
        }

        self.hal.disable_irq(line);
        lib.ctx_mut(cur)?.state = PartitionState::Suspended;
        let c = lib.ctx_mut(target)?;
        c.state = PartitionState::HandlingIrq;
        c.preempted = Some(cur);
        c.irq_line = Some(line);

        let t = self.sched.thread_mut(target);
        let stack = *t.stack();
        if stack.is_empty() {
            return Err(FaultInfo::Integrity);
        }
        arch::enter_function(t.save_mut(), handler, [0; 4], &stack, false);
        self.sched.set_current(target);
        ringbuf_entry!(self.trace, Trace::Depriv { line, to: target });
        self.activate_current();
        Ok(())
    }

    /// Ends the running interrupt handler, unmasks its line and resumes what
    /// it preempted.
    pub fn depriv_ret(&mut self) -> Result<(), FaultInfo> {
        let cur = self.running_partition()?;
        let lib = self.invoker.library_mut()?;
        let c = lib.ctx_mut(cur)?;
        let (preempted, line) = match (c.state, c.preempted, c.irq_line) {
            (PartitionState::HandlingIrq, Some(p), Some(line)) => (p, line),
            _ => return Err(UsageError::NothingToReturnTo.into()),
        };
        c.state = PartitionState::Idle;
        c.preempted = None;
        c.irq_line = None;

        let p = lib.ctx_mut(preempted)?;
        if p.state != PartitionState::Suspended {
            return Err(FaultInfo::Integrity);
        }
        p.state = PartitionState::Running;
        self.hal.clear_pending_irq(line);
        self.hal.enable_irq(line);
        self.sched.set_retval(preempted, status_word(PSA_SUCCESS));
        self.sched.set_current(preempted);
        self.activate_current();
        Ok(())
    }

    /// Ends the running partition's thread.
    pub fn exit_thread(&mut self) -> Result<(), FaultInfo> {
        let cur = self.running_partition()?;
        match &mut self.invoker {
            Invoker::Ipc(ipc) => ipc.return_from(&mut self.sched, &self.partitions, cur, 0),
            Invoker::Library(_) => Err(UsageError::BadSyscallNumber.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{IsolationLevel, MemRange, PartitionDesc, PartitionFlags};

    use crate::thread::Thread;

    static NS: PartitionDesc = PartitionDesc {
        id: -1,
        flags: PartitionFlags::empty(),
        priority: 3,
        entry: 0x0010_0001,
        code: MemRange::new(0x0010_0000, 0x0011_0000),
        data: MemRange::new(0x2000_0000, 0x2000_1000),
        stack: MemRange::new(0x2000_0000, 0x2000_1000),
        dependencies: &[],
        irqs: &[],
    };

    static SP: PartitionDesc = PartitionDesc {
        id: 0x100,
        flags: PartitionFlags::PSA_ROT,
        priority: 1,
        entry: 0x1000_0001,
        code: MemRange::new(0x1000_0000, 0x1001_0000),
        data: MemRange::new(0x3000_0000, 0x3000_1000),
        stack: MemRange::new(0x3000_0800, 0x3000_1000),
        dependencies: &[],
        irqs: &[],
    };

    static SP2: PartitionDesc = PartitionDesc {
        id: 0x101,
        flags: PartitionFlags::empty(),
        priority: 2,
        entry: 0x1001_0001,
        code: MemRange::new(0x1001_0000, 0x1002_0000),
        data: MemRange::new(0x3000_1000, 0x3000_2000),
        stack: MemRange::new(0x3000_1800, 0x3000_2000),
        dependencies: &[],
        irqs: &[],
    };

    fn setup() -> (Scheduler, [Partition; 3]) {
        let mut sched = Scheduler::new();
        let parts = [
            Partition::new(&NS, IsolationLevel::Level1, 0),
            Partition::new(&SP, IsolationLevel::Level1, 0),
            Partition::new(&SP2, IsolationLevel::Level1, 0),
        ];
        for p in &parts {
            let d = p.desc();
            sched.add(Thread::new(d.priority, d.entry, d.stack)).unwrap();
        }
        (sched, parts)
    }

    fn ns_call(entry: usize) -> EntryCall {
        EntryCall {
            entry,
            args: [1, 2, 3, 4],
            caller: Some(0),
            client_id: -1,
            ns: true,
        }
    }

    #[test]
    fn secure_lock_blocks_reentry() {
        let (mut sched, parts) = setup();
        let mut lib = LibraryInvoker::new(3).unwrap();
        lib.boot(0).unwrap();

        lib.start(&mut sched, &parts, 1, &ns_call(0x1000_0101)).unwrap();
        assert_eq!(lib.secure_lock(), 1);
        assert_eq!(lib.state(0), Some(PartitionState::Blocked));
        assert_eq!(lib.state(1), Some(PartitionState::Running));
        assert_eq!(sched.current(), Some(1));
        assert_eq!(sched.thread(1).save().pc(), 0x1000_0101);
        assert_eq!(sched.thread(1).save().entry_args(), [1, 2, 3, 4]);

        // Blocked caller can't call again, locked or not.
        assert_eq!(
            lib.start(&mut sched, &parts, 1, &ns_call(0x1000_0101)),
            Err(UsageError::CallerNotRunning.into())
        );

        lib.return_from(&mut sched, &parts, 1, 7).unwrap();
        assert_eq!(lib.secure_lock(), 0);
        assert_eq!(lib.state(0), Some(PartitionState::Running));
        assert_eq!(lib.state(1), Some(PartitionState::Idle));
        assert_eq!(sched.current(), Some(0));
        assert_eq!(sched.thread(0).save().return_value(), 7);
    }

    #[test]
    fn second_ns_entry_is_locked_out() {
        let (mut sched, parts) = setup();
        let mut lib = LibraryInvoker::new(3).unwrap();
        lib.boot(0).unwrap();
        // Calls from the non-secure core arrive with no local caller.
        let remote = |entry| EntryCall {
            entry,
            args: [0; 4],
            caller: None,
            client_id: -2,
            ns: true,
        };

        lib.start(&mut sched, &parts, 1, &remote(0x1000_0101)).unwrap();
        assert_eq!(
            lib.start(&mut sched, &parts, 2, &remote(0x1001_0101)),
            Err(UsageError::SecureDomainLocked.into())
        );
        assert_eq!(lib.state(2), Some(PartitionState::Idle));
        assert_eq!(lib.caller_client_id(1), Some(-2));

        // Secure callers don't need the lock.
        let nested = EntryCall {
            entry: 0x1001_0101,
            args: [0; 4],
            caller: Some(1),
            client_id: 0x100,
            ns: false,
        };
        lib.start(&mut sched, &parts, 2, &nested).unwrap();
        assert_eq!(lib.secure_lock(), 1);
        assert_eq!(lib.state(1), Some(PartitionState::Blocked));
    }

    #[test]
    fn context_table_is_bounded() {
        assert!(LibraryInvoker::new(MAX_PARTITIONS).is_ok());
        assert_eq!(
            LibraryInvoker::new(MAX_PARTITIONS + 1).err(),
            Some(FaultInfo::Integrity)
        );
    }

    #[test]
    fn nothing_to_return_to() {
        let (mut sched, parts) = setup();
        let mut lib = LibraryInvoker::new(3).unwrap();
        lib.boot(0).unwrap();
        assert_eq!(
            lib.return_from(&mut sched, &parts, 1, 0),
            Err(UsageError::NothingToReturnTo.into())
        );
    }

    #[test]
    fn ipc_start_and_exit() {
        let (mut sched, parts) = setup();
        let mut ipc = IpcInvoker;
        for i in 0..2 {
            let call = EntryCall::thread(parts[i].desc().entry);
            ipc.start(&mut sched, &parts, i, &call).unwrap();
        }
        assert_eq!(sched.next_thread(), Some(1));
        ipc.return_from(&mut sched, &parts, 1, 0).unwrap();
        assert_eq!(sched.next_thread(), Some(0));
    }
}
