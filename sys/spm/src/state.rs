// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SPM's state, and the ways into it.
//!
//! Everything the SPM knows lives in one [`SpmState`], built once from the
//! image description by [`SpmState::new`]. Hardware exception handlers reach
//! it through `startup::with_spm`; host tests own it directly and play the
//! part of the exception handlers by calling [`SpmState::svc_entry`],
//! [`SpmState::pendsv`] and [`SpmState::irq_entry`].

use abi::{FaultInfo, ImageDesc, InvokeModel, SIGNAL_RESERVED_MASK};
use heapless::Vec;

use crate::arch::{self, SavedState};
use crate::hal::Hal;
use crate::invoke::{EntryCall, Invoker, IpcInvoker, LibraryInvoker, PartitionInvoker};
use crate::mailbox::SpeMailbox;
use crate::partition::{Partition, Service};
use crate::pool::ConnPool;
use crate::thread::{Scheduler, Thread};
use crate::trace::{Ringbuf, Trace, TRACE_DEPTH};
use crate::{MAX_PARTITIONS, MAX_SERVICES};

pub struct SpmState<H: Hal> {
    pub(crate) hal: H,
    pub(crate) image: &'static ImageDesc,
    /// Indexed the same as the scheduler's threads.
    pub(crate) partitions: Vec<Partition, MAX_PARTITIONS>,
    pub(crate) services: Vec<Service, MAX_SERVICES>,
    pub(crate) conns: ConnPool,
    pub(crate) sched: Scheduler,
    pub(crate) invoker: Invoker,
    pub(crate) ns_partition: Option<usize>,
    pub(crate) mailbox: Option<SpeMailbox>,
    /// Interrupt line the non-secure core uses to signal the mailbox.
    pub(crate) mailbox_irq: Option<u32>,
    /// Set when the mailbox has been signalled and not yet looked at.
    pub(crate) mailbox_pending: bool,
    pub(crate) trace: Ringbuf<Trace, TRACE_DEPTH>,
}

fn check(cond: bool) -> Result<(), FaultInfo> {
    if cond {
        Ok(())
    } else {
        Err(FaultInfo::Integrity)
    }
}

fn valid_signal(signal: u32) -> bool {
    signal.count_ones() == 1 && signal & SIGNAL_RESERVED_MASK == 0
}

impl<H: Hal> SpmState<H> {
    /// Builds the SPM's state from an image description.
    ///
    /// The description was already checked when the image was built. It is
    /// checked again here; failures are integrity faults.
    pub fn new(image: &'static ImageDesc, hal: H) -> Result<Self, FaultInfo> {
        let mut partitions = Vec::new();
        let mut sched = Scheduler::new();
        let mut ns_partition = None;

        for (i, desc) in image.partitions.iter().enumerate() {
            check(desc.id != 0)?;
            check(!image.partitions[..i].iter().any(|o| o.id == desc.id))?;
            if desc.is_ns() {
                check(ns_partition.is_none())?;
                ns_partition = Some(i);
            } else {
                check(desc.id > 0)?;
                check(desc.data.encloses(&desc.stack))?;
            }

            let mut service_signals = 0;
            for svc in image.services.iter().filter(|s| s.partition_id == desc.id) {
                check(service_signals & svc.signal == 0)?;
                service_signals |= svc.signal;
            }
            let mut irq_signals = 0;
            for irq in desc.irqs {
                check(valid_signal(irq.signal))?;
                check((service_signals | irq_signals) & irq.signal == 0)?;
                irq_signals |= irq.signal;
            }

            partitions
                .push(Partition::new(desc, image.isolation, service_signals))
                .map_err(|_| FaultInfo::Integrity)?;
            let idx = sched.add(Thread::new(desc.priority, desc.entry, desc.stack))?;
            check(idx == i)?;
        }

        let mut services = Vec::new();
        for (i, svc) in image.services.iter().enumerate() {
            check(valid_signal(svc.signal))?;
            check(!image.services[..i].iter().any(|o| o.sid == svc.sid))?;
            let owner = image
                .partitions
                .iter()
                .position(|p| p.id == svc.partition_id && !p.is_ns())
                .ok_or(FaultInfo::Integrity)?;
            services
                .push(Service::new(svc, owner))
                .map_err(|_| FaultInfo::Integrity)?;
        }

        let invoker = match image.model {
            InvokeModel::Ipc => Invoker::Ipc(IpcInvoker),
            InvokeModel::Library => Invoker::Library(LibraryInvoker::new(partitions.len())?),
        };

        Ok(Self {
            hal,
            image,
            partitions,
            services,
            conns: ConnPool::new(),
            sched,
            invoker,
            ns_partition,
            mailbox: None,
            mailbox_irq: None,
            mailbox_pending: false,
            trace: Ringbuf::new(Trace::None),
        })
    }

    /// Gets partitions ready to run and picks the first thread.
    ///
    /// In the IPC model every partition's thread is started at its entry
    /// point. In the library model only the non-secure partition runs;
    /// secure partitions wait, idle, to be called, and interrupt lines with
    /// a handler are unmasked.
    pub fn start(&mut self) -> Result<(), FaultInfo> {
        let first = match &mut self.invoker {
            Invoker::Ipc(ipc) => {
                for (i, p) in self.partitions.iter().enumerate() {
                    let call = EntryCall::thread(p.desc().entry);
                    ipc.start(&mut self.sched, &self.partitions, i, &call)?;
                }
                self.sched.next_thread().ok_or(FaultInfo::Integrity)?
            }
            Invoker::Library(lib) => {
                let ns = self.ns_partition.ok_or(FaultInfo::Integrity)?;
                lib.boot(ns)?;
                let irqs = self.partitions.iter().flat_map(|p| p.desc().irqs.iter());
                for irq in irqs.filter(|irq| irq.handler.is_some()) {
                    self.hal.enable_irq(irq.line);
                }
                ns
            }
        };
        self.sched.take_pending();
        self.sched.set_current(first);
        self.activate_current();
        Ok(())
    }

    /// Points isolation and the exception return path at the current
    /// thread.
    pub(crate) fn activate_current(&mut self) {
        let Some(cur) = self.sched.current() else {
            return;
        };
        let p = &self.partitions[cur];
        self.hal.activate_partition(p.desc(), p.privileged());
        // Safety: the save area lives in the thread arena inside `self`,
        // which stays put once the SPM is running.
        unsafe { arch::set_current_save(self.sched.thread(cur).save()) };
        ringbuf_entry!(self.trace, Trace::Switch { to: cur });
    }

    /// Records `fault` and resets the system. Every fatal path ends here.
    pub fn panic(&mut self, fault: FaultInfo) -> ! {
        ringbuf_entry!(self.trace, Trace::Fault(fault));
        #[cfg(target_os = "none")]
        crate::fail::record(&fault);
        self.hal.system_reset()
    }

    /// Handles a pended context switch: looks at the mailbox if the
    /// non-secure core has signalled it, then switches to the most important
    /// runnable thread.
    pub fn pendsv(&mut self) {
        if let Err(fault) = self.reschedule() {
            self.panic(fault);
        }
    }

    fn reschedule(&mut self) -> Result<(), FaultInfo> {
        if core::mem::take(&mut self.mailbox_pending) {
            // An empty queue is fine here; the peer may signal spuriously.
            self.mailbox_handle()?;
        }
        self.sched.take_pending();

        if self.image.model != InvokeModel::Ipc {
            return Ok(());
        }
        let next = self.sched.next_thread().ok_or(FaultInfo::Integrity)?;
        if Some(next) != self.sched.current() {
            self.sched.set_current(next);
            self.activate_current();
        }
        Ok(())
    }

    /// Handles interrupt `line`.
    pub fn irq_entry(&mut self, line: u32) {
        ringbuf_entry!(self.trace, Trace::Irq { line });
        if Some(line) == self.mailbox_irq {
            self.mailbox_notify();
            return;
        }
        if let Err(fault) = self.irq_handler(line) {
            self.panic(fault);
        }
    }

    /// Tests whether a context switch (or mailbox work) is waiting for
    /// `pendsv`.
    pub fn switch_pending(&self) -> bool {
        self.sched.is_pending() || self.mailbox_pending
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn image(&self) -> &'static ImageDesc {
        self.image
    }

    pub fn partition(&self, idx: usize) -> Option<&Partition> {
        self.partitions.get(idx)
    }

    pub fn partition_index(&self, id: i32) -> Option<usize> {
        self.partitions.iter().position(|p| p.id() == id)
    }

    pub fn ns_partition(&self) -> Option<usize> {
        self.ns_partition
    }

    pub fn service_index(&self, sid: u32) -> Option<usize> {
        self.services.iter().position(|s| s.desc().sid == sid)
    }

    pub fn service(&self, idx: usize) -> Option<&Service> {
        self.services.get(idx)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn current(&self) -> Option<usize> {
        self.sched.current()
    }

    /// Gives access to a thread's saved registers, as a debugger (or a test
    /// standing in for the thread) would have.
    pub fn save_mut(&mut self, idx: usize) -> &mut SavedState {
        self.sched.thread_mut(idx).save_mut()
    }

    pub fn conns(&self) -> &ConnPool {
        &self.conns
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_DEPTH> {
        &self.trace
    }
}
