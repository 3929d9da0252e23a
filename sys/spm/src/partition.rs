// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime state of partitions and services.

use abi::{
    IsolationLevel, PartitionDesc, PartitionFlags, ServiceDesc, PSA_DOORBELL,
};

use crate::msg::MsgQueue;
use crate::thread::{Event, Scheduler};

#[derive(Debug)]
pub struct Partition {
    desc: &'static PartitionDesc,
    privileged: bool,
    /// Every signal this partition may wait for: its services', its
    /// interrupts', and (secure partitions only) the doorbell.
    signals_allowed: u32,
    signals_asserted: u32,
    signals_waiting: u32,
    event: Event,
}

impl Partition {
    pub fn new(
        desc: &'static PartitionDesc,
        isolation: IsolationLevel,
        service_signals: u32,
    ) -> Self {
        let irq_signals = desc.irqs.iter().fold(0, |acc, irq| acc | irq.signal);
        let doorbell = if desc.is_ns() { 0 } else { PSA_DOORBELL };
        Self {
            desc,
            privileged: Self::privilege_for(desc, isolation),
            signals_allowed: service_signals | irq_signals | doorbell,
            signals_asserted: 0,
            signals_waiting: 0,
            event: Event::default(),
        }
    }

    /// Works out the privilege a partition runs at. Everything secure is
    /// privileged at level 1; above that, only PSA RoT is.
    pub fn privilege_for(desc: &PartitionDesc, isolation: IsolationLevel) -> bool {
        if desc.is_ns() {
            return false;
        }
        match isolation {
            IsolationLevel::Level1 => true,
            IsolationLevel::Level2 | IsolationLevel::Level3 => {
                desc.flags.contains(PartitionFlags::PSA_ROT)
            }
        }
    }

    pub fn desc(&self) -> &'static PartitionDesc {
        self.desc
    }

    pub fn id(&self) -> i32 {
        self.desc.id
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn signals_allowed(&self) -> u32 {
        self.signals_allowed
    }

    pub fn signals_asserted(&self) -> u32 {
        self.signals_asserted
    }

    pub fn signals_waiting(&self) -> u32 {
        self.signals_waiting
    }

    pub fn set_waiting(&mut self, mask: u32) {
        self.signals_waiting = mask;
    }

    pub fn clear_signal(&mut self, signal: u32) {
        self.signals_asserted &= !signal;
    }

    /// Blocks this partition's thread (`thread`) until a waited-for signal
    /// shows up.
    pub fn wait(&mut self, sched: &mut Scheduler, thread: usize) {
        self.event.wait(sched, thread);
    }

    /// Asserts `signal`, waking the partition if it's waiting for it. The
    /// woken `psa_wait` returns every waited-for signal now asserted.
    pub fn assert_signal(&mut self, sched: &mut Scheduler, signal: u32) {
        self.signals_asserted |= signal;
        let ready = self.signals_asserted & self.signals_waiting;
        if ready != 0 {
            self.event.wake(sched, ready as usize);
        }
    }

    /// Finds which of this partition's interrupts raises `signal`.
    pub fn irq_for_signal(&self, signal: u32) -> Option<u32> {
        self.desc
            .irqs
            .iter()
            .find(|irq| irq.signal == signal)
            .map(|irq| irq.line)
    }
}

#[derive(Debug)]
pub struct Service {
    desc: &'static ServiceDesc,
    /// Index of the owning partition.
    partition: usize,
    pub queue: MsgQueue,
}

impl Service {
    pub fn new(desc: &'static ServiceDesc, partition: usize) -> Self {
        Self {
            desc,
            partition,
            queue: MsgQueue::new(),
        }
    }

    pub fn desc(&self) -> &'static ServiceDesc {
        self.desc
    }

    pub fn partition(&self) -> usize {
        self.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Thread, ThreadState};
    use abi::{IrqDesc, MemRange};

    static IRQS: [IrqDesc; 1] = [IrqDesc {
        line: 7,
        signal: 0x100,
        handler: None,
    }];

    static DESC: PartitionDesc = PartitionDesc {
        id: 5,
        flags: PartitionFlags::APP_ROT.union(PartitionFlags::IPC),
        priority: 2,
        entry: 0x1000_0001,
        code: MemRange::new(0x1000_0000, 0x1000_1000),
        data: MemRange::new(0x3000_0000, 0x3000_1000),
        stack: MemRange::new(0x3000_0800, 0x3000_1000),
        dependencies: &[],
        irqs: &IRQS,
    };

    #[test]
    fn privilege_by_level() {
        assert!(Partition::privilege_for(&DESC, IsolationLevel::Level1));
        assert!(!Partition::privilege_for(&DESC, IsolationLevel::Level2));
    }

    #[test]
    fn allowed_signals() {
        let p = Partition::new(&DESC, IsolationLevel::Level2, 0x30);
        assert_eq!(p.signals_allowed(), 0x30 | 0x100 | PSA_DOORBELL);
        assert_eq!(p.irq_for_signal(0x100), Some(7));
        assert_eq!(p.irq_for_signal(0x10), None);

        static NS: PartitionDesc = PartitionDesc {
            id: -1,
            flags: PartitionFlags::empty(),
            priority: 3,
            entry: 0x0010_0001,
            code: MemRange::new(0x0010_0000, 0x0011_0000),
            data: MemRange::new(0x2000_0000, 0x2000_1000),
            stack: MemRange::new(0x2000_0800, 0x2000_1000),
            dependencies: &[],
            irqs: &[],
        };
        let ns = Partition::new(&NS, IsolationLevel::Level2, 0);
        assert_eq!(ns.signals_allowed(), 0);
    }

    #[test]
    fn assert_wakes_only_when_waited_for() {
        let mut sched = Scheduler::new();
        sched
            .add(Thread::new(2, DESC.entry, DESC.stack))
            .unwrap();
        sched.start(0).unwrap();
        let mut p = Partition::new(&DESC, IsolationLevel::Level2, 0x30);
        p.set_waiting(0x10);
        p.wait(&mut sched, 0);

        p.assert_signal(&mut sched, 0x20);
        assert_eq!(sched.thread(0).state(), ThreadState::Block);

        p.assert_signal(&mut sched, 0x10);
        assert_eq!(sched.thread(0).state(), ThreadState::Running);
        assert_eq!(p.signals_asserted(), 0x30);
    }
}
