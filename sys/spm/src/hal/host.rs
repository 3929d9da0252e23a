// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A `Hal` for running the SPM on a development machine.
//!
//! Memory attribution comes from a [`MemoryMap`]; everything else is
//! recorded so tests can look at what the SPM asked the platform to do.
//! Reset panics with `"SYSTEM RESET"`, which tests catch with
//! `#[should_panic]`.

use abi::{IsolationLevel, MemoryLayout, PartitionDesc};

use crate::hal::{Hal, MemAttr, SecurityAttr};
use crate::memcheck::MemoryMap;

/// Number of interrupt lines tracked.
const IRQ_LINES: u32 = 64;

#[derive(Clone, Debug)]
pub struct HostHal {
    map: MemoryMap,
    irq_enabled: u64,
    irq_pending: u64,
    active: Option<(i32, bool)>,
    activations: usize,
    critical_depth: u32,
    peer_notifications: usize,
}

impl HostHal {
    pub fn new(layout: MemoryLayout, isolation: IsolationLevel) -> Self {
        Self {
            map: MemoryMap::new(layout, isolation),
            irq_enabled: 0,
            irq_pending: 0,
            active: None,
            activations: 0,
            critical_depth: 0,
            peer_notifications: 0,
        }
    }

    pub fn irq_enabled(&self, line: u32) -> bool {
        line < IRQ_LINES && self.irq_enabled & (1 << line) != 0
    }

    /// Marks an interrupt as pending, as the hardware would when it fires.
    pub fn raise_irq(&mut self, line: u32) {
        if line < IRQ_LINES {
            self.irq_pending |= 1 << line;
        }
    }

    pub fn irq_pending(&self, line: u32) -> bool {
        line < IRQ_LINES && self.irq_pending & (1 << line) != 0
    }

    /// Id and privilege of the partition isolation was last set up for.
    pub fn active_partition(&self) -> Option<(i32, bool)> {
        self.active
    }

    pub fn activations(&self) -> usize {
        self.activations
    }

    pub fn in_mailbox_critical(&self) -> bool {
        self.critical_depth != 0
    }

    pub fn peer_notifications(&self) -> usize {
        self.peer_notifications
    }
}

impl Hal for HostHal {
    fn mem_security_attr(&self, base: usize, size: usize) -> SecurityAttr {
        self.map.security_attr(base, size)
    }

    fn secure_access_attr(
        &self,
        base: usize,
        size: usize,
        partition: &PartitionDesc,
    ) -> MemAttr {
        self.map.secure_access_attr(base, size, partition)
    }

    fn ns_access_attr(&self, base: usize, size: usize) -> MemAttr {
        self.map.ns_access_attr(base, size)
    }

    fn enable_irq(&mut self, line: u32) {
        if line < IRQ_LINES {
            self.irq_enabled |= 1 << line;
        }
    }

    fn disable_irq(&mut self, line: u32) {
        if line < IRQ_LINES {
            self.irq_enabled &= !(1 << line);
        }
    }

    fn clear_pending_irq(&mut self, line: u32) {
        if line < IRQ_LINES {
            self.irq_pending &= !(1 << line);
        }
    }

    fn activate_partition(&mut self, partition: &PartitionDesc, privileged: bool) {
        self.active = Some((partition.id, privileged));
        self.activations += 1;
    }

    fn mailbox_enter_critical(&mut self) {
        self.critical_depth += 1;
    }

    fn mailbox_exit_critical(&mut self) {
        self.critical_depth = self.critical_depth.saturating_sub(1);
    }

    fn mailbox_notify_peer(&mut self) {
        self.peer_notifications += 1;
    }

    fn system_reset(&mut self) -> ! {
        crate::arch::reset()
    }
}
