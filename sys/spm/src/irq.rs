// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupts routed to partitions.
//!
//! In the IPC model an interrupt owned by a partition is turned into a
//! signal: the line is masked, the signal asserted, and the partition left to
//! handle it at thread level. The partition acknowledges with `psa_eoi`,
//! which unmasks the line.
//!
//! In the library model there are no threads to signal. The SPM instead
//! suspends whatever is running and enters the owner's registered handler
//! deprivileged; `DEPRIV_RET` from the handler unmasks the line.

use abi::{FaultInfo, InvokeModel, UsageError};

use crate::hal::Hal;
use crate::state::SpmState;

impl<H: Hal> SpmState<H> {
    /// Delivers interrupt `line` to the partition that owns it.
    ///
    /// Lines nobody owns should never have been enabled, so taking one is an
    /// integrity fault.
    pub fn irq_handler(&mut self, line: u32) -> Result<(), FaultInfo> {
        let (owner, irq) = self
            .partitions
            .iter()
            .enumerate()
            .find_map(|(i, p)| {
                p.desc()
                    .irqs
                    .iter()
                    .find(|irq| irq.line == line)
                    .map(|irq| (i, *irq))
            })
            .ok_or(FaultInfo::Integrity)?;

        if self.image.model == InvokeModel::Library {
            let handler = irq.handler.ok_or(FaultInfo::Integrity)?;
            return self.depriv_req(owner, line, handler);
        }
        self.hal.disable_irq(line);
        self.partitions[owner].assert_signal(&mut self.sched, irq.signal);
        Ok(())
    }

    /// Finds the line behind interrupt signal `signal` of partition `p`.
    fn irq_line(&self, p: usize, signal: u32) -> Result<u32, FaultInfo> {
        if signal.count_ones() != 1 {
            return Err(UsageError::InvalidSignal.into());
        }
        self.partition(p)
            .ok_or(FaultInfo::Integrity)?
            .irq_for_signal(signal)
            .ok_or_else(|| UsageError::NotIrqSignal.into())
    }

    /// Finishes handling interrupt signal `signal`: clears it and lets the
    /// line fire again.
    pub fn psa_eoi(&mut self, p: usize, signal: u32) -> Result<(), FaultInfo> {
        let line = self.irq_line(p, signal)?;
        let part = &mut self.partitions[p];
        if part.signals_asserted() & signal == 0 {
            return Err(UsageError::SignalNotAsserted.into());
        }
        part.clear_signal(signal);
        self.hal.clear_pending_irq(line);
        self.hal.enable_irq(line);
        Ok(())
    }

    pub fn psa_irq_enable(&mut self, p: usize, signal: u32) -> Result<(), FaultInfo> {
        let line = self.irq_line(p, signal)?;
        self.hal.enable_irq(line);
        Ok(())
    }

    pub fn psa_irq_disable(&mut self, p: usize, signal: u32) -> Result<(), FaultInfo> {
        let line = self.irq_line(p, signal)?;
        self.hal.disable_irq(line);
        Ok(())
    }
}
